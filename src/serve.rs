//! # HTTP Serving Surface
//!
//! A small axum application exposing the loaded model:
//!
//! - `GET /health` reports liveness and the published model name.
//! - `POST /predict` takes `{"features": {...}}` and returns the scored
//!   encounter.
//!
//! Per-request failures map to structured error envelopes instead of
//! panics: unknown feature keys are a 422 carrying the offending keys,
//! everything else recoverable is a 400 with a message. A bundle that
//! fails to load aborts startup before the socket binds.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::infer::{PredictError, Prediction, ReadmissionModel};

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to load the model bundle: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    features: Map<String, Value>,
}

/// Scoring failure wrapped for the wire.
#[derive(Debug)]
pub struct ApiError(PredictError);

impl From<PredictError> for ApiError {
    fn from(error: PredictError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            PredictError::UnknownFeatures { extra_keys } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "detail": {
                        "message": "request contains unknown feature keys",
                        "extra_keys": extra_keys,
                    }
                })),
            )
                .into_response(),
            other => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": other.to_string() })),
            )
                .into_response(),
        }
    }
}

pub fn router(model: Arc<ReadmissionModel>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .with_state(model)
}

async fn health(State(model): State<Arc<ReadmissionModel>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model_name": model.model_name(),
    }))
}

async fn predict(
    State(model): State<Arc<ReadmissionModel>>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<Prediction>, ApiError> {
    let prediction = model.predict(&request.features)?;
    Ok(Json(prediction))
}

/// Loads the bundle and serves it until the process is stopped.
pub async fn run(artifact_dir: &Path, address: SocketAddr) -> Result<(), ServeError> {
    let model = ReadmissionModel::load(artifact_dir)?;
    log::info!(
        "serving model '{}' (threshold {:.2}) on http://{address}",
        model.model_name(),
        model.threshold()
    );

    let app = router(Arc::new(model));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelBundle;
    use crate::classifier::{ClassifierSpec, LogisticConfig};
    use crate::data::{Column, ColumnData, FeatureTable};
    use crate::preprocess::Preprocessor;
    use ndarray::array;

    fn served_model() -> Arc<ReadmissionModel> {
        let table = FeatureTable::from_columns(vec![
            Column {
                name: "num_medications".to_string(),
                data: ColumnData::Numeric(vec![Some(1.0), Some(2.0), Some(8.0), Some(9.0)]),
            },
            Column {
                name: "insulin".to_string(),
                data: ColumnData::Categorical(vec![
                    Some("No".to_string()),
                    Some("No".to_string()),
                    Some("Up".to_string()),
                    Some("Up".to_string()),
                ]),
            },
        ]);
        let target = array![0.0, 0.0, 1.0, 1.0];

        let mut preprocessor = Preprocessor::new(30);
        let design = preprocessor.fit_transform(&table).unwrap();
        let spec = ClassifierSpec::Logistic(LogisticConfig::default());
        let classifier = spec.fit(design.view(), target.view()).unwrap();

        Arc::new(ReadmissionModel::from_bundle(ModelBundle {
            model_name: "logreg".to_string(),
            threshold: 0.5,
            feature_columns: vec!["num_medications".to_string(), "insulin".to_string()],
            preprocessor: preprocessor.state().unwrap().clone(),
            classifier,
        }))
    }

    fn features(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be a JSON object"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_the_model_name() {
        let body = health(State(served_model())).await;
        assert_eq!(body.0["status"], "ok");
        assert_eq!(body.0["model_name"], "logreg");
    }

    #[tokio::test]
    async fn predict_returns_the_scored_encounter() {
        let request = PredictRequest {
            features: features(json!({"num_medications": 9.0, "insulin": "Up"})),
        };
        let Json(prediction) = predict(State(served_model()), Json(request))
            .await
            .unwrap();

        assert_eq!(prediction.model_name, "logreg");
        assert_eq!(prediction.threshold, 0.5);
        assert_eq!(prediction.label, 1);
        assert!((0.0..=1.0).contains(&prediction.probability));
    }

    #[tokio::test]
    async fn unknown_keys_map_to_422_with_the_sorted_key_list() {
        let request = PredictRequest {
            features: features(json!({"zeta": 1, "alpha": 2, "num_medications": 3.0})),
        };
        let error = predict(State(served_model()), Json(request))
            .await
            .unwrap_err();

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = response_json(response).await;
        assert_eq!(body["detail"]["extra_keys"], json!(["alpha", "zeta"]));
    }

    #[tokio::test]
    async fn bad_values_map_to_400_with_a_message() {
        let request = PredictRequest {
            features: features(json!({"num_medications": "many"})),
        };
        let error = predict(State(served_model()), Json(request))
            .await
            .unwrap_err();

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert!(
            body["detail"]
                .as_str()
                .unwrap()
                .contains("num_medications")
        );
    }
}
