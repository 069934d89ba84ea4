pub mod artifact;
pub mod classifier;
pub mod data;
pub mod evaluate;
pub mod forest;
pub mod infer;
pub mod ingest;
pub mod metrics;
pub mod preprocess;
pub mod serve;
pub mod threshold;
pub mod train;
