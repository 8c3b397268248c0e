use line_cluster_lib::ClusterError;
use std::path::PathBuf;

/// Errors reported by the probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] ClusterError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
