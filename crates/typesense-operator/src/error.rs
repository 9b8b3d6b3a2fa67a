use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    /// Raft resolves peers by hostname; names over the limit are rejected
    /// before anything is written to the API server.
    #[error("raft node name must not exceed {limit} characters: {name}")]
    NameTooLong { name: String, limit: usize },
}
