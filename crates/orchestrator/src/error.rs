#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] gatelink_client::Error),

    #[error("thread {0} is not tracked")]
    NotTracked(String),

    #[error("resync of thread {0} was superseded by a newer one")]
    Superseded(String),

    #[error("invalid orchestrator payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
