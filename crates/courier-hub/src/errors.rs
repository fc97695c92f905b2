/// Failures starting or running the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

impl HubError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Serve(_) => "serve",
            Self::Metrics(_) => "metrics",
        }
    }
}
