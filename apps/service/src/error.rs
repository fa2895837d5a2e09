use thiserror::Error;

/// Setup failures that stop the process with a non-zero exit.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("TLS initialisation failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Config(#[from] crate::config::Error),
}
