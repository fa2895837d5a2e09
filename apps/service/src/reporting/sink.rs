//! Where status messages go: the collector, or stdout for dry runs.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot connect to collector at {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("collector transmission failed: {0}")]
    Send(#[from] io::Error),
    #[error("collector at {0} did not respond in time")]
    Timeout(String),
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, payload: &str) -> Result<(), SinkError>;
}

/// One TCP connection per payload: write, half-close, drain the reply.
#[derive(Debug, Clone)]
pub struct TcpCollector {
    address: String,
    timeout: Duration,
}

impl TcpCollector {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self { address: format!("{host}:{port}"), timeout }
    }

    async fn deliver(&self, payload: &str) -> Result<(), SinkError> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|source| SinkError::Connect { address: self.address.clone(), source })?;
        stream.write_all(payload.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        if !reply.is_empty() {
            debug!(bytes = reply.len(), "collector replied");
        }
        Ok(())
    }
}

#[async_trait]
impl ReportSink for TcpCollector {
    async fn send(&self, payload: &str) -> Result<(), SinkError> {
        tokio::time::timeout(self.timeout, self.deliver(payload))
            .await
            .map_err(|_| SinkError::Timeout(self.address.clone()))?
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl ReportSink for StdoutSink {
    async fn send(&self, payload: &str) -> Result<(), SinkError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(payload.as_bytes()).await?;
        stdout.write_all(b"\n\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every payload, for assertions.
    #[derive(Debug, Default)]
    pub struct MemorySink {
        pub payloads: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn taken(&self) -> Vec<String> {
            std::mem::take(&mut *self.payloads.lock().expect("sink lock"))
        }
    }

    #[async_trait]
    impl ReportSink for MemorySink {
        async fn send(&self, payload: &str) -> Result<(), SinkError> {
            self.payloads.lock().expect("sink lock").push(payload.to_string());
            Ok(())
        }
    }
}
