//! The reporting sink: composing status messages and shipping them to the
//! collector once per sweep.

pub mod compose;
pub mod message;
pub mod sink;

use std::sync::Arc;

use tracing::{debug, instrument};

pub use compose::{CertificateExpiry, ColumnResult, SweepStats, fold, self_report_text, status_text, tls_columns};
pub use message::{Message, envelopes, lifetime_minutes, timestamp};
pub use sink::{ReportSink, SinkError, StdoutSink, TcpCollector};

/// Collects a sweep's messages and sends them in `combo` batches.
pub struct Reporter {
    sink: Arc<dyn ReportSink>,
    batch_size: usize,
    queue: Vec<Message>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ReportSink>, batch_size: usize) -> Self {
        Self { sink, batch_size, queue: Vec::new() }
    }

    pub fn push(&mut self, message: Message) {
        self.queue.push(message);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Send everything queued. The queue is emptied even when sending
    /// fails; results are never replayed into a later sweep.
    #[instrument(skip(self), fields(messages = self.queue.len()))]
    pub async fn flush(&mut self) -> Result<usize, SinkError> {
        let messages = std::mem::take(&mut self.queue);
        let payloads = envelopes(&messages, self.batch_size);
        for payload in &payloads {
            self.sink.send(payload).await?;
        }
        debug!(envelopes = payloads.len(), "status messages sent");
        Ok(messages.len())
    }
}
