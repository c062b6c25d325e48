use async_trait::async_trait;
use axum::response::sse::Event;
use common::models::ScanEvent;
use std::convert::Infallible;
use stream_discovery::EventSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bridges the scanner's event sink onto an SSE channel. When the client
/// side of the channel is gone, the scan's cancellation token is tripped
/// so no work outlives the subscriber.
pub struct SseSink {
    tx: mpsc::Sender<ScanEvent>,
    cancel: CancellationToken,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<ScanEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }
}

#[async_trait]
impl EventSink for SseSink {
    async fn send(&self, event: ScanEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("SSE client went away, cancelling scan");
            self.cancel.cancel();
        }
    }
}

/// Render a scan event as an SSE frame: the event name is the variant tag,
/// the data is the full JSON payload.
pub fn to_sse_event(event: &ScanEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(event.kind()).data(data))
}
