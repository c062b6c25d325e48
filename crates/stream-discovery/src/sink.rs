use async_trait::async_trait;
use common::models::ScanEvent;

/// Upward boundary of the discovery core: the scanner pushes progress,
/// found streams, and completion through this.
///
/// Implementations are expected to be non-blocking or at worst
/// bounded-blocking, and are responsible for serializing events into their
/// client transport (SSE, WebSocket, a log, a test buffer).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ScanEvent);
}
