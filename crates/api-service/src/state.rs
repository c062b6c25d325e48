use camera_db::{Loader, SearchEngine};
use std::sync::Arc;
use std::time::Instant;
use stream_discovery::{Scanner, StreamProbe};

#[derive(Clone)]
pub struct AppState {
    pub loader: Arc<Loader>,
    pub search: Arc<SearchEngine>,
    pub scanner: Arc<Scanner>,
    pub probe: Arc<StreamProbe>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        loader: Arc<Loader>,
        search: Arc<SearchEngine>,
        scanner: Arc<Scanner>,
        probe: Arc<StreamProbe>,
    ) -> Self {
        Self {
            loader,
            search,
            scanner,
            probe,
            started_at: Instant::now(),
        }
    }
}
