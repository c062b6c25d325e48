pub mod config;
pub mod error;
pub mod routes;
pub mod sse;
pub mod state;

pub use config::Config;
pub use state::AppState;
