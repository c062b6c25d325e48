pub mod error;
pub mod models;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
