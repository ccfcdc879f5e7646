pub mod app;
pub mod handler;
pub mod signal;
pub mod trace;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;
