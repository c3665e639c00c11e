pub mod channel;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod matrix;
pub mod pool;
pub mod report;
pub mod reporter;
pub mod scheduler;
pub mod shutdown;

pub use error::{Result, SisyphusError};
