pub mod config;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod history;
pub mod notify;
pub mod pipeline;
pub mod query;
pub mod reconcile;
pub mod schema;
pub mod source;
pub mod stage;
pub mod storage;
pub mod telemetry;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
