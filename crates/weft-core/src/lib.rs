pub mod config;
pub mod error;
pub mod event;
pub mod topic;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WeftError};
pub use event::FlowEventHub;
pub use topic::TopicPattern;
pub use types::*;
