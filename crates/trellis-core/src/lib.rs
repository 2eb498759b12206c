pub mod config;
pub mod error;
pub mod event;
pub mod schema;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FieldIssue, Result, TrellisError};
pub use event::{EventBus, WorkflowEvent};
pub use schema::{FieldType, Schema};
pub use types::*;
