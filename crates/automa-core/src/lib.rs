pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AutomaConfig;
pub use error::{AutomaError, Result};
pub use event::EventBus;
pub use traits::{CallbackInfo, WorkerCallback};
pub use types::*;
