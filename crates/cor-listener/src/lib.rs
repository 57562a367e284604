pub mod correlation;
pub mod error;
mod fetcher;
pub mod manager;
pub mod processor;
pub mod registry;

pub use correlation::{extract_correlation_value, CorrelationEngine, CorrelationResult};
pub use error::{ListenerError, Result};
pub use manager::{ListenerManager, ListenerSettings, PublishRequest};
pub use processor::{ProcessOutcome, ResponseHandler, ResponseProcessor};
pub use registry::{ListenerEntry, ListenerRegistry};
