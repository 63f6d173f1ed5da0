pub mod batch;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod transport;
pub mod types;

pub use batch::{CallOutcome, PreparedCall};
pub use config::{AgentConfig, CheckpointConfig, ConfigError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::{AgentError, Orchestrator};
pub use retry::{RetryConfig, RetryError, RetryPolicy};
pub use transport::{ModelOutput, ModelReply, ModelTransport, TransportError, TransportSummarizer};
pub use types::*;
