pub mod compactor;
pub mod context_manager;
pub mod loop_detector;
pub mod session;
pub mod session_store;
pub mod tokens;
pub mod types;

pub use compactor::{extractive_summary, format_transcript, CompressionOutcome, Summarizer, SummaryError};
pub use context_manager::{ContextConfig, ContextManager, Snapshot, CLEARED_TOOL_OUTPUT};
pub use loop_detector::{LoopConfig, LoopDetector, LoopKind, LoopWarning};
pub use session::SessionState;
pub use session_store::{Checkpoint, CheckpointStore, CheckpointSummary, MemoryError, StoreError};
pub use types::*;
