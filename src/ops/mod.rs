pub mod change_detector;
pub mod conflict;
pub mod doc_writer;
pub mod safe_write;
pub mod sync;

pub use sync::{SyncError, SyncOrchestrator, SyncPhase, SyncReport};
