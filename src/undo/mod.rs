pub mod allocator;
pub mod chain;
pub mod fetch;
pub mod log;
pub mod ptr;
pub mod record;
pub mod stage;

pub use allocator::UndoAllocator;
pub use fetch::{fetch_record, prev_record_pointer};
pub use log::{Persistence, UndoLog, UndoLogRegistry};
pub use ptr::UndoRecPtr;
pub use record::{UndoRecordType, UnpackedUndoRecord};
pub use stage::UndoStage;
