pub mod buffer_pool;
pub mod disk;
pub mod error;
pub mod fsm;
pub mod page;
pub mod redo;
pub mod undo;
pub mod wal;
pub mod xact;

pub use error::UndoError;
pub use redo::RedoDispatcher;
pub use xact::{TransactionContext, Xid};
