/// Fatal and recoverable conditions raised by the undo and redo subsystems.
/// Transient I/O failures are not modeled here — they propagate as
/// `std::io::Error` through `anyhow::Result` and are the buffer manager's
/// problem to retry.
#[derive(Debug)]
pub enum UndoError {
    /// An invariant the caller was responsible for upholding was violated —
    /// a bad offset, an oversized tuple, a DO/REDO undo-pointer mismatch.
    /// Fatal: recovery must abort rather than continue with unknown state.
    ProtocolViolation(String),
    /// The staging area is full; the caller must call `insert_prepared_undo`
    /// (or raise capacity with `set_prepare_size`) before preparing more.
    StagingFull,
    /// An internal consistency check failed across a resumed multi-page
    /// serialize/deserialize call. Fatal.
    InvariantViolation(String),
}

impl std::fmt::Display for UndoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UndoError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            UndoError::StagingFull => write!(f, "prepared-undo staging area is full"),
            UndoError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for UndoError {}
