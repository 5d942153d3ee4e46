use std::fmt;

/// The expected, user-visible failures of the read-side operations.
///
/// CAS losses inside the protocol are never surfaced through this type; they
/// are retried transparently. There is no unrecoverable category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// Attempted to `pop_back` or `peek` an empty vector.
    Empty,
    /// The index is past the current size, its bucket was never allocated, or
    /// the slot was logically deleted by a `pop_back`.
    OutOfBounds,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Empty => write!(f, "vector is empty"),
            AccessError::OutOfBounds => write!(f, "index out of bounds or slot deleted"),
        }
    }
}

impl std::error::Error for AccessError {}

/// Why a `write_at` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The slot does not exist, or was logically deleted.
    OutOfBounds,
    /// A concurrent mutation replaced the slot between our read and our CAS.
    Contended,
}

/// A rejected `write_at`, handing the value back to the caller.
#[derive(Debug)]
pub struct WriteError<T> {
    pub kind: WriteFailure,
    pub value: T,
}

impl<T> WriteError<T> {
    pub(crate) fn new(kind: WriteFailure, value: T) -> Self {
        WriteError { kind, value }
    }
}

impl<T> fmt::Display for WriteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WriteFailure::OutOfBounds => write!(f, "write rejected: index out of bounds"),
            WriteFailure::Contended => write!(f, "write rejected: concurrent mutation detected"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for WriteError<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AccessError::Empty.to_string(), "vector is empty");
        let e = WriteError::new(WriteFailure::Contended, 7);
        assert_eq!(e.value, 7);
        assert!(e.to_string().contains("concurrent"));
    }
}
