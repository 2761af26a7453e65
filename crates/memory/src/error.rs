/// Errors produced by the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The allocator could not provide the buffer, even at the reduced
    /// fallback size when one applies
    #[error("failed to allocate {requested} bytes{}", fallback_note(.fallback))]
    AllocationFailed {
        requested: usize,
        fallback: Option<usize>,
    },
}

fn fallback_note(fallback: &Option<usize>) -> String {
    match fallback {
        Some(size) => format!(" (fallback of {} bytes also failed)", size),
        None => String::new(),
    }
}
