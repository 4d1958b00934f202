/// Replies use this chunk index for the asynchronous (notification-mode)
/// snapshot install acknowledgement.
pub(crate) const ASYNC_INSTALL_CHUNK_INDEX: i64 = -1;

/// Cap on entries drained by one apply-loop pass before re-checking the
/// shutdown signal.
pub(crate) const APPLY_BATCH_LIMIT: u64 = 1_024;
