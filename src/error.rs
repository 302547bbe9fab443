use thiserror::Error;

/// Errors raised by the B-tree engine itself (not by the embedder's backing store).
///
/// Mirrors the error kinds in the error-handling design one for one: everything
/// the engine can detect on its own gets a closed variant here, while failures
/// from the embedder's hooks (file I/O, allocator exhaustion) are wrapped as
/// `BackingStoreError` since their failure domain is open-ended.
#[derive(Error, Debug)]
pub enum BtreeError {
    #[error("insert entry size {got} does not match expected leaf entry size {expected}")]
    BadEntrySize { got: usize, expected: usize },

    #[error("buffer pool exhausted: all {sections} buffers are in use")]
    PoolExhausted { sections: usize },

    #[error("load of {len} bytes exceeds buffer size {buffer_size}")]
    OverSize { len: usize, buffer_size: usize },

    #[error("backing store operation failed")]
    BackingStoreError(#[source] anyhow::Error),

    #[error("tree has no root reference set")]
    TreeNotInitialised,

    #[error("failed to allocate a new node")]
    AllocFailed(#[source] anyhow::Error),
}

impl From<anyhow::Error> for BtreeError {
    fn from(err: anyhow::Error) -> Self {
        BtreeError::BackingStoreError(err)
    }
}

pub type Result<T> = std::result::Result<T, BtreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_does_not_panic() {
        let errs: Vec<BtreeError> = vec![
            BtreeError::BadEntrySize {
                got: 10,
                expected: 12,
            },
            BtreeError::PoolExhausted { sections: 10 },
            BtreeError::OverSize {
                len: 100,
                buffer_size: 64,
            },
            BtreeError::BackingStoreError(anyhow::anyhow!("disk full")),
            BtreeError::TreeNotInitialised,
            BtreeError::AllocFailed(anyhow::anyhow!("out of pages")),
        ];
        for err in errs {
            assert!(!format!("{err}").is_empty());
        }
    }

    #[test]
    fn from_anyhow_wraps_as_backing_store_error() {
        let err: BtreeError = anyhow::anyhow!("seek failed").into();
        assert!(matches!(err, BtreeError::BackingStoreError(_)));
    }
}
