use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment '{name}' of document '{doc_id}' not found: {reason}")]
    NotFound {
        doc_id: String,
        name: String,
        reason: String,
    },

    #[error("attachment '{name}' of document '{doc_id}' ended at byte {offset} of {length}")]
    Truncated {
        doc_id: String,
        name: String,
        offset: u64,
        length: u64,
    },

    #[error("failed to fetch attachment bytes: {0}")]
    Fetch(#[from] StoreError),
}
