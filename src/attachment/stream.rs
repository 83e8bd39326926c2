use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::debug;

use super::errors::AttachmentError;
use crate::store::DocumentStore;

const LOG_TARGET: &str = "couchbus::attachment";

/// Seekable reader over a document attachment. Bytes are fetched lazily,
/// one range request per [`read`](Self::read).
pub struct AttachmentStream {
    store: Arc<dyn DocumentStore>,
    doc_id: String,
    name: String,
    length: u64,
    offset: u64,
}

impl AttachmentStream {
    /// Reads the attachment length; a missing attachment fails here.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        doc_id: &str,
        name: &str,
    ) -> Result<Self, AttachmentError> {
        let length = store
            .attachment_length(doc_id, name)
            .await
            .map_err(|e| AttachmentError::NotFound {
                doc_id: doc_id.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(target: LOG_TARGET, doc_id, name, length, "Attachment opened");
        Ok(Self {
            store,
            doc_id: doc_id.to_string(),
            name: name.to_string(),
            length,
            offset: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Moves the offset, clamped to `[0, len]`. Returns the new offset.
    pub fn seek(&mut self, pos: SeekFrom) -> u64 {
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.length) + i128::from(delta),
        };
        self.offset = target.clamp(0, i128::from(self.length)) as u64;
        self.offset
    }

    /// Reads up to `size` bytes (everything left when `None`) and advances
    /// the offset. `Ok(None)` marks the end of the attachment. A store that
    /// returns no bytes before the advertised length fails with
    /// [`AttachmentError::Truncated`].
    pub async fn read(&mut self, size: Option<u64>) -> Result<Option<Bytes>, AttachmentError> {
        if self.offset >= self.length {
            return Ok(None);
        }
        let remaining = self.length - self.offset;
        let want = size.map_or(remaining, |n| n.min(remaining));
        if want == 0 {
            return Ok(Some(Bytes::new()));
        }

        let end = self.offset + want - 1;
        let data = self
            .store
            .attachment_range(&self.doc_id, &self.name, self.offset, end)
            .await?;
        if data.is_empty() {
            return Err(AttachmentError::Truncated {
                doc_id: self.doc_id.clone(),
                name: self.name.clone(),
                offset: self.offset,
                length: self.length,
            });
        }
        self.offset += data.len() as u64;
        Ok(Some(data))
    }

    /// Reads the rest of the attachment in `chunk_size` pieces. Seeking back
    /// and calling this again reads the data again.
    pub fn chunks(&mut self, chunk_size: u64) -> BoxStream<'_, Result<Bytes, AttachmentError>> {
        let chunk_size = chunk_size.max(1);
        stream::unfold(Some(self), move |reader| async move {
            let reader = reader?;
            match reader.read(Some(chunk_size)).await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}
