//! Range-read access to document attachments.

pub mod errors;
pub mod stream;

pub use errors::AttachmentError;
pub use stream::AttachmentStream;
