//! HTTP over the dialog engine: one request, one decoded response.

mod decoder;
mod request;

pub use decoder::{ChunkState, Framing, HttpDecoder};
pub use request::{HttpRequest, UrlError, mask_authorization};
