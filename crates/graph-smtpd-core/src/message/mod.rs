//! MIME to Graph message translation

mod address;
mod assembler;
mod mime;

pub use address::{parse_address_list, Recipient};
pub use assembler::{assemble, select_body, Body, BodyKind, OutboundMessage};
pub use mime::{Attachment, MimeError, MimeMessage};
