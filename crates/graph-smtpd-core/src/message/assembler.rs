//! Outbound message assembly

use super::address::{parse_address_list, Recipient};
use super::mime::{Attachment, MimeMessage};

/// Body content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Html,
}

/// Message body; a message carries text or html, never both
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub kind: BodyKind,
    pub content: String,
}

/// A message ready to hand to the remote send call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub from_address: String,
    pub to: Vec<Recipient>,
    pub cc: Vec<Recipient>,
    pub bcc: Vec<Recipient>,
    pub body: Option<Body>,
    pub attachments: Vec<Attachment>,
    pub save_to_sent_items: bool,
}

/// Choose the body to send: plain text wins over html.
pub fn select_body(text: Option<&str>, html: Option<&str>) -> Option<Body> {
    match (text.filter(|t| !t.is_empty()), html.filter(|h| !h.is_empty())) {
        (Some(text), _) => Some(Body {
            kind: BodyKind::Text,
            content: text.to_string(),
        }),
        (None, Some(html)) => Some(Body {
            kind: BodyKind::Html,
            content: html.to_string(),
        }),
        (None, None) => None,
    }
}

/// Build an outbound message sent as `sender` from a parsed MIME message.
///
/// Recipients come from the message headers, not the SMTP envelope.
pub fn assemble(sender: &str, message: MimeMessage, save_to_sent_items: bool) -> OutboundMessage {
    let body = select_body(message.text_body.as_deref(), message.html_body.as_deref());

    OutboundMessage {
        subject: message.subject,
        from_address: sender.to_string(),
        to: parse_address_list(&message.to),
        cc: parse_address_list(&message.cc),
        bcc: parse_address_list(&message.bcc),
        body,
        attachments: message.attachments,
        save_to_sent_items,
    }
}
