//! MIME parsing

use mail_parser::{HeaderName, MessageParser, MessagePart, MimeHeaders, PartType};
use thiserror::Error;

const DEFAULT_ATTACHMENT_NAME: &str = "attachment";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// MIME parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MimeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failed to read attachment {name}: {reason}")]
    Attachment { name: String, reason: String },
}

/// A fully materialized attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The parts of a submitted message the relay cares about
#[derive(Debug, Clone, Default)]
pub struct MimeMessage {
    /// Decoded Subject header
    pub subject: String,
    /// Raw From header value
    pub from: String,
    /// Raw To header value
    pub to: String,
    /// Raw Cc header value
    pub cc: String,
    /// Raw Bcc header value
    pub bcc: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MimeMessage {
    /// Parse a raw RFC 5322 message
    pub fn parse(raw: &[u8]) -> Result<Self, MimeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(MimeError::Malformed("empty message".to_string()));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MimeError::Malformed("unable to parse message structure".to_string()))?;

        let text_body = message.text_part(0).and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        });

        let html_body = message.html_part(0).and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });

        let attachments = message
            .attachments()
            .map(read_attachment)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            subject: message.subject().unwrap_or_default().to_string(),
            from: raw_header(message.header_raw(HeaderName::From)),
            to: raw_header(message.header_raw(HeaderName::To)),
            cc: raw_header(message.header_raw(HeaderName::Cc)),
            bcc: raw_header(message.header_raw(HeaderName::Bcc)),
            text_body,
            html_body,
            attachments,
        })
    }
}

fn raw_header(value: Option<&str>) -> String {
    value.map(|value| value.trim().to_string()).unwrap_or_default()
}

fn read_attachment(part: &MessagePart<'_>) -> Result<Attachment, MimeError> {
    let name = part
        .attachment_name()
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_ATTACHMENT_NAME)
        .to_string();

    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let bytes = match &part.body {
        PartType::Multipart(_) => {
            return Err(MimeError::Attachment {
                name,
                reason: "multipart container has no content".to_string(),
            })
        }
        _ => part.contents().to_vec(),
    };

    Ok(Attachment {
        name,
        content_type,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plain_message() {
        let raw = b"From: alice@example.com\r\n\
To: bob@example.com, carol@example.com\r\n\
Cc: dave@example.com\r\n\
Subject: Quarterly report\r\n\
\r\n\
See attached.\r\n";

        let message = MimeMessage::parse(raw).unwrap();
        assert_eq!(message.subject, "Quarterly report");
        assert_eq!(message.from, "alice@example.com");
        assert_eq!(message.to, "bob@example.com, carol@example.com");
        assert_eq!(message.cc, "dave@example.com");
        assert_eq!(message.bcc, "");
        assert_eq!(message.text_body.as_deref().map(str::trim_end), Some("See attached."));
        assert!(message.html_body.is_none());
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn test_parse_html_only_message() {
        let raw = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: Hi\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Hello</p>\r\n";

        let message = MimeMessage::parse(raw).unwrap();
        assert!(message.text_body.is_none());
        assert!(message.html_body.unwrap().contains("<p>Hello</p>"));
    }

    #[test]
    fn test_parse_attachment_bytes() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let raw = mail_builder::MessageBuilder::new()
            .from("alice@example.com")
            .to("bob@example.com")
            .subject("binary")
            .text_body("body")
            .attachment("application/octet-stream", "blob.bin", payload.clone())
            .write_to_vec()
            .unwrap();

        let message = MimeMessage::parse(&raw).unwrap();
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].name, "blob.bin");
        assert_eq!(message.attachments[0].content_type, "application/octet-stream");
        assert_eq!(message.attachments[0].bytes, payload);
    }

    #[test]
    fn test_empty_message_is_malformed() {
        assert!(matches!(MimeMessage::parse(b""), Err(MimeError::Malformed(_))));
        assert!(matches!(MimeMessage::parse(b"\r\n\r\n"), Err(MimeError::Malformed(_))));
    }
}
