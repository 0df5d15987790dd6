//! Graph wire types

use crate::message::{BodyKind, OutboundMessage, Recipient};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

/// Body of `POST /users/{id}/sendMail`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendMailRequest<'a> {
    pub message: GraphMessage<'a>,
    pub save_to_sent_items: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphMessage<'a> {
    pub subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<ItemBody<'a>>,
    pub from: GraphRecipient<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to_recipients: Vec<GraphRecipient<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc_recipients: Vec<GraphRecipient<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc_recipients: Vec<GraphRecipient<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileAttachment<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemBody<'a> {
    pub content_type: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphRecipient<'a> {
    pub email_address: EmailAddress<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmailAddress<'a> {
    pub address: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileAttachment<'a> {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: &'a str,
    pub content_type: &'a str,
    pub content_bytes: String,
}

/// OAuth2 token endpoint response
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3599
}

fn recipient(address: &str) -> GraphRecipient<'_> {
    GraphRecipient {
        email_address: EmailAddress { address },
    }
}

fn recipients(list: &[Recipient]) -> Vec<GraphRecipient<'_>> {
    list.iter().map(|r| recipient(&r.address)).collect()
}

impl<'a> From<&'a OutboundMessage> for SendMailRequest<'a> {
    fn from(message: &'a OutboundMessage) -> Self {
        let body = message.body.as_ref().map(|body| ItemBody {
            content_type: match body.kind {
                BodyKind::Text => "text",
                BodyKind::Html => "html",
            },
            content: &body.content,
        });

        let attachments = message
            .attachments
            .iter()
            .map(|a| FileAttachment {
                odata_type: FILE_ATTACHMENT_TYPE,
                name: &a.name,
                content_type: &a.content_type,
                content_bytes: BASE64.encode(&a.bytes),
            })
            .collect();

        SendMailRequest {
            message: GraphMessage {
                subject: &message.subject,
                body,
                from: recipient(&message.from_address),
                to_recipients: recipients(&message.to),
                cc_recipients: recipients(&message.cc),
                bcc_recipients: recipients(&message.bcc),
                attachments,
            },
            save_to_sent_items: message.save_to_sent_items,
        }
    }
}
