//! Remote dispatch boundary and the Microsoft Graph implementation

mod client;
mod types;

pub use client::GraphClient;

use crate::message::OutboundMessage;
use async_trait::async_trait;
use thiserror::Error;

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("token request failed: {0}")]
    Token(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("Graph API returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Resolved mailbox identity of a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub user_id: String,
}

/// Sends messages on behalf of a mailbox.
///
/// Implementations are shared by every session and must be safe to call
/// concurrently.
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    /// Resolve the mailbox a sender address sends as
    fn resolve_mailbox(&self, address: &str) -> Result<Mailbox, DispatchError>;

    /// Send a message as `mailbox`. Called once per transaction, never retried.
    async fn send_mail(&self, mailbox: &Mailbox, message: &OutboundMessage) -> Result<(), DispatchError>;
}
