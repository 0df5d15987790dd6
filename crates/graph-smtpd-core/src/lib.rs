//! graph-smtpd Core - SMTP to Microsoft Graph relay
//!
//! This crate provides the relay itself: the per-connection SMTP session,
//! MIME to Graph message translation, the Graph client, hot-reloading
//! STARTTLS credentials and the run group that ties their lifecycles together.

pub mod graph;
pub mod message;
pub mod metrics;
pub mod smtp;
pub mod supervisor;
pub mod tls;

pub use graph::{DispatchError, GraphClient, MailDispatcher, Mailbox};
pub use message::{assemble, parse_address_list, Attachment, Body, BodyKind, MimeMessage, OutboundMessage};
pub use metrics::Metrics;
pub use smtp::{
    Backend, BackendBuilder, Session, SessionError, Severity, SmtpHandler, SmtpServer, TracingLog,
    TransactionLog, TransactionRecord,
};
pub use supervisor::RunGroup;
pub use tls::CertificateRotator;
