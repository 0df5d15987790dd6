//! Per-connection mail transaction state machine

use super::backend::Backend;
use super::log::{Severity, TransactionRecord};
use crate::graph::Mailbox;
use crate::message::{assemble, MimeError, MimeMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

const STATUS_SENT: &str = "message sent";

/// Per-transaction failures, returned to the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("graph client not initialised")]
    BackendUnavailable,

    #[error("sender not allowed: {0}")]
    AccessDenied(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("attachment read error: {0}")]
    AttachmentReadError(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("no valid sender for this transaction")]
    NoSender,
}

impl SessionError {
    /// SMTP reply code and text for this error
    pub fn reply(&self) -> (u16, &'static str) {
        match self {
            SessionError::BackendUnavailable => (451, "4.3.0 Mail service unavailable"),
            SessionError::AccessDenied(_) => (550, "5.7.1 Sender not allowed"),
            SessionError::UserNotFound(_) => (550, "5.1.0 Sender mailbox not found"),
            SessionError::MalformedMessage(_) => (554, "5.6.0 Malformed message"),
            SessionError::AttachmentReadError(_) => (554, "5.6.0 Unable to read attachment"),
            SessionError::SendFailed(_) => (451, "4.4.0 Message could not be sent"),
            SessionError::NoSender => (503, "5.5.1 Bad sequence of commands"),
        }
    }
}

impl From<MimeError> for SessionError {
    fn from(err: MimeError) -> Self {
        match err {
            MimeError::Malformed(reason) => SessionError::MalformedMessage(reason),
            err @ MimeError::Attachment { .. } => SessionError::AttachmentReadError(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Idle,
    SenderValidated,
    RecipientNoted,
    Transacted,
}

/// One connection's view of the relay.
///
/// Owned by the task serving the connection; cleared by [`Session::reset`]
/// between transactions.
pub struct Session {
    backend: Arc<Backend>,
    peer: Option<SocketAddr>,
    state: TransactionState,
    from: String,
    to: String,
    status: String,
    severity: Severity,
    errors: Vec<SessionError>,
    mailbox: Option<Mailbox>,
    save_to_sent_items: bool,
}

impl Session {
    pub(crate) fn new(backend: Arc<Backend>, peer: Option<SocketAddr>) -> Self {
        let save_to_sent_items = backend.save_to_sent_items();
        Self {
            backend,
            peer,
            state: TransactionState::Idle,
            from: String::new(),
            to: String::new(),
            status: String::new(),
            severity: Severity::None,
            errors: Vec::new(),
            mailbox: None,
            save_to_sent_items,
        }
    }

    /// MAIL FROM: check the sender and resolve the mailbox it sends as
    pub fn mail(&mut self, from: &str) -> Result<(), SessionError> {
        self.from = from.to_string();
        self.mailbox = None;
        self.state = TransactionState::Idle;

        let Some(dispatcher) = self.backend.dispatcher().cloned() else {
            return Err(self.fail(SessionError::BackendUnavailable));
        };

        if !self.backend.sender_allowed(from) {
            return Err(self.fail(SessionError::AccessDenied(from.to_string())));
        }

        match dispatcher.resolve_mailbox(from) {
            Ok(mailbox) => {
                self.mailbox = Some(mailbox);
                self.state = TransactionState::SenderValidated;
                Ok(())
            }
            Err(e) => Err(self.fail(SessionError::UserNotFound(e.to_string()))),
        }
    }

    /// RCPT TO: noted for logging only. Recipients are taken from the
    /// message headers during DATA.
    pub fn rcpt(&mut self, to: &str) -> Result<(), SessionError> {
        self.to = to.to_string();
        if self.state == TransactionState::SenderValidated {
            self.state = TransactionState::RecipientNoted;
        }
        Ok(())
    }

    /// DATA: translate the message and send it as the resolved mailbox
    pub async fn data<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<(), SessionError> {
        let mut raw = Vec::new();
        if let Err(e) = reader.read_to_end(&mut raw).await {
            return Err(self.fail(SessionError::MalformedMessage(format!("failed to read message: {}", e))));
        }

        let Some(mailbox) = self.mailbox.clone() else {
            return Err(self.fail(SessionError::NoSender));
        };

        let parsed = match MimeMessage::parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.fail(e.into())),
        };

        let message = assemble(&self.from, parsed, self.save_to_sent_items);

        let Some(dispatcher) = self.backend.dispatcher().cloned() else {
            return Err(self.fail(SessionError::BackendUnavailable));
        };

        debug!(
            from = %message.from_address,
            subject = %message.subject,
            recipients = message.to.len() + message.cc.len() + message.bcc.len(),
            attachments = message.attachments.len(),
            "Sending message via Graph"
        );

        if let Err(e) = dispatcher.send_mail(&mailbox, &message).await {
            return Err(self.fail(SessionError::SendFailed(e.to_string())));
        }

        self.status = STATUS_SENT.to_string();
        self.raise(Severity::Info);
        self.state = TransactionState::Transacted;

        Ok(())
    }

    /// End the transaction: log its outcome once, then clear it
    pub fn reset(&mut self) {
        if self.severity > Severity::None {
            self.backend.log().record(&TransactionRecord {
                severity: self.severity,
                peer: self.peer,
                from: self.from.clone(),
                to: self.to.clone(),
                status: self.status.clone(),
                errors: self.errors.iter().map(ToString::to_string).collect(),
            });
        }

        self.from.clear();
        self.to.clear();
        self.status.clear();
        self.errors.clear();
        self.severity = Severity::None;
        self.mailbox = None;
        self.state = TransactionState::Idle;
    }

    pub fn logout(&mut self) -> Result<(), SessionError> {
        debug!(peer = ?self.peer, "Session logout");
        Ok(())
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn errors(&self) -> &[SessionError] {
        &self.errors
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    fn raise(&mut self, severity: Severity) {
        if severity > self.severity {
            self.severity = severity;
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        match err {
            SessionError::AccessDenied(_) => self.backend.metrics().inc_denied(),
            _ => self.backend.metrics().inc_error(),
        }
        self.errors.push(err.clone());
        self.raise(Severity::Error);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DispatchError;
    use crate::message::BodyKind;
    use crate::smtp::testing::{MemoryLog, StubDispatcher};
    use pretty_assertions::assert_eq;

    const PLAIN: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com, carol@example.com\r\n\
Bcc: audit@example.com\r\n\
Subject: Status\r\n\
\r\n\
All good.\r\n";

    fn backend(
        senders: &[&str],
        dispatcher: Arc<StubDispatcher>,
        log: Arc<MemoryLog>,
    ) -> Arc<Backend> {
        Arc::new(
            Backend::builder()
                .dispatcher(dispatcher)
                .allowed_senders(senders.iter().copied())
                .transaction_log(log)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_mail_allow_list() {
        let log = Arc::new(MemoryLog::default());
        let allowed = ["alice@example.com", "bob@example.com"];
        let backend = backend(&allowed, Arc::new(StubDispatcher::default()), log);

        for sender in allowed {
            let mut session = backend.new_session(None);
            assert_eq!(session.mail(sender), Ok(()));
        }

        for (i, sender) in ["mallory@example.com", "ALICE@example.com", ""].iter().enumerate() {
            let mut session = backend.new_session(None);
            assert_eq!(
                session.mail(sender),
                Err(SessionError::AccessDenied(sender.to_string()))
            );
            assert_eq!(session.severity(), Severity::Error);
            assert_eq!(backend.metrics().denied(), i as u64 + 1);
        }

        assert_eq!(backend.metrics().errors(), 0);
    }

    #[test]
    fn test_mail_empty_allow_list() {
        let log = Arc::new(MemoryLog::default());
        let backend = backend(&[], Arc::new(StubDispatcher::default()), log);

        let mut session = backend.new_session(None);
        assert_eq!(session.mail("anyone@example.com"), Ok(()));

        // the stub rejects empty addresses the same way the Graph client does
        let mut session = backend.new_session(None);
        assert!(matches!(session.mail(""), Err(SessionError::UserNotFound(_))));
        assert_eq!(backend.metrics().errors(), 1);
        assert_eq!(backend.metrics().denied(), 0);
    }

    #[test]
    fn test_mail_without_dispatcher() {
        let backend = Arc::new(Backend::builder().build().unwrap());
        let mut session = backend.new_session(None);

        assert_eq!(session.mail("alice@example.com"), Err(SessionError::BackendUnavailable));
        assert_eq!(session.from(), "alice@example.com");
        assert_eq!(backend.metrics().errors(), 1);
    }

    #[test]
    fn test_rcpt_is_advisory() {
        let log = Arc::new(MemoryLog::default());
        let backend = backend(&[], Arc::new(StubDispatcher::default()), log);
        let mut session = backend.new_session(None);

        assert_eq!(session.rcpt("first@example.com"), Ok(()));
        assert_eq!(session.rcpt("not an address"), Ok(()));
        assert_eq!(session.to(), "not an address");
    }

    #[tokio::test]
    async fn test_successful_transaction_logs_info() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let backend = backend(&[], dispatcher.clone(), log.clone());
        let mut session = backend.new_session(None);

        session.mail("alice@example.com").unwrap();
        session.rcpt("envelope@example.com").unwrap();
        session.data(PLAIN).await.unwrap();

        assert_eq!(session.status(), "message sent");
        assert_eq!(session.severity(), Severity::Info);

        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        let (mailbox, message) = &sent[0];
        assert_eq!(mailbox.user_id, "alice@example.com");
        assert_eq!(message.from_address, "alice@example.com");
        let to: Vec<_> = message.to.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(message.bcc[0].address, "audit@example.com");
        assert_eq!(message.body.as_ref().unwrap().kind, BodyKind::Text);

        session.reset();
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, Severity::Info);
        assert_eq!(records[0].from, "alice@example.com");
        assert_eq!(records[0].to, "envelope@example.com");
        assert_eq!(records[0].status, "message sent");

        assert_eq!(session.severity(), Severity::None);
        assert_eq!(session.from(), "");
        assert_eq!(session.to(), "");
        assert_eq!(session.status(), "");
        assert!(session.errors().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_logs_error() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::failing(DispatchError::Api {
            status: 429,
            body: "throttled".to_string(),
        }));
        let backend = backend(&[], dispatcher, log.clone());
        let mut session = backend.new_session(None);

        session.mail("alice@example.com").unwrap();
        let err = session.data(PLAIN).await.unwrap_err();
        assert!(matches!(err, SessionError::SendFailed(_)));
        assert_eq!(backend.metrics().errors(), 1);

        session.reset();
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, Severity::Error);
        assert_eq!(records[0].errors.len(), 1);
        assert!(records[0].errors[0].contains("throttled"));
    }

    #[tokio::test]
    async fn test_severity_never_decreases() {
        let log = Arc::new(MemoryLog::default());
        let backend = backend(&["alice@example.com"], Arc::new(StubDispatcher::default()), log.clone());
        let mut session = backend.new_session(None);

        assert!(session.mail("mallory@example.com").is_err());
        assert_eq!(session.severity(), Severity::Error);

        // a later success in the same transaction keeps the error level
        session.mail("alice@example.com").unwrap();
        session.data(PLAIN).await.unwrap();
        assert_eq!(session.severity(), Severity::Error);
        assert_eq!(session.errors().len(), 1);

        session.reset();
        assert_eq!(log.records()[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let backend = backend(&[], dispatcher.clone(), log);
        let mut session = backend.new_session(None);

        session.mail("alice@example.com").unwrap();
        let err = session.data(&b""[..]).await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
        assert!(dispatcher.sent().is_empty());
        assert_eq!(backend.metrics().errors(), 1);
    }

    #[tokio::test]
    async fn test_data_without_sender() {
        let log = Arc::new(MemoryLog::default());
        let backend = backend(&[], Arc::new(StubDispatcher::default()), log);
        let mut session = backend.new_session(None);

        assert_eq!(session.data(PLAIN).await, Err(SessionError::NoSender));
    }

    #[tokio::test]
    async fn test_denied_mail_drops_previous_sender() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let backend = backend(&["alice@example.com"], dispatcher.clone(), log);
        let mut session = backend.new_session(None);

        session.mail("alice@example.com").unwrap();
        assert_eq!(
            session.mail("mallory@example.com"),
            Err(SessionError::AccessDenied("mallory@example.com".to_string()))
        );

        assert_eq!(session.data(PLAIN).await, Err(SessionError::NoSender));
        assert!(dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn test_attachment_bytes_are_preserved() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let backend = backend(&[], dispatcher.clone(), log);
        let mut session = backend.new_session(None);

        let pdf: Vec<u8> = b"%PDF-1.4\n".iter().copied().chain((0u8..=255).cycle().take(4096)).collect();
        let image = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];
        let raw = mail_builder::MessageBuilder::new()
            .from("alice@example.com")
            .to("bob@example.com")
            .subject("files")
            .text_body("see attached")
            .html_body("<p>see attached</p>")
            .attachment("application/pdf", "report.pdf", pdf.clone())
            .attachment("image/png", "logo.png", image.clone())
            .write_to_vec()
            .unwrap();

        session.mail("alice@example.com").unwrap();
        session.data(&raw[..]).await.unwrap();

        let sent = dispatcher.sent();
        let message = &sent[0].1;
        assert_eq!(message.body.as_ref().unwrap().kind, BodyKind::Text);
        assert_eq!(message.attachments.len(), 2);
        assert_eq!(message.attachments[0].name, "report.pdf");
        assert_eq!(message.attachments[0].content_type, "application/pdf");
        assert_eq!(message.attachments[0].bytes, pdf);
        assert_eq!(message.attachments[1].name, "logo.png");
        assert_eq!(message.attachments[1].bytes, image);
    }

    #[tokio::test]
    async fn test_reuse_after_reset() {
        let log = Arc::new(MemoryLog::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let backend = backend(&["alice@example.com"], dispatcher.clone(), log.clone());
        let mut session = backend.new_session(None);

        assert!(session.mail("mallory@example.com").is_err());
        session.reset();

        session.mail("alice@example.com").unwrap();
        session.data(PLAIN).await.unwrap();
        session.reset();

        // an untouched transaction logs nothing
        session.reset();

        let severities: Vec<_> = log.records().iter().map(|r| r.severity).collect();
        assert_eq!(severities, vec![Severity::Error, Severity::Info]);
        assert_eq!(dispatcher.sent().len(), 1);
        assert_eq!(session.logout(), Ok(()));
    }

    #[test]
    fn test_error_replies() {
        assert_eq!(SessionError::AccessDenied("x".into()).reply().0, 550);
        assert_eq!(SessionError::SendFailed("x".into()).reply().0, 451);
        assert_eq!(SessionError::MalformedMessage("x".into()).reply().0, 554);
        assert_eq!(
            SessionError::from(MimeError::Attachment {
                name: "a".into(),
                reason: "b".into()
            }),
            SessionError::AttachmentReadError("failed to read attachment a: b".into())
        );
    }
}
