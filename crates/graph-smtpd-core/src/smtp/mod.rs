//! SMTP server module

mod backend;
mod handler;
mod log;
mod server;
mod session;

pub use backend::{Backend, BackendBuilder};
pub use handler::SmtpHandler;
pub use log::{Severity, TracingLog, TransactionLog, TransactionRecord};
pub use server::SmtpServer;
pub use session::{Session, SessionError};

#[cfg(test)]
pub(crate) mod testing {
    use super::log::{TransactionLog, TransactionRecord};
    use crate::graph::{DispatchError, MailDispatcher, Mailbox};
    use crate::message::OutboundMessage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records sent messages instead of calling Graph
    #[derive(Default)]
    pub struct StubDispatcher {
        sent: Mutex<Vec<(Mailbox, OutboundMessage)>>,
        failure: Option<DispatchError>,
    }

    impl StubDispatcher {
        pub fn failing(err: DispatchError) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failure: Some(err),
            }
        }

        pub fn sent(&self) -> Vec<(Mailbox, OutboundMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailDispatcher for StubDispatcher {
        fn resolve_mailbox(&self, address: &str) -> Result<Mailbox, DispatchError> {
            if address.trim().is_empty() {
                return Err(DispatchError::MailboxNotFound("empty sender address".to_string()));
            }
            Ok(Mailbox {
                user_id: address.trim().to_string(),
            })
        }

        async fn send_mail(&self, mailbox: &Mailbox, message: &OutboundMessage) -> Result<(), DispatchError> {
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            self.sent.lock().unwrap().push((mailbox.clone(), message.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryLog {
        records: Mutex<Vec<TransactionRecord>>,
    }

    impl MemoryLog {
        pub fn records(&self) -> Vec<TransactionRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl TransactionLog for MemoryLog {
        fn record(&self, record: &TransactionRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }
}
