//! End-of-transaction log sink

use std::net::SocketAddr;
use tracing::{error, info, warn};

/// Transaction outcome severity; only ever raised within one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    #[default]
    None,
    Info,
    Warn,
    Error,
}

/// What a session reports when a transaction ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub severity: Severity,
    pub peer: Option<SocketAddr>,
    pub from: String,
    pub to: String,
    pub status: String,
    pub errors: Vec<String>,
}

/// Receives one record per finished transaction
pub trait TransactionLog: Send + Sync {
    fn record(&self, record: &TransactionRecord);
}

/// Emits transaction records as `tracing` events
#[derive(Debug, Default)]
pub struct TracingLog;

impl TransactionLog for TracingLog {
    fn record(&self, record: &TransactionRecord) {
        let peer = record.peer.map(|p| p.to_string()).unwrap_or_default();

        match record.severity {
            Severity::Error => error!(
                peer = %peer,
                from = %record.from,
                to = %record.to,
                errors = ?record.errors,
                "session ended"
            ),
            Severity::Warn => warn!(
                peer = %peer,
                from = %record.from,
                to = %record.to,
                status = %record.status,
                "session ended"
            ),
            Severity::Info => info!(
                peer = %peer,
                from = %record.from,
                to = %record.to,
                status = %record.status,
                "session ended"
            ),
            Severity::None => {}
        }
    }
}
