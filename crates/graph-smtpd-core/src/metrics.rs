//! Failure counters

use graph_smtpd_common::Error;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Relay failure counters, registered in their own registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    failed_error: IntCounter,
    failed_denied: IntCounter,
}

impl Metrics {
    pub fn new() -> graph_smtpd_common::Result<Self> {
        let registry = Registry::new();

        let failed_error = IntCounter::new(
            "graph_smtpd_failed_error_total",
            "Transactions that failed because of an error",
        )
        .map_err(|e| Error::Metrics(e.to_string()))?;

        let failed_denied = IntCounter::new(
            "graph_smtpd_failed_denied_total",
            "Transactions that failed because the sender was not allowed",
        )
        .map_err(|e| Error::Metrics(e.to_string()))?;

        registry
            .register(Box::new(failed_error.clone()))
            .map_err(|e| Error::Metrics(e.to_string()))?;
        registry
            .register(Box::new(failed_denied.clone()))
            .map_err(|e| Error::Metrics(e.to_string()))?;

        Ok(Self {
            registry,
            failed_error,
            failed_denied,
        })
    }

    pub fn inc_error(&self) {
        self.failed_error.inc();
    }

    pub fn inc_denied(&self) {
        self.failed_denied.inc();
    }

    pub fn errors(&self) -> u64 {
        self.failed_error.get()
    }

    pub fn denied(&self) -> u64 {
        self.failed_denied.get()
    }

    /// Render all counters in the Prometheus text format
    pub fn render(&self) -> graph_smtpd_common::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }
}
