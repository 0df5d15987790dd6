//! Shared relay state and session factory

use super::log::{TracingLog, TransactionLog};
use super::session::Session;
use crate::graph::MailDispatcher;
use crate::metrics::Metrics;
use graph_smtpd_common::Error;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Process-wide state shared by every session.
///
/// Built once at startup and never mutated afterwards, apart from the
/// counters in [`Metrics`].
pub struct Backend {
    dispatcher: Option<Arc<dyn MailDispatcher>>,
    allowed_senders: Vec<String>,
    allowed_sources: Vec<IpNet>,
    save_to_sent_items: bool,
    log: Arc<dyn TransactionLog>,
    metrics: Metrics,
}

impl Backend {
    pub fn builder() -> BackendBuilder {
        BackendBuilder::default()
    }

    /// Create a session for a newly accepted connection
    pub fn new_session(self: &Arc<Self>, peer: Option<SocketAddr>) -> Session {
        Session::new(self.clone(), peer)
    }

    /// Whether `sender` may send. An empty allow-list allows everyone.
    pub fn sender_allowed(&self, sender: &str) -> bool {
        self.allowed_senders.is_empty()
            || self
                .allowed_senders
                .binary_search_by(|allowed| allowed.as_str().cmp(sender))
                .is_ok()
    }

    /// Whether a connection from `ip` may relay. An empty allow-list allows everyone.
    pub fn source_allowed(&self, ip: IpAddr) -> bool {
        self.allowed_sources.is_empty() || self.allowed_sources.iter().any(|net| net.contains(&ip))
    }

    pub fn save_to_sent_items(&self) -> bool {
        self.save_to_sent_items
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn dispatcher(&self) -> Option<&Arc<dyn MailDispatcher>> {
        self.dispatcher.as_ref()
    }

    pub(crate) fn log(&self) -> &dyn TransactionLog {
        self.log.as_ref()
    }
}

/// Builder for [`Backend`]
#[derive(Default)]
pub struct BackendBuilder {
    dispatcher: Option<Arc<dyn MailDispatcher>>,
    senders: Vec<String>,
    sources: Vec<String>,
    save_to_sent_items: bool,
    log: Option<Arc<dyn TransactionLog>>,
    metrics: Option<Metrics>,
}

impl BackendBuilder {
    pub fn dispatcher(mut self, dispatcher: Arc<dyn MailDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn allowed_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.senders = senders.into_iter().map(Into::into).collect();
        self
    }

    /// Source IP addresses or CIDR networks
    pub fn allowed_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn save_to_sent_items(mut self, save: bool) -> Self {
        self.save_to_sent_items = save;
        self
    }

    pub fn transaction_log(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> graph_smtpd_common::Result<Backend> {
        // Membership uses binary search, so never trust caller order
        let mut allowed_senders: Vec<String> = self
            .senders
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        allowed_senders.sort();
        allowed_senders.dedup();

        let allowed_sources = self
            .sources
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(parse_source)
            .collect::<graph_smtpd_common::Result<Vec<_>>>()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Metrics::new()?,
        };

        Ok(Backend {
            dispatcher: self.dispatcher,
            allowed_senders,
            allowed_sources,
            save_to_sent_items: self.save_to_sent_items,
            log: self.log.unwrap_or_else(|| Arc::new(TracingLog)),
            metrics,
        })
    }
}

fn parse_source(source: &str) -> graph_smtpd_common::Result<IpNet> {
    source
        .parse::<IpNet>()
        .or_else(|_| source.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| Error::Config(format!("invalid source address: {}", source)))
}
