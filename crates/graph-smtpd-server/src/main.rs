//! graph-smtpd - SMTP relay that sends mail through Microsoft Graph

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use graph_smtpd_common::Config;
use graph_smtpd_core::{Backend, CertificateRotator, GraphClient, RunGroup, SmtpServer};
use graph_smtpd_server::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "graph-smtpd", version, about = "SMTP relay that sends mail through Microsoft Graph")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Service listen address
    #[arg(long)]
    addr: Option<String>,

    /// Service domain/hostname
    #[arg(long)]
    domain: Option<String>,

    /// Maximum message recipients
    #[arg(long)]
    recipients: Option<u64>,

    /// Maximum message size in bytes
    #[arg(long)]
    max: Option<u64>,

    /// Save to sent items in the sender's mailbox
    #[arg(long)]
    sentitems: bool,

    /// Allowed senders
    #[arg(long, value_delimiter = ',')]
    senders: Vec<String>,

    /// Source IP addresses or networks allowed to relay
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,

    /// TLS certificate for STARTTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS key for STARTTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// App registration client/application id
    #[arg(long)]
    clientid: Option<String>,

    /// App registration tenant id
    #[arg(long)]
    tenantid: Option<String>,

    /// App registration client secret
    #[arg(long)]
    secret: Option<String>,
}

impl Args {
    /// Command line flags override file and environment settings
    fn apply(
        &self,
        builder: ConfigBuilder<DefaultState>,
    ) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut builder = builder
            .set_override_option("smtp.addr", self.addr.clone())?
            .set_override_option("smtp.domain", self.domain.clone())?
            .set_override_option("smtp.max_recipients", self.recipients)?
            .set_override_option("smtp.max_message_bytes", self.max)?
            .set_override_option("tls.cert", path(&self.cert))?
            .set_override_option("tls.key", path(&self.key))?
            .set_override_option("graph.client_id", self.clientid.clone())?
            .set_override_option("graph.tenant_id", self.tenantid.clone())?
            .set_override_option("graph.client_secret", self.secret.clone())?;

        if self.sentitems {
            builder = builder.set_override("graph.save_to_sent_items", true)?;
        }
        if !self.senders.is_empty() {
            builder = builder.set_override("access.senders", self.senders.clone())?;
        }
        if !self.sources.is_empty() {
            builder = builder.set_override("access.sources", self.sources.clone())?;
        }

        Ok(builder)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("graph-smtpd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.logging, args.debug);

    match run(config).await {
        Ok(()) => {
            info!("graph-smtpd shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("graph-smtpd stopped: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let builder = Config::sources(args.config.as_deref(), "SMTPD");
    let builder = args.apply(builder).context("invalid command line override")?;
    Config::from_sources(builder).context("failed to load configuration")
}

async fn run(config: Config) -> Result<()> {
    let client = GraphClient::new(config.graph.clone()).context("could not create graph client")?;

    let backend = Arc::new(
        Backend::builder()
            .dispatcher(Arc::new(client))
            .allowed_senders(config.access.senders.clone())
            .allowed_sources(config.access.sources.clone())
            .save_to_sent_items(config.graph.save_to_sent_items)
            .build()?,
    );

    let mut server = SmtpServer::new(config.smtp.clone(), backend.clone());
    let mut group = RunGroup::new();

    match config.tls.paths() {
        Some((cert, key)) => {
            let rotator = Arc::new(
                CertificateRotator::new(cert, key)
                    .context("could not load TLS certificate")?
                    .with_interval(Duration::from_secs(config.tls.reload_interval_secs)),
            );
            server = server.with_tls(rotator.acceptor()?);

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            group.add(
                "certificate watcher",
                async move { rotator.run(cancel).await.map_err(anyhow::Error::from) },
                move |_| interrupt.cancel(),
            );
        }
        None if config.tls.cert.is_some() || config.tls.key.is_some() => {
            bail!("both a TLS certificate and key are required for STARTTLS");
        }
        None => {}
    }

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    group.add(
        "smtp server",
        async move { server.run(shutdown).await },
        move |_| interrupt.cancel(),
    );

    let stop = CancellationToken::new();
    let interrupt = stop.clone();
    group.add(
        "signal handler",
        async move {
            tokio::select! {
                _ = stop.cancelled() => Ok(()),
                result = shutdown_signal() => result,
            }
        },
        move |_| interrupt.cancel(),
    );

    info!(
        addr = %config.smtp.addr,
        domain = %config.smtp.domain,
        senders = config.access.senders.len(),
        sources = config.access.sources.len(),
        "graph-smtpd started"
    );

    let result = group.run().await;

    let metrics = backend.metrics();
    info!(
        failed_error = metrics.errors(),
        failed_denied = metrics.denied(),
        "final counters"
    );

    result
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    Ok(())
}
