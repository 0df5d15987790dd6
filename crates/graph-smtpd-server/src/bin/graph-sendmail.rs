//! graph-sendmail - send one message read from stdin through Microsoft Graph
//!
//! The message is sent as the mailbox named in its From header.

use anyhow::{Context, Result};
use clap::Parser;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use graph_smtpd_common::Config;
use graph_smtpd_core::{assemble, GraphClient, MailDispatcher, MimeMessage};
use graph_smtpd_server::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "graph-sendmail", version, about = "Send a message from stdin through Microsoft Graph")]
struct Args {
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Disable all logging
    #[arg(long)]
    quiet: bool,

    /// Save to sent items in the sender's mailbox
    #[arg(long)]
    sentitems: bool,

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
    fn apply(
        &self,
        builder: ConfigBuilder<DefaultState>,
    ) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        let mut builder = builder
            .set_override_option("graph.client_id", self.clientid.clone())?
            .set_override_option("graph.tenant_id", self.tenantid.clone())?
            .set_override_option("graph.client_secret", self.secret.clone())?;

        if self.sentitems {
            builder = builder.set_override("graph.save_to_sent_items", true)?;
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
            if !args.quiet {
                eprintln!("graph-sendmail: {:#}", e);
            }
            return ExitCode::FAILURE;
        }
    };

    if !args.quiet {
        logging::init(&config.logging, args.debug);
    }

    match send(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("error sending email: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Config search order when no file is given
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("/etc/graph-sendmail")];
    if let Some(home) = std::env::var_os("HOME") {
        dirs.push(PathBuf::from(home).join(".graph-sendmail"));
    }
    dirs
}

fn load_config(args: &Args) -> Result<Config> {
    let builder = Config::sources_in(args.config.as_deref(), &search_dirs(), "SENDMAIL");
    let builder = args.apply(builder).context("invalid command line override")?;
    Config::from_sources(builder).context("failed to load configuration")
}

async fn send(config: Config) -> Result<()> {
    let client = GraphClient::new(config.graph.clone()).context("could not create graph client")?;

    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .context("unable to read message")?;

    let message = MimeMessage::parse(&raw).context("unable to read message")?;
    debug!(
        subject = %message.subject,
        attachments = message.attachments.len(),
        "parsed message"
    );

    let sender = sender_address(&message.from).context("message has no From address")?;
    let mailbox = client.resolve_mailbox(&sender)?;

    let (to, subject) = (message.to.clone(), message.subject.clone());
    let outbound = assemble(&sender, message, config.graph.save_to_sent_items);
    client.send_mail(&mailbox, &outbound).await?;

    info!(from = %sender, to = %to, subject = %subject, "message sent");
    Ok(())
}

/// The bare address of a From header value
fn sender_address(from: &str) -> Option<String> {
    let from = from.trim();
    let address = match (from.find('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from,
    };

    let address = address.trim();
    (!address.is_empty()).then(|| address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sender_address() {
        assert_eq!(sender_address("alice@example.com"), Some("alice@example.com".to_string()));
        assert_eq!(
            sender_address("Alice Example <alice@example.com>"),
            Some("alice@example.com".to_string())
        );
        assert_eq!(sender_address("  "), None);
        assert_eq!(sender_address("<>"), None);
    }

    #[test]
    fn test_search_dirs() {
        assert_eq!(search_dirs()[0], PathBuf::from("/etc/graph-sendmail"));
    }
}
