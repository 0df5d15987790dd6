//! SMTP server implementation

use super::backend::Backend;
use super::handler::SmtpHandler;
use anyhow::{Context, Result};
use graph_smtpd_common::config::SmtpConfig;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SMTP Server
pub struct SmtpServer {
    config: SmtpConfig,
    backend: Arc<Backend>,
    connection_semaphore: Arc<Semaphore>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(config: SmtpConfig, backend: Arc<Backend>) -> Self {
        let max_connections = config.max_connections;
        Self {
            config,
            backend,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            tls_acceptor: None,
        }
    }

    /// Offer STARTTLS with the given acceptor
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.addr))?;

        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tls_status = if self.tls_acceptor.is_some() {
            "STARTTLS enabled"
        } else {
            "STARTTLS disabled"
        };
        info!("SMTP server listening on {} ({})", listener.local_addr()?, tls_status);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((mut stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            tokio::spawn(async move {
                                let _ = stream.write_all(b"421 4.3.2 Too many connections\r\n").await;
                                let _ = stream.shutdown().await;
                            });
                            continue;
                        }
                    };

                    let handler = SmtpHandler::new(
                        self.config.clone(),
                        self.backend.clone(),
                        self.tls_acceptor.clone(),
                        peer_addr,
                        shutdown.child_token(),
                    );

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
