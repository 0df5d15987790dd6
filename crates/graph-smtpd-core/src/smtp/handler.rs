//! SMTP session handler

use super::backend::Backend;
use super::session::{Session, SessionError};
use anyhow::Result;
use graph_smtpd_common::config::SmtpConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol state, tracked separately from the transaction state kept by [`Session`]
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// How a command loop ended
enum Flow {
    Quit,
    StartTls,
}

/// SMTP session handler
pub struct SmtpHandler {
    config: SmtpConfig,
    backend: Arc<Backend>,
    tls_acceptor: Option<TlsAcceptor>,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
    id: Uuid,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(
        config: SmtpConfig,
        backend: Arc<Backend>,
        tls_acceptor: Option<TlsAcceptor>,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            backend,
            tls_acceptor,
            peer_addr,
            shutdown,
            id: Uuid::new_v4(),
        }
    }

    /// Handle an SMTP connection until QUIT, disconnect, idle timeout or shutdown
    pub async fn handle<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        if !self.backend.source_allowed(self.peer_addr.ip()) {
            self.backend.metrics().inc_denied();
            warn!(peer = %self.peer_addr, "Connection from disallowed source");
            self.send_response(&mut reader, 554, "5.7.1 Access denied").await?;
            return Ok(());
        }

        debug!(id = %self.id, peer = %self.peer_addr, "SMTP session started");

        let mut session = self.backend.new_session(Some(self.peer_addr));

        self.send_response(
            &mut reader,
            220,
            &format!("{} ESMTP graph-smtpd", self.config.domain),
        )
        .await?;

        let flow = self.serve(&mut reader, &mut session, false).await;
        let result = match flow {
            Ok(Flow::StartTls) => match &self.tls_acceptor {
                Some(acceptor) => match acceptor.accept(reader.into_inner()).await {
                    Ok(tls) => {
                        debug!(id = %self.id, "TLS established");
                        let mut reader = BufReader::new(tls);
                        self.serve(&mut reader, &mut session, true).await.map(|_| ())
                    }
                    Err(e) => Err(anyhow::anyhow!("TLS handshake failed: {}", e)),
                },
                None => Ok(()),
            },
            Ok(Flow::Quit) => Ok(()),
            Err(e) => Err(e),
        };

        session.reset();
        if let Err(e) = session.logout() {
            warn!(id = %self.id, "Logout failed: {}", e);
        }

        debug!(id = %self.id, peer = %self.peer_addr, "SMTP session ended");
        result
    }

    async fn serve<S>(
        &self,
        reader: &mut BufReader<S>,
        session: &mut Session,
        tls_active: bool,
    ) -> Result<Flow>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = Duration::from_secs(self.config.connection_timeout_secs);
        let mut state = SessionState::Connected;
        let mut recipients = 0usize;
        let mut buf = Vec::new();

        loop {
            buf.clear();

            let read = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                read = timeout(idle, reader.read_until(b'\n', &mut buf)) => Some(read),
            };

            let bytes_read = match read {
                None => {
                    self.send_response(reader, 421, "4.3.2 Service shutting down").await?;
                    return Ok(Flow::Quit);
                }
                Some(Err(_)) => {
                    info!(peer = %self.peer_addr, "Idle timeout");
                    self.send_response(reader, 421, "4.4.2 Idle timeout, closing connection")
                        .await?;
                    return Ok(Flow::Quit);
                }
                Some(Ok(read)) => read?,
            };

            if bytes_read == 0 {
                debug!("Client {} disconnected", self.peer_addr);
                return Ok(Flow::Quit);
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            debug!("SMTP from {}: {}", self.peer_addr, line);

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" => {
                    session.reset();
                    state = SessionState::Greeted;
                    recipients = 0;
                    self.send_response(reader, 250, &format!("{} Hello {}", self.config.domain, args))
                        .await?;
                }

                "EHLO" => {
                    session.reset();
                    state = SessionState::Greeted;
                    recipients = 0;

                    let mut responses = vec![
                        format!("{} Hello {}", self.config.domain, args),
                        format!("SIZE {}", self.config.max_message_bytes),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];

                    if self.tls_acceptor.is_some() && !tls_active {
                        responses.push("STARTTLS".to_string());
                    }

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(reader, 250, resp).await?;
                        } else {
                            self.send_response_continue(reader, 250, resp).await?;
                        }
                    }
                }

                "STARTTLS" => {
                    if tls_active {
                        self.send_response(reader, 503, "5.5.1 TLS already active").await?;
                        continue;
                    }

                    if self.tls_acceptor.is_none() {
                        self.send_response(reader, 502, "5.5.1 STARTTLS not supported")
                            .await?;
                        continue;
                    }

                    if !args.is_empty() {
                        self.send_response(reader, 501, "5.5.4 Syntax error").await?;
                        continue;
                    }

                    self.send_response(reader, 220, "2.0.0 Ready to start TLS").await?;
                    session.reset();
                    return Ok(Flow::StartTls);
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(reader, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let Some(from) = parse_mail_from(args) else {
                        self.send_response(reader, 501, "5.1.7 Bad sender address syntax")
                            .await?;
                        continue;
                    };

                    if parse_size(args).is_some_and(|size| size > self.config.max_message_bytes) {
                        self.send_response(
                            reader,
                            552,
                            "5.3.4 Message size exceeds fixed maximum message size",
                        )
                        .await?;
                        continue;
                    }

                    match session.mail(&from) {
                        Ok(()) => {
                            state = SessionState::MailFrom;
                            recipients = 0;
                            self.send_response(reader, 250, "2.1.0 OK").await?;
                        }
                        Err(e) => self.send_error(reader, &e).await?,
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(reader, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if recipients >= self.config.max_recipients {
                        self.send_response(reader, 452, "4.5.3 Too many recipients").await?;
                        continue;
                    }

                    let Some(to) = parse_rcpt_to(args) else {
                        self.send_response(reader, 501, "5.1.3 Bad recipient address syntax")
                            .await?;
                        continue;
                    };

                    match session.rcpt(&to) {
                        Ok(()) => {
                            recipients += 1;
                            state = SessionState::RcptTo;
                            self.send_response(reader, 250, "2.1.5 OK").await?;
                        }
                        Err(e) => self.send_error(reader, &e).await?,
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo {
                        self.send_response(reader, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(reader, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    match self.read_data(reader).await? {
                        Some(data) => match session.data(&data[..]).await {
                            Ok(()) => {
                                self.send_response(reader, 250, "2.0.0 OK: message sent").await?
                            }
                            Err(e) => self.send_error(reader, &e).await?,
                        },
                        None => {
                            self.send_response(
                                reader,
                                552,
                                "5.3.4 Message size exceeds fixed maximum message size",
                            )
                            .await?;
                        }
                    }

                    session.reset();
                    state = SessionState::Greeted;
                    recipients = 0;
                }

                "RSET" => {
                    session.reset();
                    recipients = 0;
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(reader, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(reader, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(reader, 221, "2.0.0 Bye").await?;
                    return Ok(Flow::Quit);
                }

                "VRFY" => {
                    self.send_response(reader, 252, "2.5.2 Cannot VRFY user").await?;
                }

                "EXPN" | "AUTH" | "TURN" => {
                    self.send_response(reader, 502, "5.5.1 Command not implemented")
                        .await?;
                }

                _ => {
                    self.send_response(reader, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }
    }

    /// Read message data until <CRLF>.<CRLF>
    ///
    /// Returns `None` once the message grows past `max_message_bytes`; the rest
    /// of the message is still consumed so the connection stays in sync.
    async fn read_data<R: tokio::io::AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>> {
        let idle = Duration::from_secs(self.config.connection_timeout_secs);
        let max_size = self.config.max_message_bytes;
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut oversized = false;

        loop {
            line.clear();
            let bytes_read = timeout(idle, reader.read_until(b'\n', &mut line))
                .await
                .map_err(|_| anyhow::anyhow!("Timed out during DATA"))??;

            if bytes_read == 0 {
                return Err(anyhow::anyhow!("Connection closed during DATA"));
            }

            if line == b".\r\n" || line == b".\n" {
                break;
            }

            if oversized {
                continue;
            }

            // Dot-stuffing: a leading dot was added by the client
            let line_bytes = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line[..]
            };

            if data.len() + line_bytes.len() > max_size {
                oversized = true;
                data.clear();
                continue;
            }

            data.extend_from_slice(line_bytes);
        }

        Ok(if oversized { None } else { Some(data) })
    }

    async fn send_error<W: AsyncWrite + Unpin>(&self, writer: &mut W, err: &SessionError) -> Result<()> {
        let (code, message) = err.reply();
        self.send_response(writer, code, message).await
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Parse MAIL FROM:<address> or MAIL FROM: <address>. The null sender
/// `<>` yields an empty address.
fn parse_mail_from(args: &str) -> Option<String> {
    let args = args.trim();

    let addr_part = match args.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("FROM:") => &args[5..],
        _ => return None,
    };

    extract_address(addr_part.trim())
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<String> {
    let args = args.trim();

    let addr_part = match args.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("TO:") => &args[3..],
        _ => return None,
    };

    extract_address(addr_part.trim()).filter(|email| !email.is_empty())
}

fn extract_address(addr_part: &str) -> Option<String> {
    let email = if addr_part.starts_with('<') {
        let end = addr_part.find('>')?;
        &addr_part[1..end]
    } else {
        addr_part.split_whitespace().next()?
    };

    Some(email.trim().to_string())
}

/// The SIZE= parameter of MAIL FROM, when present
fn parse_size(args: &str) -> Option<usize> {
    args.split_whitespace()
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("SIZE"))
        .and_then(|(_, value)| value.parse().ok())
}
