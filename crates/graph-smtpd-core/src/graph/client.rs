//! Microsoft Graph client
//!
//! Authenticates with the OAuth2 client-credentials grant and calls
//! `POST /users/{id}/sendMail`. See:
//! https://learn.microsoft.com/graph/api/user-sendmail

use super::types::{SendMailRequest, TokenResponse};
use super::{DispatchError, MailDispatcher, Mailbox};
use crate::message::OutboundMessage;
use async_trait::async_trait;
use graph_smtpd_common::config::GraphConfig;
use graph_smtpd_common::Error;
use reqwest::{Client, Url};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Graph API client
pub struct GraphClient {
    config: GraphConfig,
    graph_url: Url,
    token_url: Url,
    scope: String,
    client: Client,
    token: Mutex<Option<AccessToken>>,
}

impl GraphClient {
    /// Create a new Graph client
    ///
    /// Fails when the credentials are missing or malformed, or when the
    /// HTTP client cannot be built.
    pub fn new(config: GraphConfig) -> graph_smtpd_common::Result<Self> {
        validate_tenant_id(&config.tenant_id)?;

        if config.client_id.trim().is_empty() {
            return Err(Error::Graph("client id is required".to_string()));
        }
        if config.client_secret.is_empty() {
            return Err(Error::Graph("client secret is required".to_string()));
        }

        let graph_url = Url::parse(&config.graph_url)
            .map_err(|e| Error::Config(format!("invalid Graph URL {}: {}", config.graph_url, e)))?;

        let token_url = Url::parse(&format!(
            "{}/{}/oauth2/v2.0/token",
            config.authority_url.trim_end_matches('/'),
            config.tenant_id
        ))
        .map_err(|e| Error::Config(format!("invalid authority URL {}: {}", config.authority_url, e)))?;

        let scope = format!("{}/.default", graph_url.origin().ascii_serialization());

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Graph(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            graph_url,
            token_url,
            scope,
            client,
            token: Mutex::new(None),
        })
    }

    /// Get a bearer token, requesting a new one when the cached token is stale
    async fn access_token(&self) -> Result<String, DispatchError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting Graph access token from {}", self.token_url);

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", self.scope.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| DispatchError::Token(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Token request rejected with {}", status);
            return Err(DispatchError::Token(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Token(format!("invalid token response: {}", e)))?;

        let value = token.access_token.clone();
        *cached = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });

        Ok(value)
    }

    fn send_mail_url(&self, user_id: &str) -> Result<Url, DispatchError> {
        let mut url = self.graph_url.clone();
        url.path_segments_mut()
            .map_err(|_| DispatchError::Transport(format!("invalid Graph URL {}", self.graph_url)))?
            .pop_if_empty()
            .extend(["users", user_id, "sendMail"]);
        Ok(url)
    }
}

#[async_trait]
impl MailDispatcher for GraphClient {
    fn resolve_mailbox(&self, address: &str) -> Result<Mailbox, DispatchError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(DispatchError::MailboxNotFound("empty sender address".to_string()));
        }

        Ok(Mailbox {
            user_id: address.to_string(),
        })
    }

    async fn send_mail(&self, mailbox: &Mailbox, message: &OutboundMessage) -> Result<(), DispatchError> {
        let token = self.access_token().await?;
        let url = self.send_mail_url(&mailbox.user_id)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&SendMailRequest::from(message))
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Api { status, body });
        }

        debug!("Graph accepted message from {}", mailbox.user_id);
        Ok(())
    }
}

fn validate_tenant_id(tenant_id: &str) -> graph_smtpd_common::Result<()> {
    if tenant_id.is_empty() {
        return Err(Error::Graph("tenant id is required".to_string()));
    }

    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::Graph(format!("invalid tenant id: {}", tenant_id)));
    }

    Ok(())
}
