//! Coordinator HTTP Client
//!
//! Login and the long-poll loop against the coordinator's JSON API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use meshlink_types::api::{ControlKey, LoginRequest, NodeConfig, PollRequest, PollResponse, RemotePeer};
use meshlink_types::PublicKey;
use reqwest::StatusCode;

/// Client-side deadline for the login request
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side deadline for one poll round; comfortably above the server's
/// 5-second long-poll window
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one poll round
pub enum PollOutcome {
    /// Fresh peer snapshot
    Peers(Vec<RemotePeer>),
    /// 408/204: nothing changed, poll again
    NoChange,
    /// 401: our key expired, stop polling
    KeyExpired,
}

/// HTTP client for the coordinator control plane
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    node_key: PublicKey,
}

impl ControlClient {
    pub fn new(server: &str, node_key: PublicKey) -> Result<Self> {
        let base_url = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server.trim_end_matches('/'))
        };

        Ok(Self {
            http: reqwest::Client::builder()
                .build()
                .context("building http client")?,
            base_url,
            node_key,
        })
    }

    /// Fetch the coordinator's long-term public key
    pub async fn control_key(&self) -> Result<PublicKey> {
        let response = self
            .http
            .get(format!("{}/key", self.base_url))
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await
            .context("fetching control key")?;
        let key: ControlKey = response.json().await.context("decoding control key")?;
        Ok(key.control_key)
    }

    /// Register (or refresh) this node; non-2xx is fatal for the run
    pub async fn login(&self, hostname: &str, provision_key: &str) -> Result<NodeConfig> {
        let request = LoginRequest {
            node_key: self.node_key,
            hostname: hostname.to_string(),
            provision_key: provision_key.to_string(),
        };

        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .timeout(LOGIN_TIMEOUT)
            .json(&request)
            .send()
            .await
            .context("sending login request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("login failed: {status} {body}");
        }

        let login: meshlink_types::api::LoginResponse =
            response.json().await.context("decoding login response")?;
        Ok(login.node_config)
    }

    /// One long-poll round
    pub async fn poll(&self) -> Result<PollOutcome> {
        let request = PollRequest {
            node_key: self.node_key,
        };

        let response = self
            .http
            .post(format!("{}/poll", self.base_url))
            .timeout(POLL_TIMEOUT)
            .json(&request)
            .send()
            .await
            .context("sending poll request")?;

        match response.status() {
            StatusCode::OK => {
                let poll: PollResponse = response.json().await.context("decoding poll response")?;
                Ok(PollOutcome::Peers(poll.peers))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::NO_CONTENT => Ok(PollOutcome::NoChange),
            StatusCode::UNAUTHORIZED => Ok(PollOutcome::KeyExpired),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("poll failed: {status} {body}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::PrivateKey;

    #[test]
    fn test_base_url_normalization() {
        let key = PrivateKey::generate().public();
        let client = ControlClient::new("127.0.0.1:8080", key).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:8080");

        let client = ControlClient::new("https://mesh.example.com/", key).unwrap();
        assert_eq!(client.base_url, "https://mesh.example.com");
    }
}
