//! Outbound SMS delivery.
//!
//! The loopback carrier accepts every message locally and is what tests and
//! development deployments use. The Twilio carrier posts to the Messages REST
//! resource with basic auth.

use crate::config::{CarrierConfig, CarrierKind};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TWILIO_BASE_URL: &str = "https://api.twilio.com";
const CARRIER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CarrierError {
    #[error("carrier request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("carrier rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("carrier misconfigured: {0}")]
    Config(String),
}

pub enum Carrier {
    Loopback,
    Twilio(TwilioCarrier),
}

impl Carrier {
    pub fn from_config(config: &CarrierConfig) -> Result<Self, CarrierError> {
        match config.kind {
            CarrierKind::Loopback => Ok(Carrier::Loopback),
            CarrierKind::Twilio => {
                let account_sid = config
                    .account_sid
                    .clone()
                    .ok_or_else(|| CarrierError::Config("carrier.account_sid is required".into()))?;
                let auth_token = config
                    .auth_token
                    .clone()
                    .ok_or_else(|| CarrierError::Config("carrier.auth_token is required".into()))?;
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TWILIO_BASE_URL.to_string());
                Ok(Carrier::Twilio(TwilioCarrier::new(
                    account_sid,
                    auth_token,
                    base_url,
                )?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Carrier::Loopback => "loopback",
            Carrier::Twilio(_) => "twilio",
        }
    }

    /// Hand a message to the carrier. Returns the carrier's message id.
    pub async fn send(&self, from: &str, to: &str, body: &str) -> Result<String, CarrierError> {
        match self {
            Carrier::Loopback => {
                let sid = format!("SM{}", uuid::Uuid::new_v4().simple());
                tracing::debug!(from, to, %sid, "loopback carrier accepted message");
                Ok(sid)
            }
            Carrier::Twilio(twilio) => twilio.send(from, to, body).await,
        }
    }
}

pub struct TwilioCarrier {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
}

#[derive(Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Deserialize)]
struct TwilioError {
    message: String,
}

impl TwilioCarrier {
    pub fn new(
        account_sid: String,
        auth_token: String,
        base_url: String,
    ) -> Result<Self, CarrierError> {
        let http = reqwest::Client::builder()
            .timeout(CARRIER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            account_sid,
            auth_token,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }

    async fn send(&self, from: &str, to: &str, body: &str) -> Result<String, CarrierError> {
        let resp = self
            .http
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("From", from), ("To", to), ("Body", body)])
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<TwilioError>(&bytes)
                .map(|e| e.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string());
            tracing::warn!(status = status.as_u16(), %message, "twilio rejected message");
            return Err(CarrierError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let message: TwilioMessage = serde_json::from_slice(&bytes).map_err(|e| {
            CarrierError::Rejected {
                status: status.as_u16(),
                message: format!("unreadable response: {e}"),
            }
        })?;
        tracing::info!(to, sid = %message.sid, "message handed to twilio");
        Ok(message.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_issues_unique_sids() {
        let carrier = Carrier::Loopback;
        let a = carrier.send("+15550000001", "+15551230001", "hi").await.unwrap();
        let b = carrier.send("+15550000001", "+15551230001", "hi").await.unwrap();
        assert!(a.starts_with("SM"));
        assert_ne!(a, b);
    }

    #[test]
    fn twilio_requires_credentials() {
        let config = CarrierConfig {
            kind: CarrierKind::Twilio,
            account_sid: Some("AC123".into()),
            auth_token: None,
            base_url: None,
        };
        assert!(matches!(
            Carrier::from_config(&config),
            Err(CarrierError::Config(_))
        ));
    }

    #[test]
    fn twilio_messages_url() {
        let carrier =
            TwilioCarrier::new("AC123".into(), "secret".into(), "http://localhost:9/".into())
                .unwrap();
        assert_eq!(
            carrier.messages_url(),
            "http://localhost:9/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[tokio::test]
    async fn unreachable_twilio_is_transport_error() {
        let carrier = Carrier::Twilio(
            TwilioCarrier::new("AC123".into(), "secret".into(), "http://127.0.0.1:1".into())
                .unwrap(),
        );
        let err = carrier
            .send("+15550000001", "+15551230001", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CarrierError::Transport(_)), "got {err:?}");
    }
}
