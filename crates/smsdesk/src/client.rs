use crate::protocol::{
    Contact, ContactResponse, ContactsResponse, CreateContactRequest, ErrorBody, HealthResponse,
    MeResponse, Message, MessageResponse, MessagesResponse, PhoneNumber, PhoneNumbersResponse,
    SendRequest, SuccessResponse, UpdateContactRequest, User,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout for REST calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ApiError {
    /// Connection, timeout or body transfer failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// REST client for the smsdesk server, authenticated with a bearer token.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn me(&self) -> Result<User, ApiError> {
        let resp: MeResponse = self.execute(self.request(Method::GET, "/me")).await?;
        Ok(resp.user)
    }

    pub async fn phone_numbers(&self) -> Result<Vec<PhoneNumber>, ApiError> {
        let resp: PhoneNumbersResponse = self
            .execute(self.request(Method::GET, "/assigned-phone-number"))
            .await?;
        Ok(resp.phone_numbers)
    }

    pub async fn contacts(&self, phone_number_id: &str) -> Result<Vec<Contact>, ApiError> {
        let req = self
            .request(Method::GET, "/contacts")
            .query(&[("phoneNumberId", phone_number_id)]);
        let resp: ContactsResponse = self.execute(req).await?;
        Ok(resp.contacts)
    }

    pub async fn conversation(
        &self,
        contact_id: &str,
        phone_number: Option<&str>,
    ) -> Result<Vec<Message>, ApiError> {
        let mut req = self.request(Method::GET, &format!("/conversation/{contact_id}"));
        if let Some(number) = phone_number {
            req = req.query(&[("phoneNumber", number)]);
        }
        let resp: MessagesResponse = self.execute(req).await?;
        Ok(resp.messages)
    }

    pub async fn send(&self, body: &SendRequest) -> Result<Message, ApiError> {
        let resp: MessageResponse = self
            .execute(self.request(Method::POST, "/send").json(body))
            .await?;
        Ok(resp.message)
    }

    pub async fn mark_read(&self, contact_id: &str) -> Result<(), ApiError> {
        let _: SuccessResponse = self
            .execute(self.request(Method::POST, &format!("/mark-read/{contact_id}")))
            .await?;
        Ok(())
    }

    pub async fn create_contact(&self, body: &CreateContactRequest) -> Result<Contact, ApiError> {
        let resp: ContactResponse = self
            .execute(self.request(Method::POST, "/contacts").json(body))
            .await?;
        Ok(resp.contact)
    }

    pub async fn update_contact(
        &self,
        contact_id: &str,
        body: &UpdateContactRequest,
    ) -> Result<Contact, ApiError> {
        let resp: ContactResponse = self
            .execute(
                self.request(Method::PATCH, &format!("/contacts/{contact_id}"))
                    .json(body),
            )
            .await?;
        Ok(resp.contact)
    }

    pub async fn delete_contact(&self, contact_id: &str) -> Result<(), ApiError> {
        let _: SuccessResponse = self
            .execute(self.request(Method::DELETE, &format!("/contacts/{contact_id}")))
            .await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        self.execute(self.request(Method::GET, "/health")).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    async fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await?;
            return serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()));
        }

        let bytes = resp.bytes().await.unwrap_or_default();
        let (code, message) = match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => (body.code, body.error),
            Err(_) => (
                default_code(status).to_string(),
                String::from_utf8_lossy(&bytes).trim().to_string(),
            ),
        };
        tracing::debug!(status = status.as_u16(), %code, "request rejected");
        Err(ApiError::Status {
            status: status.as_u16(),
            code,
            message: if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        })
    }
}

fn default_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::CONFLICT => "conflict",
        _ => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8080/", "tok").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.token(), "tok");
    }

    #[test]
    fn default_codes_follow_status() {
        assert_eq!(default_code(StatusCode::NOT_FOUND), "not_found");
        assert_eq!(default_code(StatusCode::CONFLICT), "conflict");
        assert_eq!(default_code(StatusCode::BAD_GATEWAY), "internal");
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let client = ApiClient::new("http://127.0.0.1:1", "tok").unwrap();
        let err = client.me().await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)), "got {err:?}");
        assert_eq!(err.status(), None);
    }
}
