//! Server-sent events connector. Resumes from the last serial via `Last-Event-ID`.

use futures_util::{StreamExt, TryStreamExt};
use smsdesk::protocol::{RealtimeEvent, Scope};
use std::future::Future;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use super::{EventStream, RealtimeConnector, RealtimeError};

const MAX_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ChannelConnector {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ChannelConnector {
    /// No total request timeout: the response body is the event stream.
    pub fn new(base_url: &str, token: &str, connect_timeout: Duration) -> Result<Self, RealtimeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

impl RealtimeConnector for ChannelConnector {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn connect(
        &self,
        scopes: &[Scope],
        resume_after: Option<u64>,
    ) -> impl Future<Output = Result<EventStream, RealtimeError>> + Send {
        let joined = scopes
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut req = self
            .http
            .get(format!("{}/realtime/channel", self.base_url))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&[("scopes", joined)]);
        if let Some(serial) = resume_after {
            req = req.header("Last-Event-ID", serial.to_string());
        }

        async move {
            let resp = req
                .send()
                .await
                .map_err(|e| RealtimeError::Connect(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(RealtimeError::Rejected(format!("{status}: {}", body.trim())));
            }
            tracing::debug!(?resume_after, "event channel open");

            let reader = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
            let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE));
            let stream = async_stream::stream! {
                let mut frame = SseFrame::default();
                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            yield Err(RealtimeError::Stream(e.to_string()));
                            break;
                        }
                    };
                    let Some(data) = frame.push_line(&line) else {
                        continue;
                    };
                    match serde_json::from_str::<RealtimeEvent>(&data) {
                        Ok(event) => yield Ok(event),
                        Err(e) => tracing::warn!("undecodable channel event: {e}"),
                    }
                }
            };
            let stream: EventStream = Box::pin(stream);
            Ok(stream)
        }
    }
}

/// Accumulates `data:` lines until the blank line that ends an event.
#[derive(Debug, Default)]
struct SseFrame {
    data: Vec<String>,
}

impl SseFrame {
    fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data).join("\n"));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ends_on_blank_line() {
        let mut frame = SseFrame::default();
        assert_eq!(frame.push_line("id: 7"), None);
        assert_eq!(frame.push_line("event: new_message"), None);
        assert_eq!(frame.push_line("data: {\"a\":1}"), None);
        assert_eq!(frame.push_line(""), Some("{\"a\":1}".to_string()));
        // nothing buffered
        assert_eq!(frame.push_line(""), None);
    }

    #[test]
    fn comments_are_ignored_and_data_lines_join() {
        let mut frame = SseFrame::default();
        assert_eq!(frame.push_line(":keep-alive"), None);
        assert_eq!(frame.push_line(""), None);
        frame.push_line("data:one");
        frame.push_line("data: two\r");
        assert_eq!(frame.push_line("\r"), Some("one\ntwo".to_string()));
    }

    #[tokio::test]
    async fn unreachable_server_fails_to_connect() {
        let connector =
            ChannelConnector::new("http://127.0.0.1:1", "t", Duration::from_secs(1)).unwrap();
        let result = connector.connect(&[Scope::User("u1".into())], Some(3)).await;
        assert!(matches!(result, Err(RealtimeError::Connect(_))));
    }
}
