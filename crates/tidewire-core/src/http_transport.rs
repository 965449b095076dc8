//! Wire transport over HTTP using reqwest.
//!
//! `GET {base}/streams/{stream_id}/events`, with the resume point sent both
//! as the `Last-Event-ID` header and the `last_event_id` query parameter for
//! intermediaries that strip custom headers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::event::EventId;
use crate::transport::{BoxedStream, Transport, TransportError, TransportStream};
use crate::wire::{CONTENT_TYPE, LAST_EVENT_ID_HEADER, LAST_EVENT_ID_QUERY};
use crate::StreamId;

/// HTTP client side of the wire protocol.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Arc<reqwest::Client>,
    base_url: String,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("tidewire/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Use a preconfigured reqwest client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Arc::new(client);
        self
    }

    /// Bound on the time until response headers arrive.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn events_url(&self, stream_id: &StreamId, last_event_id: Option<EventId>) -> String {
        let mut url = format!(
            "{}/streams/{}/events",
            self.base_url,
            urlencoding::encode(stream_id.as_str())
        );
        if let Some(last) = last_event_id {
            url.push_str(&format!("?{LAST_EVENT_ID_QUERY}={last}"));
        }
        url
    }
}

fn classify_status(status: reqwest::StatusCode, stream_id: &StreamId) -> TransportError {
    match status.as_u16() {
        404 => TransportError::not_found(format!("stream '{stream_id}' not found")),
        410 => TransportError::gone(format!(
            "stream '{stream_id}' no longer retains the requested events"
        )),
        code if status.is_server_error() || code == 429 || code == 408 => {
            TransportError::unexpected(format!("server responded with status {code}"))
        }
        code => TransportError::rejected(format!("request rejected with status {code}")),
    }
}

fn classify_error(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timed_out(format!("request timeout: {error}"))
    } else if error.is_connect() {
        TransportError::refused(format!("connection failed: {error}"))
    } else {
        TransportError::reset(format!("request failed: {error}"))
    }
}

impl Transport for HttpTransport {
    fn connect<'a>(
        &'a self,
        stream_id: &'a StreamId,
        last_event_id: Option<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .get(self.events_url(stream_id, last_event_id))
                .header(reqwest::header::ACCEPT, CONTENT_TYPE);
            if let Some(last) = last_event_id {
                builder = builder.header(LAST_EVENT_ID_HEADER, last.to_string());
            }

            let response = tokio::time::timeout(self.connect_timeout, builder.send())
                .await
                .map_err(|_| {
                    TransportError::timed_out(format!(
                        "no response within {} ms",
                        self.connect_timeout.as_millis()
                    ))
                })?
                .map_err(|error| classify_error(&error))?;

            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(status, stream_id));
            }

            tracing::debug!(stream_id = %stream_id, last_event_id = ?last_event_id, "http stream opened");
            Ok(Box::new(HttpStream { response }) as BoxedStream)
        })
    }
}

struct HttpStream {
    response: reqwest::Response,
}

impl TransportStream for HttpStream {
    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|error| classify_error(&error))?;
            Ok(chunk.map(|bytes| bytes.to_vec()))
        })
    }
}
