/*!
 * HTTP client wrapper.
 *
 * Devices talk to scanners through this thin layer: requests are
 * submitted from the event-loop thread and their completions are
 * delivered back on it, so protocol decoding never races a state
 * transition. The actual transport is pluggable; production uses
 * reqwest, tests inject a scripted transport.
 */
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Method;
use thiserror::Error;
use url::Url;

use scanflow_core::eloop::EloopHandle;

/// An HTTP request as built by a protocol handler
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method
    pub method: Method,
    /// Absolute request URI
    pub uri: Url,
    /// Request body, if any
    pub body: Option<Bytes>,
    /// Content type of the body
    pub content_type: Option<String>,
}

impl HttpRequest {
    /// Build a bodyless GET request
    pub fn get(uri: Url) -> Self {
        Self {
            method: Method::GET,
            uri,
            body: None,
            content_type: None,
        }
    }

    /// Build a POST request with a body
    pub fn post(uri: Url, body: Bytes, content_type: &str) -> Self {
        Self {
            method: Method::POST,
            uri,
            body: Some(body),
            content_type: Some(content_type.to_string()),
        }
    }

    /// Build a bodyless DELETE request
    pub fn delete(uri: Url) -> Self {
        Self {
            method: Method::DELETE,
            uri,
            body: None,
            content_type: None,
        }
    }
}

/// An HTTP reply, as seen by protocol handlers.
///
/// Transport failures never produce a reply; they surface as
/// [`HttpError`] through the error path instead. Non-2xx statuses are
/// replies like any other, for the handler to interpret.
#[derive(Debug, Clone)]
pub struct HttpReply {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
    /// Content type of the body
    pub content_type: Option<String>,
}

impl HttpReply {
    /// Whether the status code is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level error
#[derive(Error, Debug, Clone)]
pub enum HttpError {
    /// The request could not be performed
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        HttpError::Transport(err.to_string())
    }
}

/// The transport a device's HTTP client runs on
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one request/reply exchange
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpReply, HttpError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a default client
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    /// Create a transport over an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpReply, HttpError> {
        let mut builder = self.client.request(request.method, request.uri);
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(HttpReply {
            status,
            body,
            content_type,
        })
    }
}

type OnError = Arc<dyn Fn(HttpError) + Send + Sync>;

/// Per-device HTTP client.
///
/// Holds at most one request in flight; the device state machine never
/// submits a second one before the first completes or is cancelled.
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    eloop: EloopHandle,
    inflight: Mutex<Option<tokio::task::JoinHandle<()>>>,
    onerror: Mutex<Option<OnError>>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("inflight", &self.inflight.lock().is_some())
            .finish()
    }
}

impl HttpClient {
    /// Create a client over the given transport
    pub fn new(transport: Arc<dyn HttpTransport>, eloop: EloopHandle) -> Self {
        Self {
            transport,
            eloop,
            inflight: Mutex::new(None),
            onerror: Mutex::new(None),
        }
    }

    /// Install the transport-error callback.
    ///
    /// Once installed, transport failures are routed here instead of the
    /// per-request callback. Capability probing runs before installation
    /// and therefore sees errors in its own callback.
    pub fn set_onerror<F>(&self, callback: F)
    where
        F: Fn(HttpError) + Send + Sync + 'static,
    {
        *self.onerror.lock() = Some(Arc::new(callback));
    }

    /// Submit a request. The callback runs on the event-loop thread.
    pub fn submit<F>(self: &Arc<Self>, request: HttpRequest, callback: F)
    where
        F: FnOnce(Result<HttpReply, HttpError>) + Send + 'static,
    {
        let client = self.clone();
        let task = self.eloop.spawn(async move {
            let result = client.transport.roundtrip(request).await;
            client.inflight.lock().take();

            match result {
                Err(err) => {
                    let onerror = client.onerror.lock().clone();
                    match onerror {
                        Some(onerror) => onerror(err),
                        None => callback(Err(err)),
                    }
                }
                Ok(reply) => callback(Ok(reply)),
            }
        });

        let mut inflight = self.inflight.lock();
        debug_assert!(
            inflight.as_ref().map_or(true, |t| t.is_finished()),
            "one request in flight per device"
        );
        *inflight = Some(task);
    }

    /// Cancel the in-flight request, if any. Neither callback runs for a
    /// cancelled request.
    pub fn cancel(&self) {
        if let Some(task) = self.inflight.lock().take() {
            task.abort();
        }
    }
}
