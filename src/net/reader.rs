//! Progressive HTTP(S) byte reader.
//!
//! [`HttpConnector`] opens a GET request against the stream URL and spawns a
//! task that forwards response bytes to the engine as they arrive:
//! - advertises ICY support via `Icy-Metadata: 1`
//! - resumes at a byte offset with `Range: bytes=N-` (how seeking reopens)
//! - follows at most one redirect hop
//! - honors an optional HTTP or SOCKS proxy
//!
//! The returned [`ReaderHandle`] is the back-pressure primitive: while
//! unscheduled the task stops polling the response body, the TCP receive
//! window fills up, and the remote paces down. Closing cancels the task and
//! drops the connection.

use crate::errors::StreamError;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::{redirect::Policy, Client, Proxy, Url};
use std::collections::HashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Events emitted by the network reader, in arrival order.
#[derive(Debug)]
pub enum NetEvent {
    /// Response line and headers (keys lower-cased)
    Headers {
        status: u16,
        headers: HashMap<String, String>,
    },
    /// A chunk of response body
    Bytes(Bytes),
    /// The body ended normally
    EndOfStream,
    /// The connection failed; no further events follow
    Failed(StreamError),
}

/// Proxy configuration for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfig {
    /// Whatever the environment says (reqwest reads the proxy env vars)
    SystemDefault,
    /// Connect directly, ignoring any system proxy
    Direct,
    /// HTTP CONNECT proxy
    Http { host: String, port: u16 },
    /// SOCKS5 proxy
    Socks { host: String, port: u16 },
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig::SystemDefault
    }
}

/// Callback through which a reader delivers its events. The engine wires
/// this to its control loop; stages never hold the engine itself.
pub type NetEventSink = Box<dyn Fn(NetEvent) + Send + Sync>;

/// Control surface of a running reader task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ReaderHandle {
    scheduled: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl ReaderHandle {
    /// Build a handle from its parts. Custom [`Connector`] implementations
    /// use this to expose their own scheduling state.
    pub fn new(scheduled: watch::Sender<bool>, cancel: CancellationToken) -> Self {
        Self { scheduled, cancel }
    }

    /// Stop delivering bytes without closing the socket.
    pub fn unschedule(&self) {
        let _ = self.scheduled.send(false);
    }

    /// Resume delivering bytes after [`ReaderHandle::unschedule`].
    pub fn schedule(&self) {
        let _ = self.scheduled.send(true);
    }

    pub fn is_scheduled(&self) -> bool {
        *self.scheduled.borrow()
    }

    /// Cancel the task and drop the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens byte streams for the engine. The production implementation is
/// [`HttpConnector`]; tests substitute their own.
pub trait Connector: Send + Sync {
    /// Open `url` at `byte_offset` and deliver [`NetEvent`]s to `events`.
    /// Must be called from within a tokio runtime.
    fn open(
        &self,
        url: &Url,
        byte_offset: u64,
        proxy: &ProxyConfig,
        events: NetEventSink,
    ) -> ReaderHandle;
}

/// Production connector: reqwest GET with streamed body.
#[derive(Debug, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn open(
        &self,
        url: &Url,
        byte_offset: u64,
        proxy: &ProxyConfig,
        events: NetEventSink,
    ) -> ReaderHandle {
        let (scheduled, scheduled_rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        tokio::spawn(run_transfer(
            url.clone(),
            byte_offset,
            proxy.clone(),
            events,
            scheduled_rx,
            cancel.clone(),
        ));
        ReaderHandle { scheduled, cancel }
    }
}

fn build_client(proxy: &ProxyConfig) -> Result<Client, reqwest::Error> {
    // one redirect hop; more than that is treated as a broken stream
    let builder = Client::builder().redirect(Policy::limited(1));
    let builder = match proxy {
        ProxyConfig::SystemDefault => builder,
        ProxyConfig::Direct => builder.no_proxy(),
        ProxyConfig::Http { host, port } => {
            builder.proxy(Proxy::all(format!("http://{}:{}", host, port))?)
        }
        ProxyConfig::Socks { host, port } => {
            builder.proxy(Proxy::all(format!("socks5://{}:{}", host, port))?)
        }
    };
    builder.build()
}

async fn run_transfer(
    url: Url,
    byte_offset: u64,
    proxy: ProxyConfig,
    events: NetEventSink,
    mut scheduled: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let client = match build_client(&proxy) {
        Ok(client) => client,
        Err(e) => {
            events(NetEvent::Failed(e.into()));
            return;
        }
    };

    let mut request = client
        .get(url.clone())
        .header("Icy-Metadata", HeaderValue::from_static("1"));
    if byte_offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", byte_offset));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = request.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "stream connection failed");
            events(NetEvent::Failed(e.into()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        events(NetEvent::Failed(StreamError::NetworkConnectionFailed(
            format!("HTTP {}", status.as_u16()),
        )));
        return;
    }

    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    debug!(url = %url, status = status.as_u16(), "stream connected");
    events(NetEvent::Headers {
        status: status.as_u16(),
        headers,
    });

    let mut body = response.bytes_stream();
    loop {
        // back-pressure gate: while unscheduled, do not poll the body
        while !*scheduled.borrow() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = scheduled.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => events(NetEvent::Bytes(bytes)),
            Some(Err(e)) => {
                warn!(url = %url, error = %e, "stream read failed");
                events(NetEvent::Failed(e.into()));
                return;
            }
            None => {
                debug!(url = %url, "end of stream");
                events(NetEvent::EndOfStream);
                return;
            }
        }
    }
}
