use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Full};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    Method, Request, StatusCode, Uri,
};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{builder::BuildError, config::Configuration};

use super::{join_lines, Transport, TransportError, TransportFuture};

const TOKEN_HEADER: &str = "M-Api-Token";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
enum HttpClient {
    Plain(Client<HttpConnector, Full<Bytes>>),
    Tls(Client<HttpsConnector<HttpConnector>, Full<Bytes>>),
}

impl HttpClient {
    fn new(secure: bool) -> Result<Self, TransportError> {
        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_idle_timeout(POOL_IDLE_TIMEOUT).pool_timer(TokioTimer::new());

        if secure {
            let https = hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| TransportError::Request(format!("no native root CA certificates found: {e}")))?
                .https_only()
                .enable_http1()
                .build();
            Ok(HttpClient::Tls(builder.build(https)))
        } else {
            Ok(HttpClient::Plain(builder.build(HttpConnector::new())))
        }
    }

    async fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<hyper::body::Incoming>, TransportError> {
        let result = match self {
            HttpClient::Plain(client) => client.request(req).await,
            HttpClient::Tls(client) => client.request(req).await,
        };
        result.map_err(|e| TransportError::Request(e.to_string()))
    }
}

enum ClientState {
    Idle,
    Ready(HttpClient),
    Closed,
}

struct Shared {
    endpoint: Uri,
    token: HeaderValue,
    secure: bool,
    timeout: Duration,
    state: Mutex<ClientState>,
}

impl Shared {
    fn current(&self) -> Result<Option<HttpClient>, TransportError> {
        match &*self.state.lock() {
            ClientState::Idle => Ok(None),
            ClientState::Ready(client) => Ok(Some(client.clone())),
            ClientState::Closed => Err(TransportError::Closed),
        }
    }

    fn client(&self) -> Result<HttpClient, TransportError> {
        if let Some(client) = self.current()? {
            return Ok(client);
        }

        // Loading native roots can block, so the client is built before taking the lock.
        let created = HttpClient::new(self.secure)?;

        let mut state = self.state.lock();
        match &*state {
            // Another send created a client concurrently, so keep using that one.
            ClientState::Ready(client) => Ok(client.clone()),
            ClientState::Closed => Err(TransportError::Closed),
            ClientState::Idle => {
                debug!(endpoint = %self.endpoint, "Created HTTP client.");
                *state = ClientState::Ready(created.clone());
                Ok(created)
            }
        }
    }

    async fn put(&self, payload: String) -> Result<(), TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(payload))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    async fn exchange(&self, payload: String) -> Result<(), TransportError> {
        let client = self.client()?;

        let req = Request::builder()
            .method(Method::PUT)
            .uri(self.endpoint.clone())
            .header(TOKEN_HEADER, self.token.clone())
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::from(payload))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let response = client.request(req).await?;

        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(Collected::to_bytes)
            .map_err(|_| ())
            .and_then(|b| String::from_utf8(b[..].to_vec()).map_err(|_| ()))
            .unwrap_or_else(|()| String::from("<failed to read response body>"));

        let reason = if body.is_empty() {
            status.canonical_reason().unwrap_or_else(|| status.as_str()).to_string()
        } else {
            body
        };

        Err(TransportError::UnexpectedStatus { status: status.as_u16(), reason })
    }
}

/// Transport sending each batch as the body of a `PUT` request.
///
/// Requests carry the API token in the `M-Api-Token` header and are only considered delivered when the collector
/// answers `201 Created`. The client is created on [`Transport::start`] or on the first send, and its connections are
/// pooled across requests.
pub struct HttpTransport {
    shared: Arc<Shared>,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` from the configured host, port, path, token and timeout.
    ///
    /// # Errors
    ///
    /// If no token is configured, if the token is not a valid header value, or if the host, port and path do not
    /// form a valid URI, an error is returned.
    pub fn new(config: &Configuration) -> Result<Self, BuildError> {
        let token = config.token().ok_or(BuildError::MissingToken)?;
        let mut token = HeaderValue::from_str(token).map_err(|_| BuildError::InvalidToken)?;
        token.set_sensitive(true);

        let endpoint = endpoint(config)?;

        Ok(HttpTransport {
            shared: Arc::new(Shared {
                endpoint,
                token,
                secure: config.secure(),
                timeout: config.timeout(),
                state: Mutex::new(ClientState::Idle),
            }),
        })
    }

    /// Returns the URI metrics are sent to.
    pub fn endpoint(&self) -> &Uri {
        &self.shared.endpoint
    }
}

fn endpoint(config: &Configuration) -> Result<Uri, BuildError> {
    let scheme = if config.secure() { "https" } else { "http" };
    let host = config.host();
    let port = config.port();
    let path = config.http_metrics_path();

    let raw = if host.contains(':') && !host.starts_with('[') {
        format!("{scheme}://[{host}]:{port}{path}")
    } else {
        format!("{scheme}://{host}:{port}{path}")
    };

    raw.parse::<Uri>().map_err(|e| BuildError::InvalidHttpEndpoint { endpoint: raw, reason: e.to_string() })
}

impl Transport for HttpTransport {
    fn transport_id(&self) -> &'static str {
        "http"
    }

    fn start(&self) -> TransportFuture {
        let result = self.shared.client().map(|_| ());
        Box::pin(async move { result })
    }

    fn send(&self, lines: Vec<String>) -> TransportFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if lines.is_empty() {
                return Ok(());
            }

            let count = lines.len();
            let payload = join_lines(&lines);
            let result = shared.put(payload.clone()).await;

            match &result {
                Ok(()) => trace!(lines = count, endpoint = %shared.endpoint, "Sent HTTP payload."),
                Err(TransportError::UnexpectedStatus { status, reason }) => error!(
                    message = "Unexpected status after sending metrics.",
                    status,
                    body = %reason,
                    %payload,
                ),
                Err(e) => error!(error = %e, %payload, "Failed to send metrics over HTTP."),
            }

            result
        })
    }

    fn close(&self) -> TransportFuture {
        let previous = std::mem::replace(&mut *self.shared.state.lock(), ClientState::Closed);
        if matches!(previous, ClientState::Ready(_)) {
            debug!("Released HTTP client.");
        }

        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::{sleep, timeout},
    };

    use crate::{builder::StatfulBuilder, BuildError, Transport, TransportError, TransportKind};

    use super::HttpTransport;

    const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

    fn http() -> StatfulBuilder {
        StatfulBuilder::default().with_transport(TransportKind::Http).with_token("secret")
    }

    fn local(port: u16, request_timeout: Duration) -> HttpTransport {
        let config = http()
            .with_secure(false)
            .with_host("127.0.0.1")
            .with_port(port)
            .with_timeout(request_timeout)
            .into_configuration()
            .unwrap();
        HttpTransport::new(&config).unwrap()
    }

    // Accepts one connection, waits for the request head, then writes `response` after `delay` and keeps the
    // connection open until the client goes away.
    async fn collector(response: &'static str, delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }

            sleep(delay).await;
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }

            while let Ok(n) = stream.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
            }
        });

        port
    }

    #[test]
    fn endpoint_from_configuration() {
        // Cases are defined as: host, port, secure, expected endpoint.
        let cases = [
            ("127.0.0.1", 2013, true, "https://127.0.0.1:2013/tel/v2.0/metrics"),
            ("collector.local", 8080, false, "http://collector.local:8080/tel/v2.0/metrics"),
            ("::1", 443, true, "https://[::1]:443/tel/v2.0/metrics"),
        ];

        for (host, port, secure, expected) in cases {
            let config = http().with_host(host).with_port(port).with_secure(secure).into_configuration().unwrap();
            let transport = HttpTransport::new(&config).unwrap();
            assert_eq!(transport.endpoint().to_string(), expected);
        }
    }

    #[test]
    fn custom_metrics_path() {
        let config = http().with_secure(false).with_http_metrics_path("/custom").into_configuration().unwrap();
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint().path(), "/custom");
    }

    #[test]
    fn token_is_required() {
        let config = StatfulBuilder::default().with_transport(TransportKind::Http).into_configuration().unwrap();
        assert!(matches!(HttpTransport::new(&config), Err(BuildError::MissingToken)));

        let config = http().with_token("bad\ntoken").into_configuration().unwrap();
        assert!(matches!(HttpTransport::new(&config), Err(BuildError::InvalidToken)));
    }

    #[tokio::test]
    async fn timeout_covers_the_response_body() {
        let response = "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 64\r\n\r\npartial";
        let port = collector(response, Duration::ZERO).await;
        let transport = local(port, Duration::from_millis(200));

        let result =
            timeout(WAIT_TIMEOUT, transport.send(vec!["a 1 100 100".into()])).await.expect("send did not resolve");
        assert!(matches!(result, Err(TransportError::Timeout(_))), "unexpected result: {result:?}");
    }

    #[tokio::test]
    async fn close_during_send() {
        let port = collector("HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n", Duration::from_millis(300)).await;
        let transport = local(port, Duration::from_secs(2));

        let pending = tokio::spawn(transport.send(vec!["a 1 100 100".into()]));
        sleep(Duration::from_millis(100)).await;
        transport.close().await.unwrap();

        // The request already on the wire either completes or fails, but the task must not panic.
        let outcome = timeout(WAIT_TIMEOUT, pending).await.expect("send did not resolve");
        assert!(outcome.is_ok(), "send task panicked");

        let result = transport.send(vec!["b 1 100 100".into()]).await;
        assert!(matches!(result, Err(TransportError::Closed)), "unexpected result: {result:?}");
    }
}
