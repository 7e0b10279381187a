use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, error, trace};

use crate::config::Configuration;

use super::{join_lines, Transport, TransportError, TransportFuture};

enum SocketState {
    // No socket yet, or the last send failed and the socket was dropped.
    Disconnected,

    // Socket is open and connected to the collector.
    Ready(Arc<UdpSocket>),

    // Transport was closed; nothing will be opened again.
    Closed,
}

struct Shared {
    host: String,
    port: u16,
    state: Mutex<SocketState>,
}

impl Shared {
    fn current(&self) -> Result<Option<Arc<UdpSocket>>, TransportError> {
        match &*self.state.lock() {
            SocketState::Disconnected => Ok(None),
            SocketState::Ready(socket) => Ok(Some(Arc::clone(socket))),
            SocketState::Closed => Err(TransportError::Closed),
        }
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        if let Some(socket) = self.current()? {
            return Ok(socket);
        }

        let opened = Arc::new(open_socket(&self.host, self.port).await?);
        debug!(host = %self.host, port = self.port, "Opened UDP socket.");

        let mut state = self.state.lock();
        match &*state {
            // Another flush opened a socket concurrently, so keep using that one.
            SocketState::Ready(socket) => Ok(Arc::clone(socket)),
            SocketState::Closed => Err(TransportError::Closed),
            SocketState::Disconnected => {
                *state = SocketState::Ready(Arc::clone(&opened));
                Ok(opened)
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SocketState::Ready(_)) {
            *state = SocketState::Disconnected;
        }
    }
}

async fn open_socket(host: &str, port: u16) -> io::Result<UdpSocket> {
    let remote = lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address found for {host}:{port}"))
    })?;

    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

/// Transport sending each batch as a single UDP datagram.
///
/// The socket is opened on [`Transport::start`] or on the first send, then reused. Delivery is best-effort: a failed
/// send is logged and reported, and the socket is re-opened on the next batch.
pub struct UdpTransport {
    shared: Arc<Shared>,
}

impl UdpTransport {
    /// Creates a new `UdpTransport` targeting the configured host and port.
    pub fn new(config: &Configuration) -> Self {
        UdpTransport {
            shared: Arc::new(Shared {
                host: config.host().to_string(),
                port: config.port(),
                state: Mutex::new(SocketState::Disconnected),
            }),
        }
    }
}

impl Transport for UdpTransport {
    fn transport_id(&self) -> &'static str {
        "udp"
    }

    fn start(&self) -> TransportFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move { shared.socket().await.map(|_| ()) })
    }

    fn send(&self, lines: Vec<String>) -> TransportFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if lines.is_empty() {
                return Ok(());
            }

            let payload = join_lines(&lines);
            let result = match shared.socket().await {
                Ok(socket) => match socket.send(payload.as_bytes()).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        shared.reset();
                        Err(TransportError::Io(e))
                    }
                },
                Err(e) => Err(e),
            };

            match &result {
                Ok(()) => trace!(lines = lines.len(), bytes = payload.len(), "Sent UDP payload."),
                Err(e) => error!(error = %e, %payload, "Failed to send metrics over UDP."),
            }

            result
        })
    }

    fn close(&self) -> TransportFuture {
        let previous = std::mem::replace(&mut *self.shared.state.lock(), SocketState::Closed);
        if matches!(previous, SocketState::Ready(_)) {
            debug!("Closed UDP socket.");
        }

        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{net::UdpSocket, time::timeout};

    use crate::{builder::StatfulBuilder, Transport, TransportError};

    use super::UdpTransport;

    async fn receiver() -> (UdpSocket, UdpTransport) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let config = StatfulBuilder::default().with_host("127.0.0.1").with_port(port).into_configuration().unwrap();

        (receiver, UdpTransport::new(&config))
    }

    #[tokio::test]
    async fn sends_one_datagram_per_batch() {
        let (receiver, transport) = receiver().await;

        transport.send(vec!["a 1 1 100".into(), "b 2 2 100".into()]).await.unwrap();

        let mut buf = [0u8; 1024];
        let len = timeout(Duration::from_secs(5), receiver.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"a 1 1 100\nb 2 2 100");
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (receiver, transport) = receiver().await;

        transport.send(Vec::new()).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(timeout(Duration::from_millis(100), receiver.recv(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (_receiver, transport) = receiver().await;

        transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let result = transport.send(vec!["a 1 1 100".into()]).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn close_during_sends() {
        let (_receiver, transport) = receiver().await;
        transport.start().await.unwrap();

        let pending: Vec<_> = (0..8).map(|i| tokio::spawn(transport.send(vec![format!("a {i} 1 100")]))).collect();
        transport.close().await.unwrap();

        for handle in pending {
            let joined = timeout(Duration::from_secs(5), handle).await.expect("send did not resolve");
            let result = joined.expect("send panicked");
            assert!(matches!(result, Ok(()) | Err(TransportError::Closed)), "unexpected result: {result:?}");
        }
    }
}
