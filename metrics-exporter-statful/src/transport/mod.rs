use std::{fmt, future::Future, io, pin::Pin, str::FromStr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::{builder::BuildError, config::Configuration};

pub mod http;
pub mod udp;

pub use self::http::HttpTransport;
pub use self::udp::UdpTransport;

/// Future returned by [`Transport`] operations.
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'static>>;

/// Errors that could occur while delivering a batch of metrics.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The HTTP request could not be performed.
    #[error("request failed: {0}")]
    Request(String),

    /// The HTTP request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The collector answered with something other than `201 Created`.
    #[error("unexpected status {status} ({reason})")]
    UnexpectedStatus {
        /// Status code of the response.
        status: u16,
        /// Reason phrase, or the response body when there is one.
        reason: String,
    },

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
}

/// Transport selector.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TransportKind {
    /// One datagram per batch.
    #[default]
    Udp,
    /// One `PUT` request per batch.
    Http,
}

impl TransportKind {
    /// Returns the short identifier of the transport.
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(TransportKind::Udp)
        } else if s.eq_ignore_ascii_case("http") {
            Ok(TransportKind::Http)
        } else {
            Err(BuildError::UnknownTransport(s.to_string()))
        }
    }
}

/// Delivers batches of encoded metric lines to a collector.
///
/// Implementations make a single attempt per batch: failures are logged and reported through the returned future,
/// but batches are never retried or re-buffered. Sending an empty batch succeeds immediately.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Returns the short identifier of the transport, such as `udp`.
    fn transport_id(&self) -> &'static str;

    /// Opens the underlying socket or client ahead of the first send.
    ///
    /// Calling this is optional: transports open their resources lazily on first use.
    fn start(&self) -> TransportFuture;

    /// Sends the lines as a single payload, joined by line breaks.
    fn send(&self, lines: Vec<String>) -> TransportFuture;

    /// Releases the underlying socket or client.
    ///
    /// Sends already in flight are not cancelled, but any later send fails with [`TransportError::Closed`].
    fn close(&self) -> TransportFuture;
}

/// Extension methods for [`Transport`].
pub trait TransportExt: Transport {
    /// Sends the lines in the background, ignoring the outcome.
    ///
    /// Failures are still logged by the transport.
    fn send_detached(&self, lines: Vec<String>, runtime: &Handle) {
        let send = self.send(lines);
        runtime.spawn(async move {
            let _ = send.await;
        });
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Creates the transport selected by the configuration.
///
/// No I/O is performed here: sockets and clients are opened on [`Transport::start`] or on first send.
///
/// # Errors
///
/// If the configuration does not allow building the selected transport (for example, an HTTP transport without a
/// token), an error is returned.
pub fn new_transport(config: &Configuration) -> Result<Arc<dyn Transport>, BuildError> {
    match config.transport() {
        TransportKind::Udp => {
            info!(host = config.host(), port = config.port(), "Creating UDP transport.");
            Ok(Arc::new(UdpTransport::new(config)))
        }
        TransportKind::Http => {
            info!(host = config.host(), port = config.port(), "Creating HTTP transport.");
            Ok(Arc::new(HttpTransport::new(config)?))
        }
    }
}

pub(crate) fn join_lines(lines: &[String]) -> String {
    lines.join("\n")
}
