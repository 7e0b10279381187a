use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::oneshot,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::{
    buffer::MetricBuffer,
    config::Configuration,
    encoder::LineEncoder,
    record::{Record, UnboundRecord},
    sampler::Sampler,
    telemetry::{Telemetry, TelemetrySnapshot},
    transport::{join_lines, Transport, TransportError, TransportFuture},
};

/// Callback invoked with the outcome of a flush.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

struct Inner {
    config: Arc<Configuration>,
    buffer: MetricBuffer,
    sampler: Sampler,
    encoder: LineEncoder,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    telemetry: Arc<Telemetry>,
}

impl Inner {
    fn flush(&self, on_complete: Option<Completion>) {
        self.telemetry.publish();

        let batch = self.buffer.drain(self.config.flush_size());
        if batch.is_empty() {
            if let Some(on_complete) = on_complete {
                on_complete(Ok(()));
            }
            return;
        }

        let lines: Vec<String> = batch.iter().map(|record| self.encoder.encode(record)).collect();

        if self.config.dry_run() {
            debug!(lines = lines.len(), "Dry run enabled, not sending metrics:\n{}", join_lines(&lines));
            if let Some(on_complete) = on_complete {
                on_complete(Ok(()));
            }
            return;
        }

        let count = lines.len();
        let send = self.transport.send(lines);
        let telemetry = Arc::clone(&self.telemetry);
        self.runtime.spawn(async move {
            let result = send.await;
            match &result {
                Ok(()) => telemetry.track_send_succeeded(count),
                Err(_) => telemetry.track_send_failed(),
            }
            if let Some(on_complete) = on_complete {
                on_complete(result);
            }
        });
    }
}

async fn run_flusher(inner: Arc<Inner>, mut shutdown: oneshot::Receiver<()>) {
    if inner.config.dry_run() {
        debug!("Dry run enabled, transport will not be started.");
    } else if let Err(e) = inner.transport.start().await {
        let transport = inner.transport.transport_id();
        warn!(error = %e, transport, "Failed to start transport. Retrying on next flush.");
    }

    let period = inner.config.flush_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.flush(None),
            // Either `close` was called or the dispatcher was dropped.
            _ = &mut shutdown => break,
        }
    }

    debug!("Periodic flusher stopped.");
}

/// Buffers metrics and ships them to the collector in batches.
///
/// Producers call [`add_metric`][Dispatcher::add_metric] from any thread. The call never blocks: records are
/// sampled, then pushed onto a bounded queue. Batches of up to `flush_size` records are sent when the queue reaches
/// `flush_size` records, when it is full, and periodically every `flush_interval`.
///
/// Delivery is best-effort. A full queue drops the incoming record, and a batch the transport fails to deliver is
/// lost: failures are logged and counted, never retried.
pub struct Dispatcher {
    inner: Arc<Inner>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Dispatcher {
    /// Creates the dispatcher and the future driving its periodic flushes.
    ///
    /// The future must be spawned on `runtime` (or driven by a thread blocking on it) for periodic flushes to happen.
    pub(crate) fn new(
        config: Arc<Configuration>,
        transport: Arc<dyn Transport>,
        sampler: Sampler,
        runtime: Handle,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let telemetry = Arc::new(Telemetry::new(config.telemetry(), transport.transport_id()));
        let inner = Arc::new(Inner {
            buffer: MetricBuffer::new(config.max_buffer_size()),
            encoder: LineEncoder::new(Arc::clone(&config)),
            config,
            sampler,
            transport,
            runtime,
            telemetry,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let flusher = run_flusher(Arc::clone(&inner), shutdown_rx);

        (Dispatcher { inner, shutdown: Mutex::new(Some(shutdown_tx)) }, flusher)
    }

    /// Adds a metric to the buffer.
    ///
    /// Returns `true` if the metric was buffered, or `false` if it was rejected by the sampler or discarded because
    /// the buffer is full. A full buffer also triggers an immediate flush.
    pub fn add_metric(&self, record: Record) -> bool {
        let inner = &self.inner;

        if !inner.sampler.should_keep() {
            inner.telemetry.track_sampled_out();
            trace!(name = record.name(), "Metric rejected by sampler.");
            return false;
        }

        match inner.buffer.offer(record) {
            Ok(buffered) => {
                inner.telemetry.track_enqueued();
                if buffered >= inner.config.flush_size() {
                    inner.flush(None);
                }
                true
            }
            Err(record) => {
                inner.telemetry.track_dropped();
                warn!(
                    line = %inner.encoder.encode(&record),
                    capacity = inner.buffer.capacity(),
                    "Metric buffer is full, discarding metric."
                );
                inner.flush(None);
                false
            }
        }
    }

    /// Binds the record to this dispatcher's configuration, then adds it like [`add_metric`][Dispatcher::add_metric].
    ///
    /// Returns `false` if the record is invalid.
    pub fn add_unbound(&self, record: UnboundRecord) -> bool {
        let name = record.name().to_string();
        match record.bind(&self.inner.config) {
            Ok(record) => self.add_metric(record),
            Err(e) => {
                warn!(error = %e, %name, "Discarding invalid metric.");
                false
            }
        }
    }

    /// Sends up to `flush_size` buffered metrics.
    ///
    /// Returns once the batch has been handed to the transport. Delivery happens in the background.
    pub fn flush(&self) {
        self.inner.flush(None);
    }

    /// Sends up to `flush_size` buffered metrics, then calls `on_complete` with the outcome of the send.
    ///
    /// When nothing is buffered, or in dry-run mode, `on_complete` is called immediately with `Ok(())`.
    pub fn flush_with<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        self.inner.flush(Some(Box::new(on_complete)));
    }

    /// Stops periodic flushes and releases the transport.
    ///
    /// Metrics still buffered are not sent. Calling this more than once is harmless. In dry-run mode the transport was
    /// never started, so it is left untouched.
    pub fn close(&self) -> TransportFuture {
        if let Some(shutdown) = self.shutdown.lock().take() {
            debug!("Stopping periodic flusher.");
            let _ = shutdown.send(());
        }

        if self.inner.config.dry_run() {
            return Box::pin(async { Ok(()) });
        }

        self.inner.transport.close()
    }

    /// Number of metrics waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Configuration the dispatcher was built with.
    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }

    /// Totals of the dispatcher's activity since it was built.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }
}
