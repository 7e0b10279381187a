use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, Counter};
use parking_lot::Mutex;

/// Point-in-time totals of the exporter's own activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TelemetrySnapshot {
    /// Records accepted into the buffer.
    pub points_enqueued: u64,

    /// Records rejected by the sampler.
    pub points_sampled_out: u64,

    /// Records discarded because the buffer was full.
    pub points_dropped: u64,

    /// Batches the transport reported as delivered.
    pub payloads_sent: u64,

    /// Batches the transport failed to deliver.
    pub payloads_failed: u64,

    /// Lines contained in delivered batches.
    pub lines_sent: u64,
}

impl TelemetrySnapshot {
    fn delta(&self, previous: &TelemetrySnapshot) -> TelemetrySnapshot {
        TelemetrySnapshot {
            points_enqueued: self.points_enqueued.saturating_sub(previous.points_enqueued),
            points_sampled_out: self.points_sampled_out.saturating_sub(previous.points_sampled_out),
            points_dropped: self.points_dropped.saturating_sub(previous.points_dropped),
            payloads_sent: self.payloads_sent.saturating_sub(previous.payloads_sent),
            payloads_failed: self.payloads_failed.saturating_sub(previous.payloads_failed),
            lines_sent: self.lines_sent.saturating_sub(previous.lines_sent),
        }
    }
}

struct Handles {
    points_enqueued: Counter,
    points_sampled_out: Counter,
    points_dropped: Counter,
    payloads_sent: Counter,
    payloads_failed: Counter,
    lines_sent: Counter,
}

impl Handles {
    fn register(transport: &'static str) -> Self {
        Handles {
            points_enqueued: counter!("statful.client.points_enqueued", "client_transport" => transport),
            points_sampled_out: counter!("statful.client.points_sampled_out", "client_transport" => transport),
            points_dropped: counter!("statful.client.points_dropped", "client_transport" => transport),
            payloads_sent: counter!("statful.client.payloads_sent", "client_transport" => transport),
            payloads_failed: counter!("statful.client.payloads_failed", "client_transport" => transport),
            lines_sent: counter!("statful.client.lines_sent", "client_transport" => transport),
        }
    }

    fn apply(&self, delta: &TelemetrySnapshot) {
        let updates = [
            (&self.points_enqueued, delta.points_enqueued),
            (&self.points_sampled_out, delta.points_sampled_out),
            (&self.points_dropped, delta.points_dropped),
            (&self.payloads_sent, delta.payloads_sent),
            (&self.payloads_failed, delta.payloads_failed),
            (&self.lines_sent, delta.lines_sent),
        ];

        for (handle, value) in updates {
            if value > 0 {
                handle.increment(value);
            }
        }
    }
}

#[derive(Default)]
struct Publisher {
    handles: Option<Handles>,
    published: TelemetrySnapshot,
}

/// Exporter telemetry.
///
/// Totals are always tracked, and can be read with [`Dispatcher::telemetry`][crate::Dispatcher::telemetry]. When
/// publishing is enabled, each flush also reports what changed since the previous flush as `statful.client.*`
/// counters through the `metrics` facade.
pub(crate) struct Telemetry {
    enabled: bool,
    transport: &'static str,
    points_enqueued: AtomicU64,
    points_sampled_out: AtomicU64,
    points_dropped: AtomicU64,
    payloads_sent: AtomicU64,
    payloads_failed: AtomicU64,
    lines_sent: AtomicU64,
    publisher: Mutex<Publisher>,
}

impl Telemetry {
    pub fn new(enabled: bool, transport: &'static str) -> Self {
        Telemetry {
            enabled,
            transport,
            points_enqueued: AtomicU64::new(0),
            points_sampled_out: AtomicU64::new(0),
            points_dropped: AtomicU64::new(0),
            payloads_sent: AtomicU64::new(0),
            payloads_failed: AtomicU64::new(0),
            lines_sent: AtomicU64::new(0),
            publisher: Mutex::new(Publisher::default()),
        }
    }

    pub fn track_enqueued(&self) {
        self.points_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_sampled_out(&self) {
        self.points_sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_dropped(&self) {
        self.points_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_send_succeeded(&self, lines: usize) {
        self.payloads_sent.fetch_add(1, Ordering::Relaxed);
        self.lines_sent.fetch_add(lines as u64, Ordering::Relaxed);
    }

    pub fn track_send_failed(&self) {
        self.payloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            points_enqueued: self.points_enqueued.load(Ordering::Relaxed),
            points_sampled_out: self.points_sampled_out.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
            payloads_failed: self.payloads_failed.load(Ordering::Relaxed),
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
        }
    }

    /// Reports changes since the last call to the installed `metrics` recorder.
    ///
    /// When the exporter itself is the installed recorder, updating the counters feeds back into the dispatcher and
    /// may trigger another flush. That nested call finds the publisher busy and returns immediately.
    pub fn publish(&self) {
        if !self.enabled {
            return;
        }

        let Some(mut publisher) = self.publisher.try_lock() else {
            return;
        };

        let current = self.snapshot();
        let delta = current.delta(&publisher.published);
        if delta == TelemetrySnapshot::default() {
            return;
        }
        publisher.published = current;

        let transport = self.transport;
        publisher.handles.get_or_insert_with(|| Handles::register(transport)).apply(&delta);
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::{Telemetry, TelemetrySnapshot};

    fn counters(recorder: &DebuggingRecorder) -> Vec<(String, u64)> {
        let mut counters: Vec<(String, u64)> = recorder
            .snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(value) => Some((key.key().name().to_string(), value)),
                _ => None,
            })
            .collect();
        counters.sort();
        counters
    }

    #[test]
    fn snapshot_tracks_totals() {
        let telemetry = Telemetry::new(false, "udp");
        telemetry.track_enqueued();
        telemetry.track_enqueued();
        telemetry.track_sampled_out();
        telemetry.track_dropped();
        telemetry.track_send_succeeded(2);
        telemetry.track_send_failed();

        let expected = TelemetrySnapshot {
            points_enqueued: 2,
            points_sampled_out: 1,
            points_dropped: 1,
            payloads_sent: 1,
            payloads_failed: 1,
            lines_sent: 2,
        };
        assert_eq!(telemetry.snapshot(), expected);
    }

    #[test]
    fn publishes_deltas_when_enabled() {
        let recorder = DebuggingRecorder::new();
        let telemetry = Telemetry::new(true, "udp");

        metrics::with_local_recorder(&recorder, || {
            telemetry.track_enqueued();
            telemetry.track_enqueued();
            telemetry.track_send_succeeded(2);
            telemetry.publish();

            telemetry.track_enqueued();
            telemetry.publish();

            // Nothing changed, so nothing is reported.
            telemetry.publish();
        });

        assert_eq!(
            counters(&recorder),
            [
                ("statful.client.lines_sent".to_string(), 2),
                ("statful.client.payloads_failed".to_string(), 0),
                ("statful.client.payloads_sent".to_string(), 1),
                ("statful.client.points_dropped".to_string(), 0),
                ("statful.client.points_enqueued".to_string(), 3),
                ("statful.client.points_sampled_out".to_string(), 0),
            ]
        );
    }

    #[test]
    fn publishes_nothing_when_disabled() {
        let recorder = DebuggingRecorder::new();
        let telemetry = Telemetry::new(false, "http");

        metrics::with_local_recorder(&recorder, || {
            telemetry.track_enqueued();
            telemetry.publish();
        });

        assert!(counters(&recorder).is_empty());
    }
}
