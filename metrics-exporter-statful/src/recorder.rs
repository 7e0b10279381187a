use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use metrics_util::registry::{Registry, Storage};
use tracing::debug;

use crate::{
    dispatcher::Dispatcher,
    record::{MetricKind, Record, Value},
};

// Name and labels of a registered metric, turned into a fresh record on every update.
struct MetricHandle {
    dispatcher: Arc<Dispatcher>,
    kind: MetricKind,
    name: String,
    tags: Vec<(String, String)>,
}

impl MetricHandle {
    fn new(dispatcher: &Arc<Dispatcher>, kind: MetricKind, key: &Key) -> Self {
        MetricHandle {
            dispatcher: Arc::clone(dispatcher),
            kind,
            name: key.name().to_string(),
            tags: key.labels().map(|label| (label.key().to_string(), label.value().to_string())).collect(),
        }
    }

    fn emit<V>(&self, value: V)
    where
        V: Into<Value>,
    {
        let record = Record::builder(self.kind, self.name.clone())
            .tags(self.tags.iter().cloned())
            .value(value)
            .build(self.dispatcher.configuration());

        match record {
            Ok(record) => {
                self.dispatcher.add_metric(record);
            }
            Err(e) => debug!(error = %e, name = %self.name, "Ignoring invalid metric."),
        }
    }
}

struct StatfulCounter(MetricHandle);

impl CounterFn for StatfulCounter {
    fn increment(&self, value: u64) {
        self.0.emit(value);
    }

    fn absolute(&self, value: u64) {
        self.0.emit(value);
    }
}

struct StatfulGauge {
    handle: MetricHandle,
    bits: AtomicU64,
}

impl StatfulGauge {
    fn update<F>(&self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current)).to_bits();
            match self.bits.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.handle.emit(f64::from_bits(next));
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl GaugeFn for StatfulGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

struct StatfulHistogram(MetricHandle);

impl HistogramFn for StatfulHistogram {
    fn record(&self, value: f64) {
        self.0.emit(value);
    }
}

// Creates the handles kept in the registry, each bound to the dispatcher its records go to.
struct RecordStorage {
    dispatcher: Arc<Dispatcher>,
}

impl Storage<Key> for RecordStorage {
    type Counter = Arc<StatfulCounter>;
    type Gauge = Arc<StatfulGauge>;
    type Histogram = Arc<StatfulHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        Arc::new(StatfulCounter(MetricHandle::new(&self.dispatcher, MetricKind::Counter, key)))
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(StatfulGauge {
            handle: MetricHandle::new(&self.dispatcher, MetricKind::Gauge, key),
            bits: AtomicU64::new(0f64.to_bits()),
        })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        Arc::new(StatfulHistogram(MetricHandle::new(&self.dispatcher, MetricKind::Timer, key)))
    }
}

/// A recorder that sends metrics to a Statful collector.
///
/// Every update becomes one record: counters send the increment, gauges send their value after the update, and
/// histograms are sent as timers. Labels become tags. Updates go through the dispatcher like any other record, so
/// they are sampled, buffered and sent in batches.
///
/// Handles are registered once per key, so a gauge keeps its value across `gauge!` calls.
pub struct StatfulRecorder {
    dispatcher: Arc<Dispatcher>,
    registry: Registry<Key, RecordStorage>,
}

impl StatfulRecorder {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let registry = Registry::new(RecordStorage { dispatcher: Arc::clone(&dispatcher) });
        StatfulRecorder { dispatcher, registry }
    }

    /// Returns the dispatcher records are added to.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }
}

impl Recorder for StatfulRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}
