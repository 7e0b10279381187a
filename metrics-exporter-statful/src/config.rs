use std::{collections::BTreeMap, time::Duration};

use crate::{
    aggregation::{AggregationFrequency, KindDefaults},
    record::MetricKind,
    sampler::SampleRate,
    transport::TransportKind,
};

/// Exporter configuration.
///
/// A `Configuration` is produced once by [`StatfulBuilder`][crate::StatfulBuilder] and shared, read-only, by the
/// dispatcher, the line encoder and the transport factory for the lifetime of the pipeline.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) secure: bool,
    pub(crate) timeout: Duration,
    pub(crate) token: Option<String>,
    pub(crate) app: Option<String>,
    pub(crate) transport: TransportKind,
    pub(crate) dry_run: bool,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) sample_rate: SampleRate,
    pub(crate) namespace: String,
    pub(crate) flush_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) max_buffer_size: usize,
    pub(crate) http_metrics_path: String,
    pub(crate) timer: KindDefaults,
    pub(crate) gauge: KindDefaults,
    pub(crate) counter: KindDefaults,
    pub(crate) default_frequency: AggregationFrequency,
    pub(crate) telemetry: bool,
}

impl Configuration {
    /// Collector host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Collector port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the HTTP transport uses TLS.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Request timeout for the HTTP transport.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// API token sent by the HTTP transport.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Application name attached to every metric as the `app` tag.
    pub fn app(&self) -> Option<&str> {
        self.app.as_deref()
    }

    /// Selected transport.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Whether metrics are only logged instead of sent.
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Tags attached to every metric.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Global sample rate.
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Namespace prefixed to metric names that do not override it.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Maximum number of metrics sent in a single flush.
    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    /// Period of the background flush.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Capacity of the metric buffer.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Request path used by the HTTP transport.
    pub fn http_metrics_path(&self) -> &str {
        &self.http_metrics_path
    }

    /// Whether internal telemetry is published.
    pub fn telemetry(&self) -> bool {
        self.telemetry
    }

    /// Aggregation frequency used for metrics without a kind.
    pub fn default_frequency(&self) -> AggregationFrequency {
        self.default_frequency
    }

    /// Returns the default aggregations and frequency configured for the given kind.
    ///
    /// [`MetricKind::Custom`] has no defaults.
    pub fn kind_defaults(&self, kind: MetricKind) -> Option<&KindDefaults> {
        match kind {
            MetricKind::Timer => Some(&self.timer),
            MetricKind::Gauge => Some(&self.gauge),
            MetricKind::Counter => Some(&self.counter),
            MetricKind::Custom => None,
        }
    }
}
