use std::{collections::BTreeMap, sync::Arc, thread, time::Duration};

use thiserror::Error;
use tokio::runtime;
use tracing::debug;

use crate::{
    aggregation::{AggregationFrequency, KindDefaults},
    config::Configuration,
    dispatcher::Dispatcher,
    recorder::StatfulRecorder,
    sampler::{SampleRate, Sampler},
    transport::{new_transport, Transport, TransportKind},
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2013;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_NAMESPACE: &str = "application";
const DEFAULT_FLUSH_SIZE: usize = 10;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BUFFER_SIZE: usize = 5000;
const DEFAULT_HTTP_METRICS_PATH: &str = "/tel/v2.0/metrics";
const FLUSHER_THREAD_NAME: &str = "metrics-exporter-statful-flusher";

/// Errors that could occur while building or installing a Statful exporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The transport selector is neither `udp` nor `http`.
    #[error("unknown transport '{0}', expected 'udp' or 'http'")]
    UnknownTransport(String),

    /// The sample rate is outside of `[1, 100]`.
    #[error("sample rate must be between 1 and 100, got {0}")]
    InvalidSampleRate(u8),

    /// The maximum buffer size is zero.
    #[error("maximum buffer size must be greater than zero")]
    InvalidBufferSize,

    /// The flush size is zero.
    #[error("flush size must be greater than zero")]
    InvalidFlushSize,

    /// The flush interval is zero.
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,

    /// Host, port and path do not form a valid URI.
    #[error("invalid HTTP endpoint '{endpoint}': {reason}")]
    InvalidHttpEndpoint {
        /// The endpoint that failed to parse.
        endpoint: String,
        /// Details about the parsing failure.
        reason: String,
    },

    /// The HTTP transport was selected without an API token.
    #[error("an API token is required by the HTTP transport")]
    MissingToken,

    /// The API token cannot be sent as a header value.
    #[error("API token contains characters not allowed in a header value")]
    InvalidToken,

    /// Failed to create the runtime or the thread driving periodic flushes.
    #[error("failed to create runtime for periodic flushes: {0}")]
    FailedToCreateRuntime(String),

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Builder for a Statful exporter.
pub struct StatfulBuilder {
    host: String,
    port: u16,
    secure: bool,
    timeout: Duration,
    token: Option<String>,
    app: Option<String>,
    transport: TransportKind,
    dry_run: bool,
    tags: BTreeMap<String, String>,
    sample_rate: SampleRate,
    namespace: String,
    flush_size: usize,
    flush_interval: Duration,
    max_buffer_size: usize,
    http_metrics_path: String,
    timer: KindDefaults,
    gauge: KindDefaults,
    counter: KindDefaults,
    default_frequency: AggregationFrequency,
    telemetry: bool,
}

impl StatfulBuilder {
    /// Sets the collector host.
    ///
    /// Defaults to `127.0.0.1`.
    #[must_use]
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.host = host.into();
        self
    }

    /// Sets the collector port.
    ///
    /// Defaults to 2013.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets whether the HTTP transport uses TLS.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the request timeout of the HTTP transport.
    ///
    /// A request still pending when the timeout is reached is abandoned and its batch is dropped.
    ///
    /// Defaults to 2 seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the API token sent by the HTTP transport in the `M-Api-Token` header.
    ///
    /// Required when using the HTTP transport. Defaults to no token.
    #[must_use]
    pub fn with_token<T>(mut self, token: T) -> Self
    where
        T: Into<String>,
    {
        self.token = Some(token.into());
        self
    }

    /// Sets the application name, attached to every metric as the `app` tag.
    ///
    /// A metric carrying its own `app` tag keeps it. Defaults to no application name.
    #[must_use]
    pub fn with_app<A>(mut self, app: A) -> Self
    where
        A: Into<String>,
    {
        self.app = Some(app.into());
        self
    }

    /// Sets the transport used to send metrics.
    ///
    /// Defaults to [`TransportKind::Udp`].
    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the transport used to send metrics by name, either `udp` or `http`.
    ///
    /// # Errors
    ///
    /// If the name does not match a known transport, an error is returned.
    pub fn with_transport_name<S>(mut self, transport: S) -> Result<Self, BuildError>
    where
        S: AsRef<str>,
    {
        self.transport = transport.as_ref().parse()?;
        Ok(self)
    }

    /// Sets whether metrics are only logged instead of being sent.
    ///
    /// In dry-run mode, every flush renders its batch and logs it at the debug level. The transport is never used.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Adds a tag attached to every metric.
    ///
    /// Tags set on a metric take precedence over global tags with the same key. When the same key is added more than
    /// once, the first value is kept.
    ///
    /// Defaults to no global tags.
    #[must_use]
    pub fn with_global_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Sets the percentage of metrics kept by the sampler.
    ///
    /// Sampling happens before metrics are buffered. The rate is also written on every line so the collector can
    /// scale the values back up.
    ///
    /// Defaults to 100, which keeps every metric.
    ///
    /// # Errors
    ///
    /// If the rate is not between 1 and 100, an error is returned.
    pub fn with_sample_rate(mut self, sample_rate: u8) -> Result<Self, BuildError> {
        self.sample_rate = SampleRate::new(sample_rate).ok_or(BuildError::InvalidSampleRate(sample_rate))?;
        Ok(self)
    }

    /// Sets the namespace prefixed to metric names.
    ///
    /// An empty namespace disables the prefix. Defaults to `application`.
    #[must_use]
    pub fn with_namespace<N>(mut self, namespace: N) -> Self
    where
        N: Into<String>,
    {
        self.namespace = namespace.into();
        self
    }

    /// Sets the number of buffered metrics that triggers a flush, which is also the maximum size of a batch.
    ///
    /// Defaults to 10.
    #[must_use]
    pub fn with_flush_size(mut self, flush_size: usize) -> Self {
        self.flush_size = flush_size;
        self
    }

    /// Sets the period of the background flush.
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets the maximum number of buffered metrics.
    ///
    /// Metrics added while the buffer is full are discarded.
    ///
    /// Defaults to 5,000.
    #[must_use]
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Sets the request path used by the HTTP transport.
    ///
    /// Defaults to `/tel/v2.0/metrics`.
    #[must_use]
    pub fn with_http_metrics_path<P>(mut self, path: P) -> Self
    where
        P: Into<String>,
    {
        self.http_metrics_path = path.into();
        self
    }

    /// Sets the default aggregations and frequency of timers.
    ///
    /// Defaults to `avg`, `p90` and `count` every 10 seconds.
    #[must_use]
    pub fn with_timer_defaults(mut self, defaults: KindDefaults) -> Self {
        self.timer = defaults;
        self
    }

    /// Sets the default aggregations and frequency of gauges.
    ///
    /// Defaults to `last`, `max` and `avg` every 10 seconds.
    #[must_use]
    pub fn with_gauge_defaults(mut self, defaults: KindDefaults) -> Self {
        self.gauge = defaults;
        self
    }

    /// Sets the default aggregations and frequency of counters.
    ///
    /// Defaults to `count` and `sum` every 10 seconds.
    #[must_use]
    pub fn with_counter_defaults(mut self, defaults: KindDefaults) -> Self {
        self.counter = defaults;
        self
    }

    /// Sets the aggregation frequency of metrics that request aggregations but have no kind defaults.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_default_frequency(mut self, frequency: AggregationFrequency) -> Self {
        self.default_frequency = frequency;
        self
    }

    /// Sets whether or not to publish telemetry for the exporter.
    ///
    /// When enabled, every flush reports how many metrics were buffered, sampled out or dropped, and how many
    /// payloads and lines were sent, as `statful.client.*` counters through the installed `metrics` recorder.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Validates the settings and freezes them into a [`Configuration`].
    ///
    /// # Errors
    ///
    /// If the buffer size, flush size or flush interval is zero, an error is returned.
    pub fn into_configuration(self) -> Result<Configuration, BuildError> {
        if self.max_buffer_size == 0 {
            return Err(BuildError::InvalidBufferSize);
        }
        if self.flush_size == 0 {
            return Err(BuildError::InvalidFlushSize);
        }
        if self.flush_interval.is_zero() {
            return Err(BuildError::InvalidFlushInterval);
        }

        Ok(Configuration {
            host: self.host,
            port: self.port,
            secure: self.secure,
            timeout: self.timeout,
            token: self.token,
            app: self.app,
            transport: self.transport,
            dry_run: self.dry_run,
            tags: self.tags,
            sample_rate: self.sample_rate,
            namespace: self.namespace,
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
            max_buffer_size: self.max_buffer_size,
            http_metrics_path: self.http_metrics_path,
            timer: self.timer,
            gauge: self.gauge,
            counter: self.counter,
            default_frequency: self.default_frequency,
            telemetry: self.telemetry,
        })
    }

    /// Builds the dispatcher, using the configured transport.
    ///
    /// When called from within a Tokio runtime, periodic flushes and sends are spawned on that runtime. Otherwise, a
    /// single-threaded runtime is created and driven by a background thread.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, if the transport cannot be created from it, or if the background runtime
    /// cannot be created, an error is returned.
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        let config = self.into_configuration()?;
        let transport = new_transport(&config)?;
        launch(config, transport)
    }

    /// Builds the dispatcher, sending metrics through the given transport instead of the configured one.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid or if the background runtime cannot be created, an error is returned.
    pub fn build_with_transport(self, transport: Arc<dyn Transport>) -> Result<Dispatcher, BuildError> {
        let config = self.into_configuration()?;
        launch(config, transport)
    }

    /// Builds a [`metrics`] recorder backed by a new dispatcher.
    ///
    /// The recorder must be manually installed by the caller.
    ///
    /// # Errors
    ///
    /// If the dispatcher cannot be built, an error is returned.
    pub fn build_recorder(self) -> Result<StatfulRecorder, BuildError> {
        Ok(StatfulRecorder::new(Arc::new(self.build()?)))
    }

    /// Builds the recorder and installs it as the global recorder.
    ///
    /// Returns the dispatcher behind the recorder, which can be used to close the exporter.
    ///
    /// # Errors
    ///
    /// If the dispatcher cannot be built, or if a global recorder is already installed, an error is returned.
    pub fn install(self) -> Result<Arc<Dispatcher>, BuildError> {
        let recorder = self.build_recorder()?;
        let dispatcher = recorder.dispatcher();

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)?;

        Ok(dispatcher)
    }
}

fn launch(config: Configuration, transport: Arc<dyn Transport>) -> Result<Dispatcher, BuildError> {
    let config = Arc::new(config);
    let sampler = Sampler::new(config.sample_rate());

    if let Ok(handle) = runtime::Handle::try_current() {
        let (dispatcher, flusher) = Dispatcher::new(config, transport, sampler, handle.clone());
        handle.spawn(flusher);

        Ok(dispatcher)
    } else {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

        let (dispatcher, flusher) = Dispatcher::new(config, transport, sampler, runtime.handle().clone());

        thread::Builder::new()
            .name(FLUSHER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(flusher))
            .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;
        debug!("Spawned background thread for periodic flushes.");

        Ok(dispatcher)
    }
}

impl Default for StatfulBuilder {
    fn default() -> Self {
        StatfulBuilder {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secure: true,
            timeout: DEFAULT_TIMEOUT,
            token: None,
            app: None,
            transport: TransportKind::Udp,
            dry_run: false,
            tags: BTreeMap::new(),
            sample_rate: SampleRate::ALWAYS,
            namespace: DEFAULT_NAMESPACE.to_string(),
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            http_metrics_path: DEFAULT_HTTP_METRICS_PATH.to_string(),
            timer: KindDefaults::timer(),
            gauge: KindDefaults::gauge(),
            counter: KindDefaults::counter(),
            default_frequency: AggregationFrequency::Freq10,
            telemetry: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{Aggregation, AggregationFrequency, MetricKind, Record, TransportKind};

    use super::{BuildError, StatfulBuilder};

    #[test]
    fn defaults() {
        let config = StatfulBuilder::default().into_configuration().unwrap();

        assert_eq!(config.host(), "127.0.0.1");
        assert_eq!(config.port(), 2013);
        assert!(config.secure());
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.token(), None);
        assert_eq!(config.app(), None);
        assert_eq!(config.transport(), TransportKind::Udp);
        assert!(!config.dry_run());
        assert!(config.tags().is_empty());
        assert_eq!(config.sample_rate().get(), 100);
        assert_eq!(config.namespace(), "application");
        assert_eq!(config.flush_size(), 10);
        assert_eq!(config.flush_interval(), Duration::from_secs(30));
        assert_eq!(config.max_buffer_size(), 5000);
        assert_eq!(config.http_metrics_path(), "/tel/v2.0/metrics");
        assert_eq!(config.default_frequency(), AggregationFrequency::Freq10);
        assert!(!config.telemetry());

        let counter = config.kind_defaults(MetricKind::Counter).unwrap();
        assert_eq!(counter.aggregations, [Aggregation::Count, Aggregation::Sum]);
        assert_eq!(counter.frequency, AggregationFrequency::Freq10);
        assert!(config.kind_defaults(MetricKind::Custom).is_none());
    }

    #[test]
    fn invalid_settings() {
        // Cases are defined as: builder, expected error.
        let cases = [
            (StatfulBuilder::default().with_max_buffer_size(0), "maximum buffer size must be greater than zero"),
            (StatfulBuilder::default().with_flush_size(0), "flush size must be greater than zero"),
            (StatfulBuilder::default().with_flush_interval(Duration::ZERO), "flush interval must be greater than zero"),
        ];

        for (builder, expected) in cases {
            let err = builder.into_configuration().unwrap_err();
            assert_eq!(err.to_string(), expected);
        }

        for rate in [0, 101, 255] {
            let result = StatfulBuilder::default().with_sample_rate(rate);
            assert!(matches!(result, Err(BuildError::InvalidSampleRate(r)) if r == rate));
        }
    }

    #[test]
    fn transport_by_name() {
        let builder = StatfulBuilder::default().with_transport_name("Http").unwrap();
        assert_eq!(builder.into_configuration().unwrap().transport(), TransportKind::Http);

        let result = StatfulBuilder::default().with_transport_name("carrier-pigeon");
        assert!(matches!(result, Err(BuildError::UnknownTransport(name)) if name == "carrier-pigeon"));
    }

    #[test]
    fn first_global_tag_value_wins() {
        let config = StatfulBuilder::default()
            .with_global_tag("env", "prod")
            .with_global_tag("env", "staging")
            .with_global_tag("region", "eu")
            .into_configuration()
            .unwrap();

        assert_eq!(config.tags().get("env").map(String::as_str), Some("prod"));
        assert_eq!(config.tags().len(), 2);
    }

    #[test]
    fn http_without_token_fails_to_build() {
        let result = StatfulBuilder::default().with_transport(TransportKind::Http).build();
        assert!(matches!(result, Err(BuildError::MissingToken)));
    }

    #[test]
    fn build_outside_of_runtime_spawns_flusher_thread() {
        let dispatcher = StatfulBuilder::default().with_dry_run(true).build().unwrap();

        let record =
            Record::builder(MetricKind::Counter, "requests").value(1u64).build(dispatcher.configuration()).unwrap();
        assert!(dispatcher.add_metric(record));
        dispatcher.flush();
        assert_eq!(dispatcher.buffered(), 0);

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(dispatcher.close()).unwrap();
    }

    #[tokio::test]
    async fn build_inside_runtime() {
        let dispatcher = StatfulBuilder::default().with_dry_run(true).build().unwrap();
        assert_eq!(dispatcher.buffered(), 0);
        dispatcher.close().await.unwrap();
    }
}
