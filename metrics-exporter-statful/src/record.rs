use std::{collections::BTreeMap, fmt, time::SystemTime};

use thiserror::Error;

use crate::{
    aggregation::{Aggregation, AggregationFrequency},
    config::Configuration,
    sampler::SampleRate,
};

/// Errors that could occur while binding a metric record to a configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordError {
    /// The metric name was empty.
    #[error("metric name must not be empty")]
    EmptyName,

    /// A tag had an empty key.
    #[error("tag keys must not be empty (value: '{value}')")]
    EmptyTagKey {
        /// Value of the offending tag.
        value: String,
    },

    /// No value was given for the metric.
    #[error("metric '{name}' has no value")]
    MissingValue {
        /// Name of the offending metric.
        name: String,
    },

    /// The sample rate was outside of `[1, 100]`.
    #[error("sample rate {0} is outside of [1, 100]")]
    InvalidSampleRate(u8),
}

/// Kind of a metric.
///
/// The kind selects the type segment of the metric name and which configured default aggregations apply when the
/// producer does not choose them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricKind {
    /// A duration measurement.
    Timer,
    /// A monotonic count.
    Counter,
    /// A point-in-time value.
    Gauge,
    /// A metric without a type segment or default aggregations.
    Custom,
}

impl MetricKind {
    /// Returns the segment inserted between the namespace and the metric name, if any.
    pub const fn type_segment(self) -> Option<&'static str> {
        match self {
            MetricKind::Timer => Some("timer"),
            MetricKind::Counter => Some("counter"),
            MetricKind::Gauge => Some("gauge"),
            MetricKind::Custom => None,
        }
    }
}

/// Textual representation of a metric value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Value(String);

impl Value {
    /// Returns the value as it will be written on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! value_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value(itoa::Buffer::new().format(value).to_owned())
                }
            }
        )*
    };
}

value_from_integer!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value(ryu::Buffer::new().format(value).to_owned())
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value(ryu::Buffer::new().format(value).to_owned())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value(value)
    }
}

/// A single metric observation, ready to be buffered and encoded.
///
/// Records are immutable. Global tags, the application name and kind defaults are applied by the
/// [`LineEncoder`][crate::LineEncoder] when the record is rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    kind: MetricKind,
    namespace: Option<String>,
    name: String,
    tags: BTreeMap<String, String>,
    value: Value,
    timestamp: u64,
    aggregations: Option<Vec<Aggregation>>,
    frequency: Option<AggregationFrequency>,
    sample_rate: SampleRate,
}

impl Record {
    /// Creates a builder for a record of the given kind and name.
    ///
    /// The timestamp defaults to the current time.
    pub fn builder<N>(kind: MetricKind, name: N) -> RecordBuilder
    where
        N: Into<String>,
    {
        RecordBuilder::new(kind, name)
    }

    /// Kind of the metric.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Namespace override, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags set by the producer.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Metric value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Unix timestamp, in seconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Aggregations chosen by the producer.
    ///
    /// `None` means the kind defaults apply, while an empty list means no aggregations at all.
    pub fn aggregations(&self) -> Option<&[Aggregation]> {
        self.aggregations.as_deref()
    }

    /// Aggregation frequency chosen by the producer.
    pub fn frequency(&self) -> Option<AggregationFrequency> {
        self.frequency
    }

    /// Sample rate written at the end of the line.
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }
}

/// Builder for [`Record`].
#[derive(Clone, Debug)]
pub struct RecordBuilder {
    kind: MetricKind,
    namespace: Option<String>,
    name: String,
    tags: Vec<(String, String)>,
    value: Option<Value>,
    timestamp: u64,
    aggregations: Option<Vec<Aggregation>>,
    frequency: Option<AggregationFrequency>,
    sample_rate: Option<u8>,
}

impl RecordBuilder {
    fn new<N>(kind: MetricKind, name: N) -> Self
    where
        N: Into<String>,
    {
        RecordBuilder {
            kind,
            namespace: None,
            name: name.into(),
            tags: Vec::new(),
            value: None,
            timestamp: unix_timestamp(),
            aggregations: None,
            frequency: None,
            sample_rate: None,
        }
    }

    /// Overrides the configured namespace for this metric.
    #[must_use]
    pub fn namespace<S>(mut self, namespace: S) -> Self
    where
        S: Into<String>,
    {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a tag. Setting the same key twice keeps the last value.
    #[must_use]
    pub fn tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the value.
    #[must_use]
    pub fn value<V>(mut self, value: V) -> Self
    where
        V: Into<Value>,
    {
        self.value = Some(value.into());
        self
    }

    /// Pins the timestamp, in unix seconds.
    #[must_use]
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the aggregations, replacing the kind defaults.
    ///
    /// An empty list disables aggregations for this metric.
    #[must_use]
    pub fn aggregations<I>(mut self, aggregations: I) -> Self
    where
        I: IntoIterator<Item = Aggregation>,
    {
        self.aggregations = Some(aggregations.into_iter().collect());
        self
    }

    /// Sets the aggregation frequency, replacing the kind default.
    #[must_use]
    pub fn frequency(mut self, frequency: AggregationFrequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Sets the sample rate written with this metric, replacing the configured one.
    #[must_use]
    pub fn sample_rate(mut self, sample_rate: u8) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Freezes the builder into a record that still needs a configuration.
    pub fn into_unbound(self) -> UnboundRecord {
        UnboundRecord(self)
    }

    /// Builds the record against the given configuration.
    ///
    /// # Errors
    ///
    /// If the name is empty, a tag key is empty, no value was set or the sample rate is out of range, an error is
    /// returned.
    pub fn build(self, config: &Configuration) -> Result<Record, RecordError> {
        self.into_unbound().bind(config)
    }
}

/// A record created before the configuration of its destination is known.
///
/// Unbound records can be created anywhere (for example on another thread, and passed over a channel) and are turned
/// into a [`Record`] exactly once with [`UnboundRecord::bind`].
#[derive(Clone, Debug)]
pub struct UnboundRecord(RecordBuilder);

impl UnboundRecord {
    /// Name of the metric.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Validates the record and attaches the configured sample rate when the producer did not set one.
    ///
    /// # Errors
    ///
    /// If the name is empty, a tag key is empty, no value was set or the sample rate is out of range, an error is
    /// returned.
    pub fn bind(self, config: &Configuration) -> Result<Record, RecordError> {
        let RecordBuilder {
            kind,
            namespace,
            name,
            tags,
            value,
            timestamp,
            aggregations,
            frequency,
            sample_rate,
        } = self.0;

        if name.is_empty() {
            return Err(RecordError::EmptyName);
        }

        let value = value.ok_or_else(|| RecordError::MissingValue { name: name.clone() })?;

        let sample_rate = match sample_rate {
            Some(rate) => SampleRate::new(rate).ok_or(RecordError::InvalidSampleRate(rate))?,
            None => config.sample_rate(),
        };

        let mut tag_map = BTreeMap::new();
        for (key, tag_value) in tags {
            if key.is_empty() {
                return Err(RecordError::EmptyTagKey { value: tag_value });
            }
            tag_map.insert(key, tag_value);
        }

        Ok(Record {
            kind,
            namespace,
            name,
            tags: tag_map,
            value,
            timestamp,
            aggregations,
            frequency,
            sample_rate,
        })
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use crate::{builder::StatfulBuilder, Aggregation, AggregationFrequency};

    use super::{MetricKind, Record, RecordError, Value};

    #[test]
    fn values_render_without_loss() {
        assert_eq!(Value::from(5u64).as_str(), "5");
        assert_eq!(Value::from(-42i64).as_str(), "-42");
        assert_eq!(Value::from(1.5f64).as_str(), "1.5");
        assert_eq!(Value::from(3.0f64).as_str(), "3.0");
        assert_eq!(Value::from("12ms").as_str(), "12ms");
    }

    #[test]
    fn bind_applies_configured_sample_rate() {
        let config = StatfulBuilder::default().with_sample_rate(25).unwrap().into_configuration().unwrap();

        let record = Record::builder(MetricKind::Counter, "hits").value(1u64).build(&config).unwrap();
        assert_eq!(record.sample_rate().get(), 25);

        let pinned = Record::builder(MetricKind::Counter, "hits").value(1u64).sample_rate(80).build(&config).unwrap();
        assert_eq!(pinned.sample_rate().get(), 80);
    }

    #[test]
    fn bind_rejects_invalid_records() {
        let config = StatfulBuilder::default().into_configuration().unwrap();

        let empty_name = Record::builder(MetricKind::Gauge, "").value(1u64).build(&config);
        assert_eq!(empty_name, Err(RecordError::EmptyName));

        let no_value = Record::builder(MetricKind::Gauge, "pool").build(&config);
        assert_eq!(no_value, Err(RecordError::MissingValue { name: "pool".into() }));

        let bad_tag = Record::builder(MetricKind::Gauge, "pool").value(1u64).tag("", "x").build(&config);
        assert_eq!(bad_tag, Err(RecordError::EmptyTagKey { value: "x".into() }));

        let bad_rate = Record::builder(MetricKind::Gauge, "pool").value(1u64).sample_rate(0).build(&config);
        assert_eq!(bad_rate, Err(RecordError::InvalidSampleRate(0)));
    }

    #[test]
    fn unbound_record_crosses_threads() {
        let unbound = Record::builder(MetricKind::Custom, "jobs")
            .value(7u64)
            .timestamp(1_000)
            .tag("queue", "mail")
            .aggregations([Aggregation::Sum])
            .frequency(AggregationFrequency::Freq60)
            .into_unbound();

        let unbound = std::thread::spawn(move || unbound).join().unwrap();
        assert_eq!(unbound.name(), "jobs");

        let config = StatfulBuilder::default().into_configuration().unwrap();
        let record = unbound.bind(&config).unwrap();
        assert_eq!(record.timestamp(), 1_000);
        assert_eq!(record.tags().get("queue").map(String::as_str), Some("mail"));
        assert_eq!(record.aggregations(), Some(&[Aggregation::Sum][..]));
        assert_eq!(record.frequency(), Some(AggregationFrequency::Freq60));
    }
}
