use std::fmt;

/// An aggregation the collector should compute for a metric.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Aggregation {
    /// Average of the values.
    Avg,
    /// 90th percentile.
    P90,
    /// Number of values.
    Count,
    /// Last value received.
    Last,
    /// Sum of the values.
    Sum,
    /// First value received.
    First,
    /// 95th percentile.
    P95,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
}

impl Aggregation {
    /// Returns the name of the aggregation as it appears on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Aggregation::Avg => "avg",
            Aggregation::P90 => "p90",
            Aggregation::Count => "count",
            Aggregation::Last => "last",
            Aggregation::Sum => "sum",
            Aggregation::First => "first",
            Aggregation::P95 => "p95",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval, in seconds, over which the collector aggregates a metric.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum AggregationFrequency {
    /// 10 seconds.
    #[default]
    Freq10,
    /// 30 seconds.
    Freq30,
    /// 60 seconds.
    Freq60,
    /// 120 seconds.
    Freq120,
    /// 180 seconds.
    Freq180,
    /// 300 seconds.
    Freq300,
}

impl AggregationFrequency {
    /// Returns the frequency in seconds.
    pub const fn as_secs(self) -> u64 {
        match self {
            AggregationFrequency::Freq10 => 10,
            AggregationFrequency::Freq30 => 30,
            AggregationFrequency::Freq60 => 60,
            AggregationFrequency::Freq120 => 120,
            AggregationFrequency::Freq180 => 180,
            AggregationFrequency::Freq300 => 300,
        }
    }

    /// Returns the frequency matching the given number of seconds, if it is one of the supported intervals.
    pub const fn from_secs(secs: u64) -> Option<Self> {
        match secs {
            10 => Some(AggregationFrequency::Freq10),
            30 => Some(AggregationFrequency::Freq30),
            60 => Some(AggregationFrequency::Freq60),
            120 => Some(AggregationFrequency::Freq120),
            180 => Some(AggregationFrequency::Freq180),
            300 => Some(AggregationFrequency::Freq300),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            AggregationFrequency::Freq10 => "10",
            AggregationFrequency::Freq30 => "30",
            AggregationFrequency::Freq60 => "60",
            AggregationFrequency::Freq120 => "120",
            AggregationFrequency::Freq180 => "180",
            AggregationFrequency::Freq300 => "300",
        }
    }
}

impl fmt::Display for AggregationFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default aggregations and frequency applied to a metric kind when the producer does not specify them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KindDefaults {
    /// Aggregations requested from the collector.
    pub aggregations: Vec<Aggregation>,

    /// Aggregation frequency.
    pub frequency: AggregationFrequency,
}

impl KindDefaults {
    /// Creates a new `KindDefaults`.
    pub fn new<I>(aggregations: I, frequency: AggregationFrequency) -> Self
    where
        I: IntoIterator<Item = Aggregation>,
    {
        Self { aggregations: aggregations.into_iter().collect(), frequency }
    }

    pub(crate) fn timer() -> Self {
        Self::new([Aggregation::Avg, Aggregation::P90, Aggregation::Count], AggregationFrequency::Freq10)
    }

    pub(crate) fn gauge() -> Self {
        Self::new([Aggregation::Last, Aggregation::Max, Aggregation::Avg], AggregationFrequency::Freq10)
    }

    pub(crate) fn counter() -> Self {
        Self::new([Aggregation::Count, Aggregation::Sum], AggregationFrequency::Freq10)
    }
}
