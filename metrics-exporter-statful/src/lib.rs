//! A [`metrics`]-compatible exporter for sending metrics to a [Statful][statful] collector.
//!
//! [statful]: https://www.statful.com/
//!
//! # Usage
//!
//! Metrics can be sent either through the `metrics` macros, by installing the exporter as the global recorder, or
//! directly through a [`Dispatcher`]:
//!
//! ```no_run
//! # use metrics_exporter_statful::{MetricKind, Record, StatfulBuilder};
//! // First, create a builder.
//! //
//! // The builder can configure every aspect of the exporter, such as the collector address, the transport, how
//! // metrics are sampled and batched, and which aggregations the collector should compute.
//! let builder = StatfulBuilder::default().with_app("checkout").with_global_tag("env", "prod");
//!
//! // Installing the exporter sets it as the global recorder for all `metrics` calls, and starts flushing buffered
//! // metrics in the background.
//! let dispatcher = builder.install().expect("failed to install recorder/exporter");
//! metrics::counter!("orders", "country" => "pt").increment(1);
//!
//! // Records can also be built and added by hand, with full control over aggregations and sampling.
//! let record = Record::builder(MetricKind::Timer, "payment")
//!     .tag("provider", "acme")
//!     .value(125u64)
//!     .build(dispatcher.configuration())
//!     .expect("valid record");
//! dispatcher.add_metric(record);
//! ```
//!
//! # Line protocol
//!
//! Every metric is rendered as a single line:
//!
//! ```text
//! [namespace.][type.]name[,key=value,...] value timestamp [agg,...,frequency] sample_rate
//! ```
//!
//! Tags are written sorted by key. Timers, counters and gauges get a type segment and default aggregations, both of
//! which can be overridden per metric or in the builder.
//!
//! # Transports
//!
//! Batches are sent either as a single UDP datagram, or as the body of an HTTP `PUT` request authenticated with an
//! API token. Delivery is best-effort in both cases: failed batches are logged and dropped, never retried.
//!
//! # Sampling and buffering
//!
//! Metrics are sampled at the configured rate before being buffered in a bounded queue. The queue is flushed when it
//! holds `flush_size` metrics, when it is full, and every `flush_interval`. Metrics added while the queue is full are
//! dropped.
//!
//! # Telemetry
//!
//! The exporter keeps totals of what it buffered, sampled out, dropped and sent, available from
//! [`Dispatcher::telemetry`]. These can also be published as `statful.client.*` counters through the installed
//! recorder.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod aggregation;
pub use self::aggregation::{Aggregation, AggregationFrequency, KindDefaults};

mod buffer;

mod builder;
pub use self::builder::{BuildError, StatfulBuilder};

mod config;
pub use self::config::Configuration;

mod dispatcher;
pub use self::dispatcher::{Completion, Dispatcher};

mod encoder;
pub use self::encoder::LineEncoder;

mod record;
pub use self::record::{MetricKind, Record, RecordBuilder, RecordError, UnboundRecord, Value};

mod recorder;
pub use self::recorder::StatfulRecorder;

mod sampler;
pub use self::sampler::{RandomSource, SampleRate, Sampler, ThreadRandom};

mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

pub mod transport;
pub use self::transport::{
    new_transport, HttpTransport, Transport, TransportError, TransportExt, TransportFuture, TransportKind,
    UdpTransport,
};
