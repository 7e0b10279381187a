use std::{collections::BTreeMap, sync::Arc};

use crate::{config::Configuration, record::Record};

const APP_TAG: &str = "app";

/// Renders records into the collector's line protocol.
///
/// Each record becomes exactly one line, without a trailing line break:
///
/// ```text
/// [namespace.][type.]name[,key=value,...] value timestamp [agg,...,frequency] sample_rate
/// ```
///
/// The collector parses lines positionally, so the layout is part of the wire contract.
#[derive(Clone, Debug)]
pub struct LineEncoder {
    config: Arc<Configuration>,
}

impl LineEncoder {
    /// Creates a new `LineEncoder` reading global tags, namespace and kind defaults from `config`.
    pub fn new(config: Arc<Configuration>) -> Self {
        LineEncoder { config }
    }

    /// Renders the record as a new line.
    pub fn encode(&self, record: &Record) -> String {
        let mut line = String::with_capacity(128);
        self.encode_into(record, &mut line);
        line
    }

    /// Appends the rendered record to `buf`.
    pub fn encode_into(&self, record: &Record, buf: &mut String) {
        let config = &self.config;

        let namespace = record.namespace().unwrap_or(config.namespace());
        if !namespace.is_empty() {
            buf.push_str(namespace);
            buf.push('.');
        }

        if let Some(segment) = record.kind().type_segment() {
            buf.push_str(segment);
            buf.push('.');
        }

        buf.push_str(record.name());

        // Producer tags first, then global tags, then the application name. Keys already present are never
        // overwritten.
        let mut tags: BTreeMap<&str, &str> = record.tags().iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        for (key, value) in config.tags() {
            tags.entry(key.as_str()).or_insert(value.as_str());
        }
        if let Some(app) = config.app() {
            tags.entry(APP_TAG).or_insert(app);
        }

        for (key, value) in &tags {
            buf.push(',');
            buf.push_str(key);
            buf.push('=');
            buf.push_str(value);
        }

        buf.push(' ');
        buf.push_str(record.value().as_str());

        buf.push(' ');
        buf.push_str(itoa::Buffer::new().format(record.timestamp()));

        let defaults = config.kind_defaults(record.kind());
        let aggregations = record
            .aggregations()
            .or_else(|| defaults.map(|d| d.aggregations.as_slice()))
            .unwrap_or_default();
        if !aggregations.is_empty() {
            let frequency = record
                .frequency()
                .or_else(|| defaults.map(|d| d.frequency))
                .unwrap_or(config.default_frequency());

            buf.push(' ');
            for aggregation in aggregations {
                buf.push_str(aggregation.as_str());
                buf.push(',');
            }
            buf.push_str(itoa::Buffer::new().format(frequency.as_secs()));
        }

        buf.push(' ');
        buf.push_str(itoa::Buffer::new().format(record.sample_rate().get()));
    }
}
