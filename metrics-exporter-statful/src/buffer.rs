use crossbeam_queue::ArrayQueue;

use crate::record::Record;

/// Fixed-capacity queue of records waiting to be flushed.
///
/// Offers never block: when the buffer is full, the incoming record is handed back to the caller instead of evicting
/// an older one. Draining pops records in the order they were offered, and any number of producers and consumers may
/// use the buffer concurrently without a record ever being drained twice.
pub(crate) struct MetricBuffer {
    queue: ArrayQueue<Record>,
}

impl MetricBuffer {
    /// Creates a new `MetricBuffer` holding at most `capacity` records.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        MetricBuffer { queue: ArrayQueue::new(capacity) }
    }

    /// Attempts to enqueue a record.
    ///
    /// On success, returns the number of buffered records observed right after the insert. If the buffer is full,
    /// the record is returned.
    pub fn offer(&self, record: Record) -> Result<usize, Record> {
        self.queue.push(record)?;
        Ok(self.queue.len())
    }

    /// Removes up to `max` records, oldest first.
    pub fn drain(&self, max: usize) -> Vec<Record> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use crate::{builder::StatfulBuilder, Configuration, MetricKind, Record};

    use super::MetricBuffer;

    fn record(config: &Configuration, value: u64) -> Record {
        Record::builder(MetricKind::Counter, "requests").value(value).build(config).unwrap()
    }

    fn values(batch: &[Record]) -> Vec<String> {
        batch.iter().map(|r| r.value().to_string()).collect()
    }

    #[test]
    fn rejects_when_full() {
        let config = StatfulBuilder::default().into_configuration().unwrap();
        let buffer = MetricBuffer::new(3);

        for i in 0..3 {
            assert_eq!(buffer.offer(record(&config, i)), Ok(i as usize + 1));
        }

        let rejected = buffer.offer(record(&config, 3)).unwrap_err();
        assert_eq!(rejected.value().as_str(), "3");

        let drained = buffer.drain(10);
        assert_eq!(values(&drained), ["0", "1", "2"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drains_in_bounded_batches() {
        let config = StatfulBuilder::default().into_configuration().unwrap();
        let buffer = MetricBuffer::new(16);
        let flush_size = 4;

        for i in 0..(2 * flush_size + 1) {
            buffer.offer(record(&config, i as u64)).unwrap();
        }

        let sizes: Vec<usize> = (0..4).map(|_| buffer.drain(flush_size).len()).collect();
        assert_eq!(sizes, [4, 4, 1, 0]);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let config = Arc::new(StatfulBuilder::default().into_configuration().unwrap());
        let buffer = Arc::new(MetricBuffer::new(4_000));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                let config = Arc::clone(&config);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.offer(record(&config, p * 1_000 + i)).unwrap();
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while drained.len() < 4_000 {
            drained.extend(buffer.drain(64));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen: Vec<u64> = drained.iter().map(|r| r.value().as_str().parse().unwrap()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4_000);
        assert_eq!(buffer.capacity(), 4_000);
    }
}
