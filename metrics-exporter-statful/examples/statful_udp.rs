use std::{thread, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_exporter_statful::{Aggregation, AggregationFrequency, MetricKind, Record, StatfulBuilder};
use rand::Rng;

fn main() {
    tracing_subscriber::fmt::init();

    let dispatcher = StatfulBuilder::default()
        .with_host("localhost")
        .with_port(2013)
        .with_app("statful-udp-example")
        .with_global_tag("env", "dev")
        .with_sample_rate(80)
        .expect("invalid sample rate")
        .with_flush_interval(Duration::from_secs(5))
        .install()
        .expect("failed to install Statful recorder");

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs", "system" => "foo");
    let mut rng = rand::rng();

    // Loop over and over, pretending to do some work.
    loop {
        server_loops.increment(1);
        server_loops_delta_secs.record(rng.random_range(0.0..1.0));

        let gauge = gauge!("lucky_iterations");
        if rand::random_bool(0.75) {
            gauge.increment(1.0);
        } else {
            gauge.decrement(1.0);
        }

        let record = Record::builder(MetricKind::Custom, "batch_size")
            .value(rng.random_range(1u64..100))
            .aggregations([Aggregation::Max, Aggregation::P95])
            .frequency(AggregationFrequency::Freq60)
            .build(dispatcher.configuration())
            .expect("valid record");
        dispatcher.add_metric(record);

        thread::sleep(Duration::from_millis(10));
    }
}
