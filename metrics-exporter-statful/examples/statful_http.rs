use std::{env, time::Duration};

use metrics_exporter_statful::{MetricKind, Record, StatfulBuilder, TransportKind};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let token = env::var("STATFUL_TOKEN").expect("STATFUL_TOKEN must be set");
    let host = env::var("STATFUL_HOST").unwrap_or_else(|_| "api.statful.com".to_string());

    let dispatcher = StatfulBuilder::default()
        .with_transport(TransportKind::Http)
        .with_host(host)
        .with_port(443)
        .with_token(token)
        .with_app("statful-http-example")
        .with_flush_size(5)
        .build()
        .expect("failed to build Statful dispatcher");

    for i in 0..20u64 {
        let record = Record::builder(MetricKind::Timer, "request")
            .tag("route", "/checkout")
            .value(100 + i)
            .build(dispatcher.configuration())
            .expect("valid record");
        dispatcher.add_metric(record);

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    dispatcher.flush_with(move |result| {
        let _ = tx.send(result);
    });
    match rx.await {
        Ok(Ok(())) => tracing::info!("Last batch delivered."),
        Ok(Err(e)) => tracing::warn!(error = %e, "Last batch failed."),
        Err(_) => tracing::warn!("Runtime shut down before the last batch completed."),
    }

    dispatcher.close().await.expect("failed to close transport");
}
