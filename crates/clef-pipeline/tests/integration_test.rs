// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clef_pipeline::api_key::ApiKeyFactory;
use clef_pipeline::config::TransportConfig;
use clef_pipeline::metrics::{Metrics, MetricsSnapshot};
use clef_pipeline::{
    EventTemplate, Level, NetworkSink, Pipeline, PropertyType, Sink, SinkRegistration,
};
use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

static SAID: EventTemplate = EventTemplate::new(
    Level::Information,
    "said",
    "User {Name} said {Quote}",
    &["User ", " said ", ""],
    &["Name", "Quote"],
    &[PropertyType::String, PropertyType::String],
    &[0, 0],
);

static CHATTER: EventTemplate = EventTemplate::new(
    Level::Debug,
    "chatter",
    "Tick {Count}",
    &["Tick ", ""],
    &["Count"],
    &[PropertyType::Integer],
    &[0],
);

fn collector_config(server: &ServerGuard) -> TransportConfig {
    let authority = server.host_with_port();
    let (host, port) = authority
        .rsplit_once(':')
        .expect("mock server address has a port");
    TransportConfig {
        host: host.to_string(),
        port: port.parse().expect("numeric port"),
        flush_interval: Duration::from_millis(10),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        ..TransportConfig::default()
    }
}

fn pipeline_with(sink: NetworkSink, metrics: Arc<Metrics>) -> Pipeline {
    let pipeline = Pipeline::new(metrics);
    let sink: Arc<dyn Sink> = Arc::new(sink);
    pipeline.initialize(vec![SinkRegistration::new(sink, Level::Information)]);
    pipeline
}

fn log_said(pipeline: &Pipeline, name: &str, quote: &str) {
    pipeline.log(&SAID, |values| {
        values.push_str(name);
        values.push_str(quote);
    });
}

async fn wait_for(metrics: &Metrics, done: impl Fn(MetricsSnapshot) -> bool) {
    timeout(Duration::from_secs(5), async {
        while !done(metrics.snapshot()) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("metrics never reached the expected state");
}

#[tokio::test]
async fn pipeline_ships_clef_batches() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest/clef")
        .match_header("content-type", "application/vnd.serilog.clef")
        .match_header("x-seq-apikey", "mock-api-key")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""@mt":"User \{Name\} said \{Quote\}""#.to_string()),
            Matcher::Regex(r#""@l":"Information""#.to_string()),
            Matcher::Regex(r#""Quote":"He said \\"hi\\"""#.to_string()),
            Matcher::Regex(r#""Name":"bob""#.to_string()),
        ]))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let metrics = Arc::new(Metrics::default());
    let cancel = CancellationToken::new();
    let (sink, transport) = NetworkSink::new(
        TransportConfig {
            api_key: Some(Arc::new(ApiKeyFactory::new("mock-api-key"))),
            ..collector_config(&server)
        },
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let pipeline = pipeline_with(sink, Arc::clone(&metrics));

    log_said(&pipeline, "ann", "He said \"hi\"");
    pipeline.log(&CHATTER, |values| values.push_display(1));
    log_said(&pipeline, "bob", "bye");

    cancel.cancel();
    timeout(Duration::from_secs(5), tokio::spawn(transport.run()))
        .await
        .expect("transport did not stop after draining")
        .expect("transport task panicked");

    mock.assert_async().await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.events_ingested, 2);
    assert_eq!(snapshot.frames_sent, 2);
    assert_eq!(snapshot.ring_overflows, 0);
}

#[tokio::test]
async fn server_errors_are_retried_on_a_new_connection() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/ingest/clef")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let accepting = server
        .mock("POST", "/ingest/clef")
        .match_body(Matcher::Regex(r#""Name":"carol""#.to_string()))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let metrics = Arc::new(Metrics::default());
    let cancel = CancellationToken::new();
    let (sink, transport) = NetworkSink::new(
        collector_config(&server),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let pipeline = pipeline_with(sink, Arc::clone(&metrics));
    let handle = tokio::spawn(transport.run());

    log_said(&pipeline, "carol", "again");
    wait_for(&metrics, |m| m.frames_sent == 1).await;

    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("transport did not stop after draining")
        .expect("transport task panicked");

    failing.assert_async().await;
    accepting.assert_async().await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.transport_failures, 1);
    assert_eq!(snapshot.reconnects, 1);
    assert_eq!(snapshot.batches_rejected, 0);
}

#[tokio::test]
async fn final_burst_of_an_exited_thread_is_delivered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest/clef")
        .match_body(Matcher::Regex(r#""Name":"worker-2""#.to_string()))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let metrics = Arc::new(Metrics::default());
    let cancel = CancellationToken::new();
    let (sink, transport) = NetworkSink::new(
        collector_config(&server),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let pipeline = Arc::new(pipeline_with(sink, Arc::clone(&metrics)));

    let worker = Arc::clone(&pipeline);
    std::thread::spawn(move || {
        for i in 0..3 {
            log_said(&worker, &format!("worker-{i}"), "last words");
        }
    })
    .join()
    .expect("worker panicked");

    cancel.cancel();
    timeout(Duration::from_secs(5), tokio::spawn(transport.run()))
        .await
        .expect("transport did not stop after draining")
        .expect("transport task panicked");

    mock.assert_async().await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.frames_sent, 3);
    assert_eq!(snapshot.queues_retired, 1);
}
