// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network sink shipping CLEF documents to a remote collector.
//!
//! Each logging thread gets its own [`circular_buffer`] the first time it reaches a given
//! [`NetworkSink`]; the consumer half is registered in the sink's [`ThreadQueueRegistry`]. The
//! [`Transport`] task drains that registry over one persistent connection, sending at most
//! `batch_bytes` of whole frames per chunked request and popping them only once the collector
//! answered. Frames are delivered at least once: a connection lost between sending and reading
//! the response leads to the same frames being sent again.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::circular_buffer::{self, Consumer, Producer};
use crate::clef;
use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::event::{Encoding, Event};
use crate::http::{self, Response, Verdict};
use crate::metrics::Metrics;
use crate::registry::{DrainAction, ThreadQueueRegistry};
use crate::sink::Sink;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Cleared when the owning thread's locals are torn down.
struct ThreadLiveness(Arc<AtomicBool>);

impl Drop for ThreadLiveness {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

thread_local! {
    static LIVENESS: ThreadLiveness = ThreadLiveness(Arc::new(AtomicBool::new(true)));
    static PRODUCERS: RefCell<Vec<(u64, Producer)>> = const { RefCell::new(Vec::new()) };
}

/// Consumer half of one thread's buffer plus the liveness flag of that thread.
struct ThreadQueue {
    consumer: Consumer,
    owner_alive: Arc<AtomicBool>,
}

impl ThreadQueue {
    /// The owner has exited; with `Acquire` every frame it committed is visible.
    fn owner_exited(&self) -> bool {
        !self.owner_alive.load(Ordering::Acquire)
    }
}

struct SinkState {
    id: u64,
    registry: ThreadQueueRegistry<ThreadQueue>,
    metrics: Arc<Metrics>,
    buffer_capacity: usize,
    max_event_bytes: usize,
}

/// [`Sink`] queuing CLEF documents for a [`Transport`].
///
/// `ingest` never blocks: an event that does not fit the calling thread's buffer is dropped and
/// counted as a ring overflow.
pub struct NetworkSink {
    state: Arc<SinkState>,
}

impl NetworkSink {
    /// Creates the sink and the transport draining it; spawn [`Transport::run`] on a runtime.
    pub fn new(
        mut config: TransportConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> (Self, Transport) {
        config.enforce_limits();
        let state = Arc::new(SinkState {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            registry: ThreadQueueRegistry::new(),
            metrics: Arc::clone(&metrics),
            buffer_capacity: config.buffer_capacity,
            max_event_bytes: config.max_event_bytes,
        });
        let transport = Transport {
            state: Arc::clone(&state),
            metrics,
            authority: config.authority(),
            config,
            cancel,
            connection: None,
            connected_before: false,
            failures: 0,
            request: Vec::new(),
        };
        (Self { state }, transport)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.state.metrics
    }

    fn queue_event(&self, producers: &mut Vec<(u64, Producer)>, event: &Event<'_>, len: usize) {
        let Some(producer) = self.thread_producer(producers) else {
            self.state.metrics.record_ring_overflow();
            return;
        };
        let Some(dst) = producer.reserve(len) else {
            self.state.metrics.record_ring_overflow();
            trace!("CLEF | Thread buffer full, event dropped");
            return;
        };
        if let Some(written) = clef::render_into(dst, event, &self.state.metrics) {
            producer.commit(written);
        }
    }

    /// This thread's producer for this sink, created and registered on first use.
    fn thread_producer<'p>(
        &self,
        producers: &'p mut Vec<(u64, Producer)>,
    ) -> Option<&'p mut Producer> {
        let id = self.state.id;
        if let Some(index) = producers.iter().position(|(owner, _)| *owner == id) {
            return Some(&mut producers[index].1);
        }

        // Buffers of dropped transports are only released here, on the next miss.
        producers.retain(|(_, producer)| producer.is_consumer_alive());
        let owner_alive = LIVENESS.try_with(|liveness| Arc::clone(&liveness.0)).ok()?;
        let (producer, consumer) = circular_buffer::with_capacity(self.state.buffer_capacity);
        self.state.registry.insert(ThreadQueue {
            consumer,
            owner_alive,
        });
        debug!(
            "CLEF | Registered buffer of {} bytes for thread {:?}",
            self.state.buffer_capacity,
            std::thread::current().name()
        );
        producers.push((id, producer));
        producers.last_mut().map(|(_, producer)| producer)
    }
}

impl Sink for NetworkSink {
    fn expected_encoding(&self) -> Encoding {
        Encoding::Utf8Json
    }

    fn ingest(&self, event: &Event<'_>) {
        let len = clef::rendered_len(event);
        if len > self.state.max_event_bytes {
            self.state.metrics.record_ring_overflow();
            trace!("CLEF | Event of {len} bytes exceeds the per-event limit, dropped");
            return;
        }
        let queued = PRODUCERS.try_with(|producers| match producers.try_borrow_mut() {
            Ok(mut producers) => {
                self.queue_event(&mut producers, event, len);
                true
            }
            Err(_) => false,
        });
        if !matches!(queued, Ok(true)) {
            // Re-entrant or during thread teardown.
            self.state.metrics.record_ring_overflow();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PassOutcome {
    bytes: usize,
    failed: bool,
}

/// Background loop draining a [`NetworkSink`] into the collector.
pub struct Transport {
    state: Arc<SinkState>,
    metrics: Arc<Metrics>,
    config: TransportConfig,
    authority: String,
    cancel: CancellationToken,
    connection: Option<BufReader<TcpStream>>,
    connected_before: bool,
    failures: u32,
    request: Vec<u8>,
}

impl Transport {
    /// Runs until `cancel` fires and a later pass moves nothing, or the collector cannot be
    /// reached after that.
    pub async fn run(mut self) {
        debug!("CLEF | Transport to {} started", self.authority);
        loop {
            let draining = self.cancel.is_cancelled();
            let outcome = self.pass().await;

            if draining {
                if outcome.failed {
                    warn!("CLEF | Collector unreachable while draining, queued events abandoned");
                    break;
                }
                if outcome.bytes == 0 {
                    break;
                }
                continue;
            }

            let delay = if outcome.failed {
                self.config.backoff(self.failures)
            } else if outcome.bytes == 0 {
                self.config.flush_interval
            } else {
                continue;
            };
            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.connection = None;
        debug!("CLEF | Transport to {} stopped", self.authority);
    }

    /// Visits every thread queue once, stopping at the first delivery failure.
    async fn pass(&mut self) -> PassOutcome {
        let state = Arc::clone(&self.state);
        let mut ctx = (self, PassOutcome::default());
        state
            .registry
            .drain_all_async(&mut ctx, |ctx, queue| {
                let (transport, outcome) = ctx;
                Box::pin(transport.visit_queue(queue, outcome))
            })
            .await;
        ctx.1
    }

    async fn visit_queue(
        &mut self,
        queue: &mut ThreadQueue,
        outcome: &mut PassOutcome,
    ) -> DrainAction {
        // Read before draining so a burst committed right before exit is still sent.
        let owner_exited = queue.owner_exited();
        match self.drain_queue(&mut queue.consumer).await {
            Ok(bytes) => outcome.bytes += bytes,
            Err(e) => {
                self.on_failure(&e);
                outcome.failed = true;
                return DrainAction::Stop;
            }
        }
        if owner_exited && queue.consumer.is_empty() {
            self.metrics.record_queue_retired();
            trace!("CLEF | Retired buffer of an exited thread");
            return DrainAction::Delete;
        }
        DrainAction::Retain
    }

    /// Sends up to `max_batches_per_queue` batches from one buffer.
    async fn drain_queue(&mut self, consumer: &mut Consumer) -> Result<usize, TransportError> {
        let api_key = self.config.api_key.clone();
        let api_key = match &api_key {
            Some(factory) => factory.header_value().await,
            None => None,
        };

        let mut moved = 0;
        for _ in 0..self.config.max_batches_per_queue {
            let mut frames = Vec::new();
            let bytes = consumer.peek_up_to(self.config.batch_bytes, &mut frames);
            if frames.is_empty() {
                break;
            }
            let count = frames.len() as u64;
            self.request.clear();
            http::write_request(
                &mut self.request,
                &self.authority,
                &self.config.path,
                api_key,
                &frames,
            );
            drop(frames);

            let response = self.send().await?;
            match response.verdict() {
                Verdict::Accepted => {
                    consumer.pop()?;
                    self.metrics.record_sent(count, bytes as u64);
                    self.failures = 0;
                }
                Verdict::Rejected => {
                    consumer.pop()?;
                    self.metrics.record_rejected_batch();
                    error!(
                        "CLEF | Collector rejected batch of {count} events with {}, dropped",
                        response.status
                    );
                }
                Verdict::Retry => return Err(TransportError::Status(response.status)),
            }
            moved += bytes;
        }
        Ok(moved)
    }

    /// Writes the prepared request and reads the response, connecting first when needed.
    async fn send(&mut self) -> Result<Response, TransportError> {
        if self.connection.is_none() {
            let connection = self.connect().await?;
            self.connection = Some(connection);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(TransportError::ConnectionClosed);
        };

        let io_timeout = self.config.io_timeout;
        timeout(io_timeout, connection.write_all(&self.request))
            .await
            .map_err(|_| TransportError::Timeout("request write"))??;
        let response = timeout(io_timeout, http::read_response(connection))
            .await
            .map_err(|_| TransportError::Timeout("response read"))??;

        if response.close {
            debug!("CLEF | Collector closed the connection");
            self.connection = None;
        }
        Ok(response)
    }

    async fn connect(&mut self) -> Result<BufReader<TcpStream>, TransportError> {
        let stream = timeout(
            self.config.io_timeout,
            TcpStream::connect(self.authority.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout("connect"))?
        .map_err(|source| TransportError::Connect {
            addr: self.authority.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("CLEF | Could not disable Nagle: {e}");
        }
        if self.connected_before {
            self.metrics.record_reconnect();
        }
        self.connected_before = true;
        debug!("CLEF | Connected to {}", self.authority);
        Ok(BufReader::new(stream))
    }

    fn on_failure(&mut self, e: &TransportError) {
        self.connection = None;
        self.failures = self.failures.saturating_add(1);
        self.metrics.record_transport_failure();
        warn!(
            "CLEF | Delivery to {} failed ({} in a row), frames kept for retry: {e}",
            self.authority, self.failures
        );
    }
}
