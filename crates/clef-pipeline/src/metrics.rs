// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters.
//!
//! Every failure on the logging call path is reported here instead of being returned. Counters
//! are relaxed atomics: eventually consistent, never a synchronization point.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    events_ingested: AtomicU64,
    ring_overflows: AtomicU64,
    render_overflows: AtomicU64,
    unsupported_encodings: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    batches_rejected: AtomicU64,
    transport_failures: AtomicU64,
    reconnects: AtomicU64,
    queues_retired: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_ingested: u64,
    pub ring_overflows: u64,
    pub render_overflows: u64,
    pub unsupported_encodings: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub batches_rejected: u64,
    pub transport_failures: u64,
    pub reconnects: u64,
    pub queues_retired: u64,
}

impl Metrics {
    #[inline]
    pub fn record_ingested(&self) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ring_overflow(&self) {
        self.ring_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_render_overflow(&self) {
        self.render_overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unsupported_encoding(&self) {
        self.unsupported_encodings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, frames: u64, bytes: u64) {
        self.frames_sent.fetch_add(frames, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_rejected_batch(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_retired(&self) {
        self.queues_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
            render_overflows: self.render_overflows.load(Ordering::Relaxed),
            unsupported_encodings: self.unsupported_encodings.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            queues_retired: self.queues_retired.load(Ordering::Relaxed),
        }
    }
}
