// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::event::{Encoding, Event};
use crate::level::Level;

/// Destination for events.
///
/// `ingest` runs on the logging thread and must not block on I/O.
pub trait Sink: Send + Sync {
    /// Encoding this sink wants its events in; fixed for the sink's lifetime.
    fn expected_encoding(&self) -> Encoding;

    fn ingest(&self, event: &Event<'_>);
}

/// A sink together with the minimum level it accepts.
#[derive(Clone)]
pub struct SinkRegistration {
    sink: Arc<dyn Sink>,
    minimum_level: Level,
    encoding: Encoding,
}

impl SinkRegistration {
    pub fn new(sink: Arc<dyn Sink>, minimum_level: Level) -> Self {
        let encoding = sink.expected_encoding();
        Self {
            sink,
            minimum_level,
            encoding,
        }
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[inline]
    pub fn accepts(&self, level: Level) -> bool {
        self.minimum_level <= level
    }

    /// Same sink by identity; two registrations of equal sinks are still different sinks.
    pub fn is_for(&self, sink: &Arc<dyn Sink>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.sink), Arc::as_ptr(sink))
    }

    pub(crate) fn with_minimum_level(&self, minimum_level: Level) -> Self {
        Self {
            minimum_level,
            ..self.clone()
        }
    }
}

impl fmt::Debug for SinkRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistration")
            .field("sink", &Arc::as_ptr(&self.sink))
            .field("minimum_level", &self.minimum_level)
            .field("encoding", &self.encoding)
            .finish()
    }
}
