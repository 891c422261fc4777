// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Low-allocation structured event pipeline.
//!
//! Generated call-site code hands the pipeline an immutable [`EventTemplate`] and a per-call
//! [`EventValues`] list of pre-encoded UTF8 fragments. The [`Pipeline`] fans the event out to
//! the sinks whose minimum level admits it, re-encoding to JSON at most once per call, and the
//! [`NetworkSink`] queues CLEF documents into per-thread circular buffers which a background
//! [`Transport`] drains into chunked HTTP requests against a remote collector.
//!
//! ```text
//!   call site ──> Pipeline::ingest ──> Sink::ingest ──┬─> TextSink (plain UTF8)
//!                  (level → encodings)                 └─> NetworkSink (CLEF)
//!                                                             │ reserve/commit
//!                                                             v
//!                                             per-thread CircularBuffer
//!                                                             │ drain
//!                                                             v
//!                                         Transport ──> POST /ingest/clef (chunked)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod api_key;
pub mod circular_buffer;
pub mod clef;
pub mod config;
pub mod errors;
pub mod event;
pub mod http;
pub mod json;
pub mod level;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod scratch;
pub mod sink;
pub mod template_cache;
pub mod text;

pub use event::{Encoding, EncodingSet, Event, EventTemplate, EventValues, PropertyType, Value};
pub use level::Level;
pub use network::{NetworkSink, Transport};
pub use pipeline::{global, Pipeline};
pub use sink::{Sink, SinkRegistration};
pub use text::TextSink;
