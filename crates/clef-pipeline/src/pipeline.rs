// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink configuration and encoding fan-out.
//!
//! The active [`Config`] is an immutable snapshot behind an [`ArcSwap`]. Reconfiguration builds
//! a new snapshot and swaps the pointer, so a logging thread always sees either the old table or
//! the new one, never a mix.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

use crate::event::{Encoding, EncodingSet, Event, EventTemplate, EventValues, Value};
use crate::json::write_escaped;
use crate::level::Level;
use crate::metrics::Metrics;
use crate::scratch;
use crate::sink::{Sink, SinkRegistration};
use crate::template_cache::{self, TemplateCache};

/// Registered sinks plus, per level, the encodings at least one of them needs.
#[derive(Debug, Default)]
pub struct Config {
    registrations: Vec<SinkRegistration>,
    required: [EncodingSet; Level::COUNT],
}

impl Config {
    pub fn new(registrations: Vec<SinkRegistration>) -> Self {
        let mut required = [EncodingSet::EMPTY; Level::COUNT];
        for level in Level::ALL {
            required[level.index()] = registrations
                .iter()
                .filter(|r| r.accepts(level))
                .fold(EncodingSet::EMPTY, |set, r| set.with(r.encoding()));
        }
        Self {
            registrations,
            required,
        }
    }

    pub fn registrations(&self) -> &[SinkRegistration] {
        &self.registrations
    }

    #[inline]
    pub fn required_encodings(&self, level: Level) -> EncodingSet {
        self.required[level.index()]
    }

    fn targets(&self, level: Level, encoding: Encoding) -> impl Iterator<Item = &SinkRegistration> {
        self.registrations
            .iter()
            .filter(move |r| r.encoding() == encoding && r.accepts(level))
    }
}

pub struct Pipeline {
    config: ArcSwap<Config>,
    templates: &'static TemplateCache,
    metrics: Arc<Metrics>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::default()))
    }
}

impl Pipeline {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            config: ArcSwap::from_pointee(Config::default()),
            templates: template_cache::global(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Replaces the whole sink table.
    pub fn initialize(&self, sinks: Vec<SinkRegistration>) {
        debug!("CLEF | Configuring pipeline with {} sinks", sinks.len());
        self.config.store(Arc::new(Config::new(sinks)));
    }

    /// Changes the minimum level of an already registered sink.
    ///
    /// Returns `false` when `sink` is not registered.
    pub fn set_minimum_level_for_sink(&self, sink: &Arc<dyn Sink>, level: Level) -> bool {
        let previous = self.config.rcu(|current| {
            let registrations = current
                .registrations
                .iter()
                .map(|r| {
                    if r.is_for(sink) {
                        r.with_minimum_level(level)
                    } else {
                        r.clone()
                    }
                })
                .collect();
            Config::new(registrations)
        });
        let found = previous.registrations.iter().any(|r| r.is_for(sink));
        if !found {
            debug!("CLEF | Minimum level change for an unregistered sink ignored");
        }
        found
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Encodings generated code has to produce for `level`; empty means skip the call.
    #[inline]
    pub fn required_encodings(&self, level: Level) -> EncodingSet {
        self.config.load().required_encodings(level)
    }

    #[inline]
    pub fn is_enabled(&self, level: Level) -> bool {
        !self.required_encodings(level).is_empty()
    }

    /// Fills this thread's scratch value list with `fill` and ingests it as plain UTF8.
    pub fn log(&self, template: &'static EventTemplate, fill: impl FnOnce(&mut EventValues)) {
        if !self.is_enabled(template.level()) {
            return;
        }
        scratch::with_values(|values| {
            fill(values);
            self.ingest(template, values);
        });
    }

    /// Delivers a plain-UTF8 event to every sink whose minimum level admits it.
    pub fn ingest(&self, template: &'static EventTemplate, values: &EventValues) {
        self.ingest_encoded(template, values, Encoding::Utf8Plain);
    }

    /// Delivers an event whose values are already in `encoding`.
    ///
    /// Sinks expecting another encoding get one shared re-encoding per call. Re-encodings that
    /// are not implemented skip those sinks and count them.
    pub fn ingest_encoded(
        &self,
        template: &'static EventTemplate,
        values: &EventValues,
        encoding: Encoding,
    ) {
        let config = self.config.load();
        let level = template.level();
        let required = config.required_encodings(level);
        if required.is_empty() {
            return;
        }
        self.metrics.record_ingested();
        let timestamp = Utc::now();

        for target in required.iter() {
            match (encoding, target) {
                (Encoding::Utf8Plain, Encoding::Utf8Plain) => {
                    let event = Event::plain(template, values, timestamp);
                    deliver(&config, &event, target);
                }
                (Encoding::Utf8Json, Encoding::Utf8Json) => {
                    let escaped = self.templates.escaped(template);
                    let event = Event::json(template, &escaped, values, timestamp);
                    deliver(&config, &event, target);
                }
                (Encoding::Utf8Plain, Encoding::Utf8Json) => {
                    self.deliver_as_json(&config, template, values, timestamp);
                }
                (Encoding::Utf8Json, Encoding::Utf8Plain) => {
                    for _ in config.targets(level, target) {
                        self.metrics.record_unsupported_encoding();
                    }
                    trace!("CLEF | No {encoding} to {target} re-encoding, sinks skipped");
                }
            }
        }
    }

    fn deliver_as_json(
        &self,
        config: &Config,
        template: &'static EventTemplate,
        values: &EventValues,
        timestamp: DateTime<Utc>,
    ) {
        let escaped = self.templates.escaped(template);
        scratch::with_json_values(|json| {
            encode_values_json(values, json);
            let event = Event::json(template, &escaped, json, timestamp);
            deliver(config, &event, Encoding::Utf8Json);
        });
    }
}

fn deliver(config: &Config, event: &Event<'_>, encoding: Encoding) {
    for registration in config.targets(event.level(), encoding) {
        registration.sink().ingest(event);
    }
}

/// JSON-escapes every real value of `src` into `dst`; sentinels are carried over.
pub fn encode_values_json(src: &EventValues, dst: &mut EventValues) {
    dst.clear();
    for value in src.iter() {
        match value {
            Value::Bytes(bytes) => dst.push_with(|buf| {
                // Vec output is infallible.
                let _ = write_escaped(buf, bytes);
            }),
            sentinel => dst.push_value(sentinel),
        }
    }
}

/// Process-wide pipeline used by generated call sites.
pub fn global() -> &'static Pipeline {
    static PIPELINE: OnceLock<Pipeline> = OnceLock::new();
    PIPELINE.get_or_init(Pipeline::default)
}
