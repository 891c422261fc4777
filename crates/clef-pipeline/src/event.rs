// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event representation shared between generated call-site code and the sinks.
//!
//! An [`EventTemplate`] is emitted once per log statement as a `static`, so its address is a
//! stable identity for the lifetime of the process. [`EventValues`] is rebuilt for every call
//! and only lives for the duration of one [`crate::Pipeline::ingest`].

use chrono::{DateTime, Utc};
use derive_more::Display;
use std::fmt;
use std::io::Write;

use crate::level::Level;
use crate::template_cache::EscapedTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Integer,
    Fraction,
    Bool,
    DateTime,
    /// Head entry of an expanded complex property; its fields follow at a greater depth.
    Complex,
}

impl PropertyType {
    #[inline]
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, PropertyType::Integer | PropertyType::Fraction)
    }
}

/// Wire encoding of the bytes held by an [`Event`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    Utf8Plain = 0,
    Utf8Json = 1,
}

impl Encoding {
    pub const ALL: [Encoding; 2] = [Encoding::Utf8Plain, Encoding::Utf8Json];

    #[inline]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Bitmask of encodings, one bit per [`Encoding`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EncodingSet(u8);

impl EncodingSet {
    pub const EMPTY: EncodingSet = EncodingSet(0);

    #[must_use]
    pub const fn of(encoding: Encoding) -> Self {
        EncodingSet(encoding.bit())
    }

    #[must_use]
    pub const fn with(self, encoding: Encoding) -> Self {
        EncodingSet(self.0 | encoding.bit())
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, encoding: Encoding) -> bool {
        self.0 & encoding.bit() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Encoding> {
        Encoding::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

/// Immutable per-call-site metadata.
///
/// Built in const context by generated code; mismatched property tables fail compilation.
#[derive(Debug)]
pub struct EventTemplate {
    level: Level,
    event_id: &'static str,
    template: &'static str,
    fragments: &'static [&'static str],
    names: &'static [&'static str],
    types: &'static [PropertyType],
    depths: &'static [u8],
}

impl EventTemplate {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        level: Level,
        event_id: &'static str,
        template: &'static str,
        fragments: &'static [&'static str],
        names: &'static [&'static str],
        types: &'static [PropertyType],
        depths: &'static [u8],
    ) -> Self {
        assert!(
            names.len() == types.len() && names.len() == depths.len(),
            "property names, types and depths must have the same length"
        );
        assert!(!fragments.is_empty(), "a template has at least one fragment");
        assert!(
            fragments.len() - 1 <= names.len(),
            "more positional holes than properties"
        );
        Self {
            level,
            event_id,
            template,
            fragments,
            names,
            types,
            depths,
        }
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn event_id(&self) -> &'static str {
        self.event_id
    }

    pub fn template(&self) -> &'static str {
        self.template
    }

    pub fn fragments(&self) -> &'static [&'static str] {
        self.fragments
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    pub fn types(&self) -> &'static [PropertyType] {
        self.types
    }

    pub fn depths(&self) -> &'static [u8] {
        self.depths
    }

    /// Positional properties are the leading entries filling the holes between fragments.
    #[inline]
    pub fn positional_count(&self) -> usize {
        self.fragments.len() - 1
    }

    #[inline]
    pub fn property_count(&self) -> usize {
        self.names.len()
    }
}

/// One property value as seen by a sink.
///
/// `Null` and `Skip` are sentinels: they carry no bytes and are told apart from a real empty
/// string by their variant, never by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Bytes(&'a [u8]),
    /// The value was null.
    Null,
    /// Field of a null complex ancestor, or the head of a present complex value.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Bytes { start: usize, end: usize },
    Null,
    Skip,
}

/// Per-call value list aligned with [`EventTemplate::names`].
///
/// All value bytes share one grow-only buffer; `clear` keeps its capacity.
#[derive(Debug, Default, Clone)]
pub struct EventValues {
    buf: Vec<u8>,
    slots: Vec<Slot>,
}

impl EventValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(values: usize, bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            slots: Vec::with_capacity(values),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.slots.clear();
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_with(|buf| buf.extend_from_slice(bytes));
    }

    pub fn push_str(&mut self, value: &str) {
        self.push_bytes(value.as_bytes());
    }

    /// Formats `value` straight into the shared buffer.
    pub fn push_display(&mut self, value: impl fmt::Display) {
        // Writing into a Vec cannot fail.
        self.push_with(|buf| {
            let _ = write!(buf, "{value}");
        });
    }

    /// Appends whatever `write` puts at the end of the buffer as one value.
    pub fn push_with(&mut self, write: impl FnOnce(&mut Vec<u8>)) {
        let start = self.buf.len();
        write(&mut self.buf);
        let end = self.buf.len();
        self.slots.push(Slot::Bytes { start, end });
    }

    pub fn push_null(&mut self) {
        self.slots.push(Slot::Null);
    }

    pub fn push_skip(&mut self) {
        self.slots.push(Slot::Skip);
    }

    pub(crate) fn push_value(&mut self, value: Value<'_>) {
        match value {
            Value::Bytes(bytes) => self.push_bytes(bytes),
            Value::Null => self.push_null(),
            Value::Skip => self.push_skip(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value<'_>> {
        self.slots.get(index).map(|slot| self.resolve(*slot))
    }

    pub fn iter(&self) -> impl Iterator<Item = Value<'_>> + '_ {
        self.slots.iter().map(|slot| self.resolve(*slot))
    }

    #[inline]
    fn resolve(&self, slot: Slot) -> Value<'_> {
        match slot {
            Slot::Bytes { start, end } => Value::Bytes(&self.buf[start..end]),
            Slot::Null => Value::Null,
            Slot::Skip => Value::Skip,
        }
    }
}

/// A single log call as delivered to a sink.
///
/// In [`Encoding::Utf8Json`] the literal accessors return the JSON-escaped forms from the
/// template cache and the values are already escaped.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    template: &'static EventTemplate,
    values: &'a EventValues,
    timestamp: DateTime<Utc>,
    escaped: Option<&'a EscapedTemplate>,
}

impl<'a> Event<'a> {
    pub fn plain(
        template: &'static EventTemplate,
        values: &'a EventValues,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            template,
            values,
            timestamp,
            escaped: None,
        }
    }

    pub fn json(
        template: &'static EventTemplate,
        escaped: &'a EscapedTemplate,
        values: &'a EventValues,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            template,
            values,
            timestamp,
            escaped: Some(escaped),
        }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        if self.escaped.is_some() {
            Encoding::Utf8Json
        } else {
            Encoding::Utf8Plain
        }
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.template.level()
    }

    pub fn template(&self) -> &'static EventTemplate {
        self.template
    }

    pub fn values(&self) -> &'a EventValues {
        self.values
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message_template(&self) -> &'a [u8] {
        match self.escaped {
            Some(escaped) => escaped.template(),
            None => self.template.template().as_bytes(),
        }
    }

    pub fn event_id(&self) -> &'a [u8] {
        match self.escaped {
            Some(escaped) => escaped.event_id(),
            None => self.template.event_id().as_bytes(),
        }
    }

    pub fn fragment(&self, index: usize) -> &'a [u8] {
        match self.escaped {
            Some(escaped) => escaped.fragment(index),
            None => self.template.fragments()[index].as_bytes(),
        }
    }

    pub fn name(&self, index: usize) -> &'a [u8] {
        match self.escaped {
            Some(escaped) => escaped.name(index),
            None => self.template.names()[index].as_bytes(),
        }
    }

    /// Value for property `index`; a short value list reads as `Skip`.
    #[inline]
    pub fn value(&self, index: usize) -> Value<'a> {
        self.values.get(index).unwrap_or(Value::Skip)
    }
}
