// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compact Log Event Format renderer.
//!
//! Produces one single-line JSON document per event:
//!
//! ```text
//! {"@t":"2024-05-01T12:00:00.000000Z","@mt":"User {Name}","@i":"1a2b","@l":"Information","Name":"ann"}
//! ```
//!
//! Expanded complex properties become nested objects. The walk follows the template's depth
//! table: a `Skip` head followed by deeper entries opens an object, a `Null` head writes `null`
//! and swallows every deeper entry that follows it.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fmt::Write as _;

use crate::errors::RenderError;
use crate::event::{Encoding, Event, PropertyType, Value};
use crate::json::{write_escaped, CountingWriter, FmtAdapter, Output, SliceWriter};
use crate::metrics::Metrics;

const NON_FINITE: [&[u8]; 9] = [
    b"NaN",
    b"Infinity",
    b"-Infinity",
    b"+Infinity",
    "∞".as_bytes(),
    "-∞".as_bytes(),
    b"inf",
    b"-inf",
    b"+inf",
];

/// Renders `event` as a CLEF document.
///
/// Plain-UTF8 events are escaped on the fly; JSON events are copied as-is.
pub fn render<O: Output>(out: &mut O, event: &Event<'_>) -> Result<(), RenderError> {
    let escape = event.encoding() == Encoding::Utf8Plain;

    out.put(b"{\"@t\":\"")?;
    write_timestamp(out, event.timestamp())?;
    out.put(b"\",\"@mt\":\"")?;
    put_text(out, event.message_template(), escape)?;
    out.put(b"\",\"@i\":\"")?;
    put_text(out, event.event_id(), escape)?;
    out.put(b"\",\"@l\":\"")?;
    out.put(event.level().as_str().as_bytes())?;
    out.put_byte(b'"')?;
    write_properties(out, event, escape)?;
    out.put_byte(b'}')
}

/// Exact length of the document [`render`] would produce.
pub fn rendered_len(event: &Event<'_>) -> usize {
    let mut counter = CountingWriter::default();
    // Counting never fails.
    let _ = render(&mut counter, event);
    counter.len()
}

/// Renders into a fixed destination, returning the document length.
///
/// Overflow leaves no partial document behind: the caller gets `None` and the render overflow
/// counter is incremented.
pub fn render_into(dst: &mut [u8], event: &Event<'_>, metrics: &Metrics) -> Option<usize> {
    let mut writer = SliceWriter::new(dst);
    match render(&mut writer, event) {
        Ok(()) => Some(writer.written()),
        Err(RenderError) => {
            metrics.record_render_overflow();
            None
        }
    }
}

fn write_properties<O: Output>(
    out: &mut O,
    event: &Event<'_>,
    escape: bool,
) -> Result<(), RenderError> {
    let template = event.template();
    let depths = template.depths();
    let types = template.types();
    let count = template.property_count();

    let mut open: u8 = 0;
    let mut need_comma = true;
    let mut i = 0;
    while i < count {
        let depth = depths[i];
        while open > depth {
            out.put_byte(b'}')?;
            open -= 1;
        }
        if need_comma {
            out.put_byte(b',')?;
        }
        out.put_byte(b'"')?;
        put_text(out, event.name(i), escape)?;
        out.put(b"\":")?;
        need_comma = true;

        match event.value(i) {
            Value::Null => {
                out.put(b"null")?;
                i = skip_descendants(depths, i);
                continue;
            }
            Value::Skip => {
                if depths.get(i + 1).is_some_and(|&next| next > depth) {
                    out.put_byte(b'{')?;
                    open = depth + 1;
                    need_comma = false;
                } else {
                    out.put(b"{}")?;
                }
            }
            Value::Bytes(bytes) => put_value(out, types[i], bytes, escape)?,
        }
        i += 1;
    }
    while open > 0 {
        out.put_byte(b'}')?;
        open -= 1;
    }
    Ok(())
}

fn skip_descendants(depths: &[u8], head: usize) -> usize {
    let depth = depths[head];
    let mut next = head + 1;
    while next < depths.len() && depths[next] > depth {
        next += 1;
    }
    next
}

fn put_value<O: Output>(
    out: &mut O,
    kind: PropertyType,
    bytes: &[u8],
    escape: bool,
) -> Result<(), RenderError> {
    match kind {
        PropertyType::Integer | PropertyType::Fraction if is_bare_number(bytes) => out.put(bytes),
        PropertyType::Bool if bytes.eq_ignore_ascii_case(b"true") => out.put(b"true"),
        PropertyType::Bool if bytes.eq_ignore_ascii_case(b"false") => out.put(b"false"),
        _ => {
            out.put_byte(b'"')?;
            put_text(out, bytes, escape)?;
            out.put_byte(b'"')
        }
    }
}

/// Numbers are written unquoted unless they are empty or a non-finite spelling.
fn is_bare_number(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && !NON_FINITE
            .iter()
            .any(|spelling| bytes.eq_ignore_ascii_case(spelling))
}

#[inline]
fn put_text<O: Output>(out: &mut O, bytes: &[u8], escape: bool) -> Result<(), RenderError> {
    if escape {
        write_escaped(out, bytes)
    } else {
        out.put(bytes)
    }
}

fn write_timestamp<O: Output>(out: &mut O, timestamp: DateTime<Utc>) -> Result<(), RenderError> {
    let mut adapter = FmtAdapter { out, error: None };
    // Leap seconds report nanoseconds past 1e9; clamp to keep six digits.
    let micros = (timestamp.nanosecond() / 1_000).min(999_999);
    let written = write!(
        adapter,
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        timestamp.year(),
        timestamp.month(),
        timestamp.day(),
        timestamp.hour(),
        timestamp.minute(),
        timestamp.second(),
        micros
    );
    match written {
        Ok(()) => Ok(()),
        Err(_) => Err(adapter.error.unwrap_or(RenderError)),
    }
}
