// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plain-text sink rendering `[Level] message` lines.

use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::event::{Encoding, Event, Value};
use crate::scratch;
use crate::sink::Sink;

/// Writes the message of a plain-UTF8 event: fragments interleaved with positional values.
pub fn render_message(out: &mut Vec<u8>, event: &Event<'_>) {
    let template = event.template();
    let positional = template.positional_count();
    for i in 0..positional {
        out.extend_from_slice(event.fragment(i));
        match event.value(i) {
            Value::Bytes(bytes) => out.extend_from_slice(bytes),
            Value::Null => out.extend_from_slice(b"null"),
            Value::Skip => {}
        }
    }
    out.extend_from_slice(event.fragment(positional));
}

/// Sink writing one line per event to any writer, typically stderr or a file.
///
/// Unlike [`crate::NetworkSink`], this sink blocks: `ingest` takes a lock and performs the
/// write on the logging thread, so the line is in the writer when the call returns. Register it
/// only for local diagnostics, never with a writer that can stall.
pub struct TextSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Sink for TextSink<W> {
    fn expected_encoding(&self) -> Encoding {
        Encoding::Utf8Plain
    }

    fn ingest(&self, event: &Event<'_>) {
        scratch::with_buffer(|line| {
            line.push(b'[');
            line.extend_from_slice(event.level().as_str().as_bytes());
            line.extend_from_slice(b"] ");
            render_message(line, event);
            line.push(b'\n');

            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = writer.write_all(line) {
                debug!("CLEF | Text sink write failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, EventValues, PropertyType};
    use crate::level::Level;
    use chrono::Utc;

    static MOVED: EventTemplate = EventTemplate::new(
        Level::Warning,
        "m0",
        "Moved {Item} to {Target}",
        &["Moved ", " to ", ""],
        &["Item", "Target", "Extra"],
        &[PropertyType::String, PropertyType::String, PropertyType::Integer],
        &[0, 0, 0],
    );

    #[test]
    fn interleaves_fragments_and_positional_values() {
        let mut values = EventValues::new();
        values.push_str("box");
        values.push_null();
        values.push_display(7);

        let event = Event::plain(&MOVED, &values, Utc::now());
        let mut out = Vec::new();
        render_message(&mut out, &event);
        assert_eq!(out, b"Moved box to null");
    }

    #[test]
    fn sink_writes_one_line_per_event() {
        let sink = TextSink::new(Vec::new());
        let mut values = EventValues::new();
        values.push_str("a");
        values.push_str("b");
        let event = Event::plain(&MOVED, &values, Utc::now());

        sink.ingest(&event);
        sink.ingest(&event);

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "[Warning] Moved a to b\n[Warning] Moved a to b\n");
    }

    struct WritingThreads(Vec<std::thread::ThreadId>);

    impl Write for WritingThreads {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.push(std::thread::current().id());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_happen_on_the_logging_thread() {
        let sink = TextSink::new(WritingThreads(Vec::new()));
        let mut values = EventValues::new();
        values.push_str("a");
        values.push_str("b");
        let event = Event::plain(&MOVED, &values, Utc::now());

        let logger = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    sink.ingest(&event);
                    std::thread::current().id()
                })
                .join()
                .unwrap()
        });
        assert_eq!(sink.into_inner().0, vec![logger]);
    }
}
