// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON string escaping and the byte sinks renderers write through.

use std::fmt;

use crate::errors::RenderError;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Destination for rendered bytes.
pub trait Output {
    fn put(&mut self, bytes: &[u8]) -> Result<(), RenderError>;

    #[inline]
    fn put_byte(&mut self, byte: u8) -> Result<(), RenderError> {
        self.put(&[byte])
    }
}

impl Output for Vec<u8> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), RenderError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Fixed-size destination; writing past the end fails instead of truncating.
#[derive(Debug)]
pub struct SliceWriter<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, pos: 0 }
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.pos
    }
}

impl Output for SliceWriter<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), RenderError> {
        let end = self.pos.checked_add(bytes.len()).ok_or(RenderError)?;
        let dst = self.dst.get_mut(self.pos..end).ok_or(RenderError)?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

/// Counts bytes without storing them; used to size a reservation exactly.
#[derive(Debug, Default)]
pub struct CountingWriter {
    len: usize,
}

impl CountingWriter {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Output for CountingWriter {
    #[inline]
    fn put(&mut self, bytes: &[u8]) -> Result<(), RenderError> {
        self.len += bytes.len();
        Ok(())
    }
}

/// Adapter so `write!` can target any [`Output`] without an intermediate `String`.
pub(crate) struct FmtAdapter<'o, O: Output> {
    pub(crate) out: &'o mut O,
    pub(crate) error: Option<RenderError>,
}

impl<O: Output> fmt::Write for FmtAdapter<'_, O> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.out.put(s.as_bytes()).map_err(|e| {
            self.error = Some(e);
            fmt::Error
        })
    }
}

#[inline]
fn needs_escape(byte: u8) -> bool {
    byte < 0x20 || byte == b'"' || byte == b'\\'
}

/// Writes `src` as the contents of a JSON string (without the surrounding quotes).
pub fn write_escaped<O: Output>(out: &mut O, src: &[u8]) -> Result<(), RenderError> {
    let mut run_start = 0;
    for (i, &byte) in src.iter().enumerate() {
        if !needs_escape(byte) {
            continue;
        }
        if run_start < i {
            out.put(&src[run_start..i])?;
        }
        match byte {
            b'"' => out.put(b"\\\"")?,
            b'\\' => out.put(b"\\\\")?,
            b'\n' => out.put(b"\\n")?,
            b'\r' => out.put(b"\\r")?,
            b'\t' => out.put(b"\\t")?,
            0x08 => out.put(b"\\b")?,
            0x0c => out.put(b"\\f")?,
            _ => out.put(&[
                b'\\',
                b'u',
                b'0',
                b'0',
                HEX[usize::from(byte >> 4)],
                HEX[usize::from(byte & 0x0f)],
            ])?,
        }
        run_start = i + 1;
    }
    if run_start < src.len() {
        out.put(&src[run_start..])?;
    }
    Ok(())
}

/// Escapes into a fresh allocation; used by the template cache, never on the value path.
#[must_use]
pub fn escape(src: &[u8]) -> Box<[u8]> {
    let mut out = Vec::with_capacity(src.len());
    // Vec output is infallible.
    let _ = write_escaped(&mut out, src);
    out.into_boxed_slice()
}
