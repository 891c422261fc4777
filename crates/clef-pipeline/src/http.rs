// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal HTTP/1.1 framing for CLEF ingestion.
//!
//! A request is a fixed header block followed by exactly one data chunk holding the whole batch
//! and the terminating zero chunk. Responses are scanned line by line and their bodies consumed so
//! the connection stays usable for the next batch.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::TransportError;

pub const CLEF_CONTENT_TYPE: &str = "application/vnd.serilog.clef";
pub const API_KEY_HEADER: &str = "X-Seq-ApiKey";

const MAX_LINE: u64 = 8 * 1024;
const MAX_HEADERS: usize = 100;

/// Appends a complete chunked POST carrying `frames` to `out`.
///
/// Documents are newline-delimited inside the chunk; the declared chunk size covers exactly the
/// bytes that follow it.
pub fn write_request(
    out: &mut Vec<u8>,
    host: &str,
    path: &str,
    api_key: Option<&str>,
    frames: &[&[u8]],
) {
    out.extend_from_slice(b"POST ");
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(CLEF_CONTENT_TYPE.as_bytes());
    out.extend_from_slice(b"\r\nTransfer-Encoding: chunked\r\n");
    if let Some(key) = api_key {
        out.extend_from_slice(API_KEY_HEADER.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    let chunk_len: usize = frames.iter().map(|frame| frame.len() + 1).sum();
    if chunk_len > 0 {
        out.extend_from_slice(format!("{chunk_len:X}\r\n").as_bytes());
        for frame in frames {
            out.extend_from_slice(frame);
            out.push(b'\n');
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// The server will not take another request on this connection.
    pub close: bool,
}

/// What the transport does with a batch after the collector answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Ingested; pop the frames.
    Accepted,
    /// Permanently refused; pop the frames and report.
    Rejected,
    /// Keep the frames and try again later.
    Retry,
}

impl Response {
    pub fn verdict(&self) -> Verdict {
        match self.status {
            200..=299 => Verdict::Accepted,
            408 | 429 => Verdict::Retry,
            400..=499 => Verdict::Rejected,
            _ => Verdict::Retry,
        }
    }
}

/// Reads one response, skipping interim `1xx` responses, and consumes its body.
pub async fn read_response<R>(reader: &mut R) -> Result<Response, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    loop {
        read_line(reader, &mut line).await?;
        let status = parse_status_line(&line)?;

        let mut content_length = None;
        let mut chunked = false;
        let mut close = false;
        let mut headers = 0;
        loop {
            read_line(reader, &mut line).await?;
            if line.is_empty() {
                break;
            }
            headers += 1;
            if headers > MAX_HEADERS {
                return Err(TransportError::MalformedResponse(
                    "too many headers".to_string(),
                ));
            }
            let Some((name, value)) = split_header(&line) else {
                return Err(TransportError::MalformedResponse(format!(
                    "header without colon: {}",
                    String::from_utf8_lossy(&line)
                )));
            };
            if name.eq_ignore_ascii_case(b"content-length") {
                let len = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| {
                        TransportError::MalformedResponse("bad Content-Length".to_string())
                    })?;
                content_length = Some(len);
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                chunked = contains_token(value, b"chunked");
            } else if name.eq_ignore_ascii_case(b"connection") {
                close = contains_token(value, b"close");
            }
        }

        if (100..200).contains(&status) {
            continue;
        }

        if status != 204 && status != 304 {
            if chunked {
                skip_chunked_body(reader, &mut line).await?;
            } else if let Some(len) = content_length {
                skip_exact(reader, len).await?;
            } else {
                // Body delimited by connection close; nothing else can follow on this socket.
                close = true;
            }
        }
        return Ok(Response { status, close });
    }
}

/// Reads a line into `line` without its terminator.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader).take(MAX_LINE).read_until(b'\n', line).await?;
    if read == 0 {
        return Err(TransportError::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') {
        return Err(TransportError::MalformedResponse(
            "line too long or truncated".to_string(),
        ));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(())
}

/// `HTTP/1.1 201 Created` -> 201.
fn parse_status_line(line: &[u8]) -> Result<u16, TransportError> {
    let malformed = || {
        TransportError::MalformedResponse(format!(
            "status line: {}",
            String::from_utf8_lossy(line)
        ))
    };
    let mut parts = line.split(|&b| b == b' ').filter(|part| !part.is_empty());
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with(b"HTTP/") {
        return Err(malformed());
    }
    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 {
        return Err(malformed());
    }
    std::str::from_utf8(code)
        .ok()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
        .ok_or_else(malformed)
}

fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some((line[..colon].trim_ascii(), line[colon + 1..].trim_ascii()))
}

fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token))
}

async fn skip_chunked_body<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        read_line(reader, line).await?;
        let size = line.split(|&b| b == b';').next().unwrap_or_default();
        let size = std::str::from_utf8(size.trim_ascii())
            .ok()
            .and_then(|size| u64::from_str_radix(size, 16).ok())
            .ok_or_else(|| TransportError::MalformedResponse("bad chunk size".to_string()))?;
        if size == 0 {
            // trailers
            loop {
                read_line(reader, line).await?;
                if line.is_empty() {
                    return Ok(());
                }
            }
        }
        skip_exact(reader, size).await?;
        read_line(reader, line).await?;
        if !line.is_empty() {
            return Err(TransportError::MalformedResponse(
                "chunk not terminated by CRLF".to_string(),
            ));
        }
    }
}

async fn skip_exact<R>(reader: &mut R, len: u64) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(TransportError::ConnectionClosed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &[u8]) -> Result<(Response, Vec<u8>), TransportError> {
        let mut reader = BufReader::new(raw);
        let response = read_response(&mut reader).await?;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await?;
        Ok((response, rest))
    }

    #[test]
    fn request_declares_exact_chunk_size() {
        let frames: [&[u8]; 2] = [b"{\"a\":1}", b"{}"];
        let mut out = Vec::new();
        write_request(&mut out, "localhost:5341", "/ingest/clef", Some("k"), &frames);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /ingest/clef HTTP/1.1\r\nHost: localhost:5341\r\n"));
        assert!(text.contains("Content-Type: application/vnd.serilog.clef\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("X-Seq-ApiKey: k\r\n"));
        assert!(text.ends_with("\r\n\r\nB\r\n{\"a\":1}\n{}\n\r\n0\r\n\r\n"));
    }

    #[test]
    fn request_without_frames_is_only_the_terminator() {
        let mut out = Vec::new();
        write_request(&mut out, "h", "/p", None, &[]);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("X-Seq-ApiKey"));
        assert!(text.ends_with("chunked\r\n\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn consumes_content_length_body() {
        let (response, rest) =
            parse(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\n{}HTTP/1.1")
                .await
                .unwrap();
        assert_eq!(
            response,
            Response {
                status: 201,
                close: false
            }
        );
        assert_eq!(rest, b"HTTP/1.1");
    }

    #[tokio::test]
    async fn consumes_chunked_body_and_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3;ext=1\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\nnext";
        let (response, rest) = parse(raw).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(rest, b"next");
    }

    #[tokio::test]
    async fn skips_interim_responses() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let (response, rest) = parse(raw).await.unwrap();
        assert_eq!(response.status, 204);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn connection_close_is_reported() {
        let raw = b"HTTP/1.0 500 Oops\r\nConnection: keep-alive, Close\r\nContent-Length: 0\r\n\r\n";
        let (response, _) = parse(raw).await.unwrap();
        assert!(response.close);
        assert_eq!(response.verdict(), Verdict::Retry);

        let (unframed, _) = parse(b"HTTP/1.1 200 OK\r\n\r\nbody").await.unwrap();
        assert!(unframed.close);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(matches!(
            parse(b"SSH-2.0-OpenSSH\r\n\r\n").await,
            Err(TransportError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse(b"").await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn verdict_by_status() {
        let verdict = |status| Response { status, close: false }.verdict();
        assert_eq!(verdict(201), Verdict::Accepted);
        assert_eq!(verdict(400), Verdict::Rejected);
        assert_eq!(verdict(413), Verdict::Rejected);
        assert_eq!(verdict(429), Verdict::Retry);
        assert_eq!(verdict(408), Verdict::Retry);
        assert_eq!(verdict(503), Verdict::Retry);
    }
}
