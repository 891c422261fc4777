// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("pop called without a preceding peek")]
    NothingPeeked,
}

/// The render destination was too small; the partial document is discarded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("render destination overflowed")]
pub struct RenderError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed before a complete response was read")]
    ConnectionClosed,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("collector answered {0}")]
    Status(u16),
    #[error(transparent)]
    Ring(#[from] RingError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a number, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("unknown level '{0}'")]
    InvalidLevel(String),
}
