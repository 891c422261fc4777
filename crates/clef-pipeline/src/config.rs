// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::api_key::ApiKeyFactory;
use crate::errors::ConfigError;

pub const DEFAULT_COLLECTOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_COLLECTOR_PORT: u16 = 5341;
pub const DEFAULT_INGEST_PATH: &str = "/ingest/clef";
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_BATCH_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_EVENT_BYTES: usize = 64 * 1024;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
/// Batches sent per thread queue in one drain pass, so one busy thread cannot starve the rest.
const DEFAULT_MAX_BATCHES_PER_QUEUE: usize = 16;

/// Settings of a [`crate::NetworkSink`] and its transport loop.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Request target of the CLEF ingestion endpoint.
    pub path: String,
    /// Sent as `X-Seq-ApiKey` when present.
    pub api_key: Option<Arc<ApiKeyFactory>>,
    /// Bytes of each per-thread circular buffer.
    pub buffer_capacity: usize,
    /// Payload budget of one chunked request.
    pub batch_bytes: usize,
    /// Larger events are dropped and counted as overflow.
    pub max_event_bytes: usize,
    pub max_batches_per_queue: usize,
    /// Idle delay between passes that moved no data.
    pub flush_interval: Duration,
    pub io_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: DEFAULT_COLLECTOR_PORT,
            path: DEFAULT_INGEST_PATH.to_string(),
            api_key: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            batch_bytes: DEFAULT_BATCH_BYTES,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
            max_batches_per_queue: DEFAULT_MAX_BATCHES_PER_QUEUE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl TransportConfig {
    /// Reads `CLEF_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let api_key = lookup("CLEF_API_KEY")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(|key| Arc::new(ApiKeyFactory::new(&key)));

        let config = Self {
            host: lookup("CLEF_COLLECTOR_HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "CLEF_COLLECTOR_PORT")?.unwrap_or(defaults.port),
            path: lookup("CLEF_INGEST_PATH")
                .map(|path| normalize_path(&path))
                .unwrap_or(defaults.path),
            api_key,
            buffer_capacity: parse(&lookup, "CLEF_BUFFER_CAPACITY")?
                .unwrap_or(defaults.buffer_capacity),
            batch_bytes: parse(&lookup, "CLEF_BATCH_BYTES")?.unwrap_or(defaults.batch_bytes),
            max_event_bytes: parse(&lookup, "CLEF_MAX_EVENT_BYTES")?
                .unwrap_or(defaults.max_event_bytes),
            max_batches_per_queue: defaults.max_batches_per_queue,
            flush_interval: millis(&lookup, "CLEF_FLUSH_INTERVAL_MS")?
                .unwrap_or(defaults.flush_interval),
            io_timeout: millis(&lookup, "CLEF_IO_TIMEOUT_MS")?.unwrap_or(defaults.io_timeout),
            backoff_base: millis(&lookup, "CLEF_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.backoff_base),
            backoff_max: millis(&lookup, "CLEF_BACKOFF_MAX_MS")?.unwrap_or(defaults.backoff_max),
        };
        config.validate()
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        for (name, value) in [
            ("CLEF_COLLECTOR_PORT", usize::from(self.port)),
            ("CLEF_BUFFER_CAPACITY", self.buffer_capacity),
            ("CLEF_BATCH_BYTES", self.batch_bytes),
            ("CLEF_MAX_EVENT_BYTES", self.max_event_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        self.enforce_limits();
        Ok(self)
    }

    /// Adjusts limits a queue could otherwise never drain under; applied to every transport,
    /// including configs built field by field.
    pub(crate) fn enforce_limits(&mut self) {
        // An event must always fit one request.
        self.max_event_bytes = self.max_event_bytes.min(self.batch_bytes);
        self.max_batches_per_queue = self.max_batches_per_queue.max(1);
        self.backoff_max = self.backoff_max.max(self.backoff_base);
    }

    /// `host:port` for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reconnect delay after `failures` consecutive failures: base * 2^(failures - 1), capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1 << exponent)
            .min(self.backoff_max)
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, name)?.map(Duration::from_millis))
}
