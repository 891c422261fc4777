// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector API key, fixed or resolved once on first use.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub type ApiKeyResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Source of the `X-Seq-ApiKey` header value.
///
/// A resolver runs at most once, from the transport task, so secrets managers are never hit on a
/// logging thread.
#[derive(Clone)]
pub enum ApiKeyFactory {
    Fixed(String),
    Resolved {
        resolver: ApiKeyResolverFn,
        key: Arc<OnceCell<String>>,
    },
}

impl ApiKeyFactory {
    pub fn new(key: &str) -> Self {
        Self::Fixed(key.to_string())
    }

    pub fn from_resolver(resolver: ApiKeyResolverFn) -> Self {
        Self::Resolved {
            resolver,
            key: Arc::new(OnceCell::new()),
        }
    }

    pub async fn get_api_key(&self) -> &str {
        match self {
            Self::Fixed(key) => key,
            Self::Resolved { resolver, key } => key.get_or_init(|| (resolver)()).await,
        }
    }

    /// Key usable in a header line, or `None` when blank or containing line breaks.
    pub async fn header_value(&self) -> Option<&str> {
        let key = self.get_api_key().await.trim();
        if key.is_empty() || key.bytes().any(|b| b == b'\r' || b == b'\n') {
            return None;
        }
        Some(key)
    }
}

impl fmt::Debug for ApiKeyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(_) => write!(f, "ApiKeyFactory::Fixed(<redacted>)"),
            Self::Resolved { key, .. } => {
                write!(f, "ApiKeyFactory::Resolved(resolved: {})", key.initialized())
            }
        }
    }
}
