// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memoized JSON escaping of template literals.
//!
//! Templates are per-call-site statics, so the cache is keyed by address rather than by
//! content: two statics with equal text are still two entries, and a lookup never hashes the
//! template strings. Property values are never cached.
//!
//! Lookups read an [`ArcSwap`] snapshot without locking; a miss publishes a copy of the map
//! with the new entry. Templates are few and fixed, so copies stop once every call site was seen.

use arc_swap::ArcSwap;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::sync::{Arc, OnceLock};

use crate::event::EventTemplate;
use crate::json::escape;

/// JSON-escaped literals of one [`EventTemplate`].
#[derive(Debug)]
pub struct EscapedTemplate {
    template: Box<[u8]>,
    event_id: Box<[u8]>,
    fragments: Box<[Box<[u8]>]>,
    names: Box<[Box<[u8]>]>,
}

impl EscapedTemplate {
    fn new(template: &EventTemplate) -> Self {
        Self {
            template: escape(template.template().as_bytes()),
            event_id: escape(template.event_id().as_bytes()),
            fragments: template
                .fragments()
                .iter()
                .map(|f| escape(f.as_bytes()))
                .collect(),
            names: template
                .names()
                .iter()
                .map(|n| escape(n.as_bytes()))
                .collect(),
        }
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }

    pub fn event_id(&self) -> &[u8] {
        &self.event_id
    }

    pub fn fragment(&self, index: usize) -> &[u8] {
        &self.fragments[index]
    }

    pub fn name(&self, index: usize) -> &[u8] {
        &self.names[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TemplateKey(usize);

impl TemplateKey {
    #[inline]
    fn of(template: &'static EventTemplate) -> Self {
        TemplateKey(std::ptr::from_ref(template) as usize)
    }
}

type Entries = HashMap<TemplateKey, Arc<EscapedTemplate>, FnvBuildHasher>;

#[derive(Debug)]
pub struct TemplateCache {
    entries: ArcSwap<Entries>,
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::with_hasher(FnvBuildHasher::default())),
        }
    }

    /// Returns the escaped literals for `template`, escaping them on first sight.
    pub fn escaped(&self, template: &'static EventTemplate) -> Arc<EscapedTemplate> {
        let key = TemplateKey::of(template);
        if let Some(found) = self.entries.load().get(&key) {
            return Arc::clone(found);
        }

        let fresh = Arc::new(EscapedTemplate::new(template));
        // A racing miss on the same template keeps whichever entry was published first.
        self.entries.rcu(|entries| {
            let mut entries = Entries::clone(entries);
            entries.entry(key).or_insert_with(|| Arc::clone(&fresh));
            entries
        });
        self.entries.load().get(&key).map_or(fresh, Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide cache shared by every [`crate::Pipeline`].
pub fn global() -> &'static TemplateCache {
    static CACHE: OnceLock<TemplateCache> = OnceLock::new();
    CACHE.get_or_init(TemplateCache::new)
}
