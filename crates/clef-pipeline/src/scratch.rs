// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread reusable scratch space.
//!
//! Contents are overwritten by the next call on the same thread; nothing handed out here may be
//! kept past the closure it was lent to. Re-entrant use (a sink logging from inside `ingest`) and
//! use during thread teardown fall back to a fresh, temporary value.

use std::cell::RefCell;
use std::thread::LocalKey;

use crate::event::EventValues;

const VALUE_SLOTS: usize = 16;
const VALUE_BYTES: usize = 1024;

thread_local! {
    static VALUES: RefCell<EventValues> =
        RefCell::new(EventValues::with_capacity(VALUE_SLOTS, VALUE_BYTES));
    static JSON_VALUES: RefCell<EventValues> =
        RefCell::new(EventValues::with_capacity(VALUE_SLOTS, VALUE_BYTES));
    static BYTES: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(VALUE_BYTES));
}

trait Reset {
    fn reset(&mut self);
}

impl Reset for EventValues {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reset for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

fn borrow_or_fresh<T, R>(
    key: &'static LocalKey<RefCell<T>>,
    f: impl FnOnce(&mut T) -> R,
) -> R
where
    T: Default + Reset,
{
    let available = key
        .try_with(|cell| cell.try_borrow_mut().is_ok())
        .unwrap_or(false);
    if !available {
        return f(&mut T::default());
    }
    key.with(|cell| {
        let mut value = cell.borrow_mut();
        value.reset();
        f(&mut value)
    })
}

/// Lends this thread's value list, cleared, for building one call's values.
pub fn with_values<R>(f: impl FnOnce(&mut EventValues) -> R) -> R {
    borrow_or_fresh(&VALUES, f)
}

/// Value list the pipeline re-encodes JSON into; separate so it can be held while the caller's
/// list is borrowed.
pub(crate) fn with_json_values<R>(f: impl FnOnce(&mut EventValues) -> R) -> R {
    borrow_or_fresh(&JSON_VALUES, f)
}

/// Lends this thread's grow-only byte buffer, cleared.
pub fn with_buffer<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    borrow_or_fresh(&BYTES, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;

    #[test]
    fn values_are_cleared_between_calls() {
        with_values(|values| values.push_str("first"));
        let len = with_values(|values| values.len());
        assert_eq!(len, 0);
    }

    #[test]
    fn nested_use_gets_a_fresh_list() {
        with_values(|outer| {
            outer.push_str("outer");
            with_values(|inner| {
                assert!(inner.is_empty());
                inner.push_str("inner");
            });
            assert_eq!(outer.get(0), Some(Value::Bytes(b"outer")));
        });
    }

    #[test]
    fn buffer_keeps_its_allocation() {
        let before = with_buffer(|buf| {
            buf.extend_from_slice(&[0; 4096]);
            buf.capacity()
        });
        let after = with_buffer(|buf| {
            assert!(buf.is_empty());
            buf.capacity()
        });
        assert_eq!(before, after);
    }
}
