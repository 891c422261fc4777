// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free multi-insert / single-drain list of per-thread queues.
//!
//! Inserts push onto the head with a compare-and-swap. A drain swaps the head for null, which
//! hands it the whole chain exclusively, visits every node and then splices the survivors back
//! in front of whatever was inserted in the meantime.
//!
//! Neither side ever dereferences a head pointer it did not detach itself: an insert only
//! stores the observed head into its own node's `next`, and a splice only stores it into the
//! tail of its private chain. A recycled node address therefore cannot be followed through a
//! stale head, and no generation tag is needed.
//!
//! Only one drain may run at a time; the owner of the registry enforces that.

use futures::future::BoxFuture;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Outcome of visiting one entry during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    Delete,
    Retain,
    /// Retain this entry and end the pass; unvisited entries are retained too.
    Stop,
}

struct Node<T> {
    item: T,
    next: *mut Node<T>,
}

pub struct ThreadQueueRegistry<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: nodes are only reachable through `head` or through a detached chain owned by exactly
// one drain; items move between threads but are never shared.
unsafe impl<T: Send> Send for ThreadQueueRegistry<T> {}
unsafe impl<T: Send> Sync for ThreadQueueRegistry<T> {}

impl<T> Default for ThreadQueueRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadQueueRegistry<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `item`; safe from any number of threads.
    pub fn insert(&self, item: T) {
        let node = Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: the node is not published yet, we own it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Detaches the whole chain for one drain pass.
    ///
    /// Entries not deleted through the returned [`DrainPass`] go back into the registry when it
    /// is dropped, including when the pass is abandoned halfway.
    pub fn detach(&self) -> DrainPass<'_, T> {
        let chain = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        DrainPass {
            registry: self,
            remaining: chain,
            current: None,
            kept: Vec::new(),
        }
    }

    /// Visits every entry once, deleting those for which `visit` says so.
    pub fn drain_all(&self, mut visit: impl FnMut(&mut T) -> DrainAction) {
        let mut pass = self.detach();
        while let Some(item) = pass.advance() {
            match visit(item) {
                DrainAction::Delete => pass.delete_current(),
                DrainAction::Retain => {}
                DrainAction::Stop => break,
            }
        }
    }

    /// Like [`ThreadQueueRegistry::drain_all`] with a visitor that may suspend.
    ///
    /// `ctx` is lent to each visit together with the entry, so the visitor can hold mutable
    /// state across its await points. Dropping the returned future mid-visit retains every
    /// entry not yet deleted.
    pub async fn drain_all_async<C, F>(&self, ctx: &mut C, mut visit: F)
    where
        F: for<'a> FnMut(&'a mut C, &'a mut T) -> BoxFuture<'a, DrainAction>,
    {
        let mut pass = self.detach();
        while let Some(item) = pass.advance() {
            match visit(&mut *ctx, item).await {
                DrainAction::Delete => pass.delete_current(),
                DrainAction::Retain => {}
                DrainAction::Stop => break,
            }
        }
    }

    fn splice(&self, nodes: Vec<Box<Node<T>>>) {
        let mut nodes = nodes.into_iter().rev();
        let Some(last) = nodes.next() else {
            return;
        };
        let last = Box::into_raw(last);
        let mut first = last;
        for mut node in nodes {
            node.next = first;
            first = Box::into_raw(node);
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: the detached chain is still private to us.
            unsafe { (*last).next = head };
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl<T> Drop for ThreadQueueRegistry<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: we have exclusive access; every node came from Box::into_raw.
            let owned = unsafe { Box::from_raw(node) };
            node = owned.next;
        }
    }
}

/// One exclusive traversal of a detached chain.
pub struct DrainPass<'r, T> {
    registry: &'r ThreadQueueRegistry<T>,
    remaining: *mut Node<T>,
    current: Option<Box<Node<T>>>,
    kept: Vec<Box<Node<T>>>,
}

// SAFETY: the pass owns its chain exclusively.
unsafe impl<T: Send> Send for DrainPass<'_, T> {}

impl<T> DrainPass<'_, T> {
    /// Moves to the next entry, retaining the previous one unless it was deleted.
    pub fn advance(&mut self) -> Option<&mut T> {
        if let Some(previous) = self.current.take() {
            self.kept.push(previous);
        }
        if self.remaining.is_null() {
            return None;
        }
        // SAFETY: `remaining` points into the chain this pass detached.
        let mut node = unsafe { Box::from_raw(self.remaining) };
        self.remaining = node.next;
        node.next = ptr::null_mut();
        Some(&mut self.current.insert(node).item)
    }

    /// Removes the entry returned by the last [`DrainPass::advance`].
    pub fn delete_current(&mut self) {
        self.current = None;
    }
}

impl<T> Drop for DrainPass<'_, T> {
    fn drop(&mut self) {
        let mut nodes = std::mem::take(&mut self.kept);
        if let Some(current) = self.current.take() {
            nodes.push(current);
        }
        let mut rest = self.remaining;
        self.remaining = ptr::null_mut();
        while !rest.is_null() {
            // SAFETY: still part of the chain this pass detached.
            let mut node = unsafe { Box::from_raw(rest) };
            rest = node.next;
            node.next = ptr::null_mut();
            nodes.push(node);
        }
        self.registry.splice(nodes);
    }
}
