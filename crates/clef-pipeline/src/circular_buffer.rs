// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free single-producer/single-consumer byte ring holding length-framed events.
//!
//! ## Layout
//!
//! Storage is `capacity + 4` bytes. Every frame is a little-endian `u32` length followed by the
//! payload. A zero length read where a frame should start means "the rest of the storage is
//! unused, continue at offset 0"; fewer than four bytes before the physical end means the same
//! thing implicitly.
//!
//! ```text
//!  0                    read                write             end
//!  │ ... free ...        │ len │ payload │ ... │ 0000 │ unused  │
//! ```
//!
//! `write` is only stored by the [`Producer`], `read` only by the [`Consumer`]. Each side loads
//! the other's offset with `Acquire` and publishes its own with `Release`, so the bytes between
//! the offsets are always owned by exactly one side. `read == write` means empty; a reservation
//! never makes `write` catch up with `read`, which keeps at least one byte between them when the
//! ring is full.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::RingError;

/// Size of the length prefix in front of every frame.
pub const PREFIX: usize = 4;

const MAX_CAPACITY: usize = u32::MAX as usize - PREFIX;

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    write: AtomicUsize,
    read: AtomicUsize,
}

// SAFETY: the producer only touches bytes outside [read, write) and the consumer only bytes
// inside it; the offsets are published with release/acquire pairs.
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// # Safety
    /// `offset + PREFIX` must be in bounds and owned by the caller's side.
    #[inline]
    unsafe fn write_prefix(&self, offset: usize, value: u32) {
        let bytes = value.to_le_bytes();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(offset), PREFIX);
    }

    /// # Safety
    /// `offset + PREFIX` must be in bounds and owned by the caller's side.
    #[inline]
    unsafe fn read_prefix(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; PREFIX];
        std::ptr::copy_nonoverlapping(self.base().add(offset), bytes.as_mut_ptr(), PREFIX);
        u32::from_le_bytes(bytes)
    }

    /// # Safety
    /// The range must be in bounds and owned by the consumer.
    #[inline]
    unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base().add(offset), len)
    }

    /// # Safety
    /// The range must be in bounds and owned by the producer.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base().add(offset), len)
    }
}

/// Creates a ring able to hold `capacity` bytes of frames including their prefixes.
pub fn with_capacity(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.clamp(1, MAX_CAPACITY);
    let storage = (0..capacity + PREFIX)
        .map(|_| UnsafeCell::new(0u8))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        storage,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
            reserved: None,
        },
        Consumer {
            shared,
            peeked: None,
        },
    )
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    offset: usize,
    size: usize,
}

/// Write side of the ring. Exactly one exists per ring.
pub struct Producer {
    shared: Arc<Shared>,
    reserved: Option<Reservation>,
}

impl Producer {
    /// Reserves `size` contiguous payload bytes.
    ///
    /// Wraps to offset 0 (leaving a zero-length marker at the tail) when the tail is too short
    /// but the head of the storage has room. Returns `None` and changes nothing when no layout
    /// fits.
    pub fn reserve(&mut self, size: usize) -> Option<&mut [u8]> {
        self.reserved = None;
        let len = self.shared.len();
        let need = size.checked_add(PREFIX).filter(|need| *need <= len)?;

        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Acquire);

        let offset = if write >= read {
            if write + need <= len {
                write
            } else if need < read {
                if len - write >= PREFIX {
                    // SAFETY: [write, len) is free while write >= read.
                    unsafe { self.shared.write_prefix(write, 0) };
                }
                0
            } else {
                return None;
            }
        } else if write + need < read {
            write
        } else {
            return None;
        };

        self.reserved = Some(Reservation { offset, size });
        // SAFETY: the reservation lies in the free region computed above.
        Some(unsafe { self.shared.slice_mut(offset + PREFIX, size) })
    }

    /// Publishes the first `size` bytes of the last reservation as one frame.
    ///
    /// `size` is clamped to the reserved size. Committing zero bytes, or without a reservation,
    /// publishes nothing.
    pub fn commit(&mut self, size: usize) {
        let Some(reservation) = self.reserved.take() else {
            return;
        };
        let size = size.min(reservation.size);
        if size == 0 {
            return;
        }
        // SAFETY: the prefix slot belongs to the reservation; size <= MAX_CAPACITY fits a u32.
        unsafe {
            self.shared
                .write_prefix(reservation.offset, size as u32)
        };
        self.shared
            .write
            .store(reservation.offset + PREFIX + size, Ordering::Release);
    }

    /// Copies `payload` in as one frame; `false` when it does not fit.
    pub fn push(&mut self, payload: &[u8]) -> bool {
        match self.reserve(payload.len()) {
            Some(dst) => {
                dst.copy_from_slice(payload);
                self.commit(payload.len());
                true
            }
            None => false,
        }
    }

    /// Whether the [`Consumer`] still exists.
    pub fn is_consumer_alive(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }

    pub fn capacity(&self) -> usize {
        self.shared.len() - PREFIX
    }
}

/// Read side of the ring. Exactly one exists per ring.
pub struct Consumer {
    shared: Arc<Shared>,
    /// Read offset just past the frames handed out by the last peek.
    peeked: Option<usize>,
}

impl Consumer {
    /// Offset and payload length of the frame at `read`, following a wrap marker.
    fn locate(&self, read: usize, write: usize) -> Option<(usize, usize)> {
        if read == write {
            return None;
        }
        let mut at = read;
        // SAFETY: read != write, so the bytes at `read` were published by the producer.
        if self.shared.len() - at < PREFIX || unsafe { self.shared.read_prefix(at) } == 0 {
            at = 0;
            if at == write {
                return None;
            }
        }
        // SAFETY: after a wrap the producer has published a frame starting at 0.
        let len = unsafe { self.shared.read_prefix(at) } as usize;
        if len == 0 {
            return None;
        }
        Some((at, len))
    }

    #[inline]
    fn offsets(&self) -> (usize, usize) {
        (
            self.shared.read.load(Ordering::Relaxed),
            self.shared.write.load(Ordering::Acquire),
        )
    }

    /// Next unread payload, without its prefix.
    pub fn peek_next(&mut self) -> Option<&[u8]> {
        let (read, write) = self.offsets();
        let (at, len) = self.locate(read, write)?;
        self.peeked = Some(at + PREFIX + len);
        // SAFETY: the frame lies inside the published region.
        Some(unsafe { self.shared.slice(at + PREFIX, len) })
    }

    /// Next unread frame including its 4-byte length prefix.
    pub fn peek_next_with_prefix(&mut self) -> Option<&[u8]> {
        let (read, write) = self.offsets();
        let (at, len) = self.locate(read, write)?;
        self.peeked = Some(at + PREFIX + len);
        // SAFETY: the frame lies inside the published region.
        Some(unsafe { self.shared.slice(at, PREFIX + len) })
    }

    /// Collects consecutive payloads while their total stays within `byte_limit`.
    ///
    /// Does not advance the read offset; a following [`Consumer::pop`] releases everything
    /// collected. Returns the number of payload bytes collected.
    pub fn peek_up_to<'s>(&'s mut self, byte_limit: usize, out: &mut Vec<&'s [u8]>) -> usize {
        let (mut read, write) = self.offsets();
        let mut total = 0;
        let mut end = None;
        while let Some((at, len)) = self.locate(read, write) {
            if total + len > byte_limit {
                break;
            }
            // SAFETY: the frame lies inside the published region.
            out.push(unsafe { self.shared.slice(at + PREFIX, len) });
            total += len;
            read = at + PREFIX + len;
            end = Some(read);
        }
        self.peeked = end;
        total
    }

    /// Releases the frames returned by the most recent peek.
    pub fn pop(&mut self) -> Result<(), RingError> {
        let end = self.peeked.take().ok_or(RingError::NothingPeeked)?;
        self.shared.read.store(end, Ordering::Release);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        let (read, write) = self.offsets();
        self.locate(read, write).is_none()
    }

    pub fn capacity(&self) -> usize {
        self.shared.len() - PREFIX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn drain(consumer: &mut Consumer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = consumer.peek_next() {
            out.push(frame.to_vec());
            consumer.pop().unwrap();
        }
        out
    }

    #[test]
    fn frames_come_back_in_commit_order() {
        let (mut producer, mut consumer) = with_capacity(64);
        assert!(producer.push(b"one"));
        assert!(producer.push(b"two"));
        assert!(producer.push(b"three"));

        assert_eq!(
            drain(&mut consumer),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert!(consumer.is_empty());
    }

    #[test]
    fn commit_may_shrink_the_reservation() {
        let (mut producer, mut consumer) = with_capacity(64);
        let dst = producer.reserve(16).unwrap();
        dst[..2].copy_from_slice(b"hi");
        producer.commit(2);

        assert_eq!(consumer.peek_next_with_prefix().unwrap(), b"\x02\x00\x00\x00hi");
        assert_eq!(consumer.peek_next().unwrap(), b"hi");
    }

    #[test]
    fn zero_commit_publishes_nothing() {
        let (mut producer, consumer) = with_capacity(64);
        producer.reserve(8).unwrap();
        producer.commit(0);
        assert!(consumer.is_empty());
    }

    #[test]
    fn reserve_wraps_when_tail_is_short() {
        // storage: 24 + 4 = 28 bytes
        let (mut producer, mut consumer) = with_capacity(24);
        assert!(producer.push(&[1; 8])); // [0, 12)
        assert!(producer.push(&[2; 8])); // [12, 24)
        assert_eq!(drain(&mut consumer).len(), 2);

        // Tail has 4 bytes, head has 24 free before read = 24.
        assert!(producer.push(&[3; 10]));
        assert_eq!(drain(&mut consumer), vec![vec![3; 10]]);
    }

    #[test]
    fn reserve_fails_without_changing_state() {
        let (mut producer, mut consumer) = with_capacity(24);
        assert!(producer.push(&[1; 8]));
        assert!(producer.push(&[2; 8]));
        assert!(producer.reserve(8).is_none());
        assert!(producer.reserve(100).is_none());

        assert_eq!(drain(&mut consumer), vec![vec![1; 8], vec![2; 8]]);
    }

    #[test]
    fn full_ring_keeps_a_gap() {
        let (mut producer, mut consumer) = with_capacity(24);
        assert!(producer.push(&[1; 8]));
        consumer.peek_next().unwrap();
        consumer.pop().unwrap();
        // read = 12, write = 12: a 12-byte frame at the tail ends at 28 = len, allowed.
        assert!(producer.push(&[2; 12]));
        // Wrapping needs need < read; 8 + 4 == 12 is not strictly less.
        assert!(producer.reserve(8).is_none());
        assert!(producer.push(&[3; 7]));
        assert_eq!(drain(&mut consumer), vec![vec![2; 12], vec![3; 7]]);
    }

    #[test]
    fn pop_without_peek_is_an_error() {
        let (mut producer, mut consumer) = with_capacity(32);
        assert_eq!(consumer.pop(), Err(RingError::NothingPeeked));
        producer.push(b"x");
        consumer.peek_next().unwrap();
        assert!(consumer.pop().is_ok());
        assert_eq!(consumer.pop(), Err(RingError::NothingPeeked));
    }

    #[test]
    fn peek_up_to_respects_the_limit_and_does_not_advance() {
        let (mut producer, mut consumer) = with_capacity(128);
        for payload in [&b"aaaa"[..], b"bbbb", b"cccc"] {
            assert!(producer.push(payload));
        }

        let mut frames = Vec::new();
        assert_eq!(consumer.peek_up_to(9, &mut frames), 8);
        assert_eq!(frames, vec![&b"aaaa"[..], b"bbbb"]);

        assert_eq!(consumer.peek_next().unwrap(), b"aaaa");
        let mut frames = Vec::new();
        consumer.peek_up_to(8, &mut frames);
        consumer.pop().unwrap();
        assert_eq!(drain(&mut consumer), vec![b"cccc".to_vec()]);
    }

    #[test]
    fn peek_up_to_crosses_the_wrap_marker() {
        let (mut producer, mut consumer) = with_capacity(30);
        assert!(producer.push(&[1; 10])); // [0, 14)
        assert!(producer.push(&[2; 10])); // [14, 28)
        consumer.peek_next().unwrap();
        consumer.pop().unwrap();
        assert!(producer.push(&[3; 6])); // wraps: [0, 10)

        let mut frames = Vec::new();
        assert_eq!(consumer.peek_up_to(64, &mut frames), 16);
        assert_eq!(frames, vec![&[2u8; 10][..], &[3u8; 6][..]]);
        consumer.pop().unwrap();
        assert!(consumer.is_empty());
    }

    #[test]
    fn producer_sees_consumer_drop() {
        let (producer, consumer) = with_capacity(16);
        assert!(producer.is_consumer_alive());
        drop(consumer);
        assert!(!producer.is_consumer_alive());
    }

    #[test]
    fn spsc_threads_preserve_order() {
        let (mut producer, mut consumer) = with_capacity(256);
        const COUNT: u32 = 20_000;

        let writer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let payload = i.to_le_bytes();
                let len = 1 + (i as usize % 13);
                loop {
                    if let Some(dst) = producer.reserve(len + 4) {
                        dst[..4].copy_from_slice(&payload);
                        producer.commit(len + 4);
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < COUNT {
            let Some(frame) = consumer.peek_next() else {
                std::thread::yield_now();
                continue;
            };
            let seq = u32::from_le_bytes(frame[..4].try_into().unwrap());
            assert_eq!(seq, expected);
            assert_eq!(frame.len(), 5 + (expected as usize % 13));
            consumer.pop().unwrap();
            expected += 1;
        }
        writer.join().unwrap();
        assert!(consumer.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(usize),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(1usize..40).prop_map(Op::Push), Just(Op::Pop)]
    }

    proptest! {
        #[test]
        fn committed_frames_fit_and_return_in_order(sizes in prop::collection::vec(1usize..32, 1..20)) {
            let total: usize = sizes.iter().map(|s| s + PREFIX).sum();
            let (mut producer, mut consumer) = with_capacity(total);
            for (i, size) in sizes.iter().enumerate() {
                prop_assert!(producer.push(&vec![i as u8; *size]));
            }
            let frames = drain(&mut consumer);
            prop_assert_eq!(frames.len(), sizes.len());
            for (i, (frame, size)) in frames.iter().zip(&sizes).enumerate() {
                prop_assert_eq!(frame, &vec![i as u8; *size]);
            }
        }

        #[test]
        fn interleaved_ops_match_a_queue(ops in prop::collection::vec(op(), 1..200)) {
            let (mut producer, mut consumer) = with_capacity(97);
            let mut model = VecDeque::new();
            let mut next = 0u8;
            for op in ops {
                match op {
                    Op::Push(size) => {
                        let payload = vec![next; size];
                        if producer.push(&payload) {
                            model.push_back(payload);
                            next = next.wrapping_add(1);
                        }
                    }
                    Op::Pop => {
                        let got = consumer.peek_next().map(<[u8]>::to_vec);
                        prop_assert_eq!(got.clone(), model.pop_front());
                        if got.is_some() {
                            consumer.pop().unwrap();
                        }
                    }
                }
            }
            let rest = drain(&mut consumer);
            prop_assert_eq!(rest, model.into_iter().collect::<Vec<_>>());
        }
    }
}
