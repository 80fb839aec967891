// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace rings for fabric bring-up.
//!
//! A [`Ringbuf`] keeps the last `N` events recorded by whatever owns it,
//! tagged with the source line that recorded them. Recording the same payload
//! from the same line as the most recent entry bumps that entry's count
//! instead of consuming a slot, so a polling loop that sees the same status a
//! thousand times costs one entry.
//!
//! Rings are ordinary values rather than statics: the context object that
//! does the work owns its ring, and anything that wants the history (a fatal
//! error report, a test) walks it with [`Ringbuf::iter`].
//!
//! ## Constraints
//!
//! The payload type must implement both `Copy` and `PartialEq`. In practice
//! it is a per-module `Trace` enum.
//!
//! ## Recording
//!
//! ```
//! use ringbuf::{ringbuf_entry, Ringbuf};
//!
//! #[derive(Copy, Clone, PartialEq, Debug)]
//! enum Trace {
//!     LinkStatus(u8),
//!     Trained,
//! }
//!
//! let mut ring = Ringbuf::<Trace, 8>::new();
//! ringbuf_entry!(ring, Trace::LinkStatus(0));
//! ringbuf_entry!(ring, Trace::Trained);
//! assert_eq!(ring.last().map(|e| e.payload), Some(Trace::Trained));
//! ```

#![cfg_attr(not(test), no_std)]

/// Records `payload` in `ring`, tagged with the calling line.
///
/// `ring` must be a place expression for a [`Ringbuf`]; it is borrowed
/// mutably only after `payload` has been evaluated, so the payload may read
/// from the same context that owns the ring.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($ring:expr, $payload:expr) => {{
        let p = $payload;
        $crate::Ringbuf::entry(&mut $ring, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($ring:expr, $payload:expr) => {{
        let _ = &$ring;
        let _ = $payload;
    }};
}

/// A single recorded event. `count` is how many consecutive times it was
/// recorded; `generation` is how many times its slot has been filled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingbufEntry<T> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug, Clone)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [Option<RingbufEntry<T>>; N],
}

impl<T: Copy + PartialEq, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [None; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        if N == 0 {
            return;
        }

        if let Some(Some(ent)) = self.last.and_then(|i| self.buffer.get_mut(i))
        {
            if ent.line == line && ent.payload == payload {
                // Only coalesce while the count still fits; after that the
                // repeat starts a fresh entry.
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let ndx = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };

        let generation = match &self.buffer[ndx] {
            Some(old) => old.generation.wrapping_add(1),
            None => 1,
        };

        self.buffer[ndx] = Some(RingbufEntry {
            line,
            generation,
            count: 1,
            payload,
        });
        self.last = Some(ndx);
    }

    /// The most recently recorded entry.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer[i].as_ref())
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = self.last.map_or(0, |i| i + 1);
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter_map(Option::as_ref)
    }

    /// Payloads from oldest to newest, ignoring repeat counts.
    pub fn payloads(&self) -> impl Iterator<Item = T> + '_ {
        self.iter().map(|e| e.payload)
    }

    pub fn len(&self) -> usize {
        self.buffer.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
