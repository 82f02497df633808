//! FIFO queue of `(value, size)` entries with a running total.
//!
//! Sizes are computed once by the caller at enqueue time and never
//! recomputed. Entries leave strictly from the front; the total is clamped at
//! zero so floating-point drift can never make it negative.

use std::collections::VecDeque;

use crate::error::{StreamError, StreamResult};

/// One buffered chunk and the size charged for it.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry<T> {
    /// Buffered value.
    pub value: T,
    /// Size charged against the high-water mark.
    pub size: f64,
}

/// Ordered list of sized entries plus their total size.
#[derive(Clone, Debug)]
pub struct SizedQueue<T> {
    entries: VecDeque<QueueEntry<T>>,
    total_size: f64,
}

impl<T> SizedQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Appends `value` charged at `size`.
    ///
    /// Rejects NaN, negative and infinite sizes without modifying the queue.
    pub fn enqueue_with_size(&mut self, value: T, size: f64) -> StreamResult<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidSize(size));
        }
        self.entries.push_back(QueueEntry { value, size });
        self.total_size += size;
        Ok(())
    }

    /// Removes the front entry and returns its value.
    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.entries.pop_front()?;
        self.total_size -= entry.size;
        if self.total_size < 0.0 {
            self.total_size = 0.0;
        }
        Some(entry.value)
    }

    /// Puts `value` back at the front, charged at `size`. Used when only
    /// part of the front entry was consumed.
    pub fn requeue_front(&mut self, value: T, size: f64) -> StreamResult<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidSize(size));
        }
        self.entries.push_front(QueueEntry { value, size });
        self.total_size += size;
        Ok(())
    }

    /// Front value without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|entry| &entry.value)
    }

    /// Drops every entry and zeroes the total.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    /// Sum of the sizes of all buffered entries.
    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates buffered entries front to back.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<T>> {
        self.entries.iter()
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
