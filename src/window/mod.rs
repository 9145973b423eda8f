use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;

/// Half-open `[start, end)` slice of a sync range, sized to fit one
/// provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// How a provider constrains one request.
#[derive(Debug, Clone, Copy)]
pub enum ChunkPolicy {
    /// Fixed date-span steps, oldest first (e.g. Fitbit's 30/100-day caps).
    Forward { max_span: TimeDelta },
    /// Newest-first responses truncated at an item cap; the next boundary is
    /// derived from the oldest item actually returned.
    Backward { max_items: usize },
}

/// Decompose `[start, end)` into steps of at most `max_span`. The union of
/// the result covers the input exactly; the last chunk is clipped.
pub fn chunk_forward(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_span: TimeDelta,
) -> Vec<ChunkWindow> {
    let mut chunks = Vec::new();
    if max_span <= TimeDelta::zero() || start >= end {
        return chunks;
    }
    let mut current = start;
    while current < end {
        let stop = std::cmp::min(current + max_span, end);
        chunks.push(ChunkWindow {
            start: current,
            end: stop,
        });
        current = stop;
    }
    chunks
}

/// Cursor state for backward pagination against a newest-first provider.
///
/// Windows are issued from `end` toward `start`; the caller fetches each one
/// (treating the end boundary as inclusive so a truncated timestamp is never
/// skipped) and feeds the page back through [`ReverseSession::absorb`], which
/// drops rows already seen at the boundary and moves the cursor to the oldest
/// returned timestamp. A short page means no older data remains.
pub struct ReverseSession {
    start: DateTime<Utc>,
    cursor_end: DateTime<Utc>,
    max_items: usize,
    seen: HashSet<String>,
    done: bool,
}

impl ReverseSession {
    pub fn new(window: ChunkWindow, max_items: usize) -> Self {
        Self {
            start: window.start,
            cursor_end: window.end,
            max_items: max_items.max(1),
            seen: HashSet::new(),
            done: window.start >= window.end,
        }
    }

    /// The next window to fetch, or `None` once the range is exhausted.
    pub fn next_window(&self) -> Option<ChunkWindow> {
        if self.done {
            return None;
        }
        Some(ChunkWindow {
            start: self.start,
            end: self.cursor_end,
        })
    }

    /// Feed back the `(natural_id, timestamp)` pairs of a fetched page.
    /// Returns the indexes of rows not delivered by a previous page, in the
    /// page's own order.
    pub fn absorb(&mut self, page: &[(String, DateTime<Utc>)]) -> Vec<usize> {
        let fresh: Vec<usize> = page
            .iter()
            .enumerate()
            .filter(|(_, (id, _))| !self.seen.contains(id))
            .map(|(i, _)| i)
            .collect();
        for (id, _) in page {
            self.seen.insert(id.clone());
        }

        // A short page means the provider has nothing older; an all-duplicate
        // page means the cursor cannot move and the session must stop.
        if page.len() < self.max_items || fresh.is_empty() {
            self.done = true;
            return fresh;
        }

        let oldest = page
            .iter()
            .map(|(_, ts)| *ts)
            .min()
            .unwrap_or(self.cursor_end);
        if oldest <= self.start {
            self.done = true;
        } else {
            self.cursor_end = oldest;
        }
        fresh
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
