//! Ordered assembly of streamed assistant text.
//!
//! [`TextBuffer`] decouples the arrival rate of text fragments from the rate
//! at which the visible text is updated. Fragments queue in a pending list
//! and are merged on a flush; flushes happen on the driver's frame tick, or
//! immediately once the pending queue grows past a threshold or the last
//! flush is older than the latency bound (the catch-up policy).
//!
//! Uses [`tokio::time::Instant`] so tests with a paused clock control the
//! latency policy deterministically.

use std::time::Duration;

use tokio::time::Instant;

/// One fragment of assistant text, ordered by `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    /// Position of this fragment in the logical text.
    pub sequence: u64,
    /// The fragment itself.
    pub content: String,
}

/// Render-rate-limited store of text fragments.
///
/// The externally visible text is always the ascending-by-sequence
/// concatenation of the merged fragment set. Duplicate sequences overwrite
/// (last writer wins), never duplicate.
#[derive(Debug)]
pub struct TextBuffer {
    /// Merged fragments, sorted ascending by sequence, unique sequences.
    fragments: Vec<TextFragment>,
    /// Fragments received since the last flush, in arrival order.
    pending: Vec<TextFragment>,
    last_flush: Instant,
    max_pending: usize,
    max_latency: Duration,
}

impl TextBuffer {
    /// Create a buffer with the given catch-up thresholds.
    pub fn new(max_pending: usize, max_latency: Duration) -> Self {
        Self {
            fragments: Vec::new(),
            pending: Vec::new(),
            last_flush: Instant::now(),
            max_pending,
            max_latency,
        }
    }

    /// Queue a fragment for the next flush.
    ///
    /// Returns `true` when the catch-up policy demands an immediate flush:
    /// the pending queue has grown past the threshold, or more than the
    /// latency bound has elapsed since the last flush.
    pub fn push(&mut self, fragment: TextFragment) -> bool {
        self.pending.push(fragment);
        self.pending.len() > self.max_pending || self.last_flush.elapsed() > self.max_latency
    }

    /// Whether any fragments are waiting to be merged.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Merge all pending fragments into the ordered set.
    ///
    /// Pending fragments are sorted by sequence (stably, so a later arrival
    /// with the same sequence wins) and merged last-writer-wins. A fast path
    /// skips the sort and the per-fragment search when arrivals are already
    /// strictly ascending past the current tail, which is the common case.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            self.last_flush = Instant::now();
            return;
        }

        if self.pending_is_appendable() {
            self.fragments.append(&mut self.pending);
        } else {
            let mut incoming = std::mem::take(&mut self.pending);
            incoming.sort_by_key(|f| f.sequence);
            for fragment in incoming {
                self.merge_fragment(fragment);
            }
        }

        self.last_flush = Instant::now();
    }

    /// True when pending fragments are strictly ascending and all beyond the
    /// merged tail, so they can be appended wholesale.
    fn pending_is_appendable(&self) -> bool {
        let floor = self.fragments.last().map(|f| f.sequence);
        let mut previous = floor;
        for fragment in &self.pending {
            if previous.is_some_and(|p| fragment.sequence <= p) {
                return false;
            }
            previous = Some(fragment.sequence);
        }
        true
    }

    /// Insert or overwrite one fragment in the sorted set.
    fn merge_fragment(&mut self, fragment: TextFragment) {
        match self
            .fragments
            .binary_search_by_key(&fragment.sequence, |f| f.sequence)
        {
            Ok(pos) => self.fragments[pos].content = fragment.content,
            Err(pos) => self.fragments.insert(pos, fragment),
        }
    }

    /// The canonical ordered text: ascending-by-sequence concatenation of
    /// the merged set. Pending (unflushed) fragments are not included.
    pub fn ordered_text(&self) -> String {
        self.fragments.iter().map(|f| f.content.as_str()).collect()
    }

    /// Drop all state, merged and pending.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.pending.clear();
        self.last_flush = Instant::now();
    }

    /// Whether the buffer holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(sequence: u64, content: &str) -> TextFragment {
        TextFragment {
            sequence,
            content: content.to_string(),
        }
    }

    fn buffer() -> TextBuffer {
        TextBuffer::new(10, Duration::from_millis(50))
    }

    #[test]
    fn test_out_of_order_fragments_flush_sorted() {
        // P6: arrival order 2, 1, 3 still yields "abc".
        let mut buf = buffer();
        buf.push(fragment(2, "b"));
        buf.push(fragment(1, "a"));
        buf.push(fragment(3, "c"));
        buf.flush();
        assert_eq!(buf.ordered_text(), "abc");
    }

    #[test]
    fn test_pending_not_visible_before_flush() {
        let mut buf = buffer();
        buf.push(fragment(0, "hidden"));
        assert_eq!(buf.ordered_text(), "");
        buf.flush();
        assert_eq!(buf.ordered_text(), "hidden");
    }

    #[test]
    fn test_monotonic_fast_path_matches_slow_path() {
        let mut fast = buffer();
        fast.push(fragment(0, "Hel"));
        fast.push(fragment(1, "lo"));
        fast.flush();
        fast.push(fragment(2, "!"));
        fast.flush();

        let mut slow = buffer();
        slow.push(fragment(2, "!"));
        slow.push(fragment(0, "Hel"));
        slow.push(fragment(1, "lo"));
        slow.flush();

        assert_eq!(fast.ordered_text(), "Hello!");
        assert_eq!(slow.ordered_text(), "Hello!");
    }

    #[test]
    fn test_duplicate_sequence_last_writer_wins() {
        let mut buf = buffer();
        buf.push(fragment(0, "first"));
        buf.flush();
        buf.push(fragment(0, "second"));
        buf.flush();
        assert_eq!(buf.ordered_text(), "second");
    }

    #[test]
    fn test_duplicate_within_one_flush_last_arrival_wins() {
        let mut buf = buffer();
        buf.push(fragment(0, "first"));
        buf.push(fragment(0, "second"));
        buf.flush();
        assert_eq!(buf.ordered_text(), "second");
    }

    #[test]
    fn test_catch_up_on_queue_depth() {
        let mut buf = TextBuffer::new(3, Duration::from_secs(3600));
        assert!(!buf.push(fragment(0, "a")));
        assert!(!buf.push(fragment(1, "b")));
        assert!(!buf.push(fragment(2, "c")));
        // Fourth pending fragment crosses the threshold.
        assert!(buf.push(fragment(3, "d")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_on_latency() {
        let mut buf = TextBuffer::new(100, Duration::from_millis(50));
        assert!(!buf.push(fragment(0, "a")));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(buf.push(fragment(1, "b")));
    }

    #[test]
    fn test_interleaved_flushes() {
        let mut buf = buffer();
        buf.push(fragment(1, "b"));
        buf.flush();
        buf.push(fragment(0, "a"));
        buf.push(fragment(2, "c"));
        buf.flush();
        assert_eq!(buf.ordered_text(), "abc");
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut buf = buffer();
        buf.push(fragment(0, "a"));
        buf.flush();
        buf.push(fragment(1, "b"));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.ordered_text(), "");
    }

    #[test]
    fn test_empty_flush_is_harmless() {
        let mut buf = buffer();
        buf.flush();
        assert_eq!(buf.ordered_text(), "");
    }
}
