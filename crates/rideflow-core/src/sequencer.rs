//! Inbound stream sequencer with gap buffering.
//!
//! Enforces in-order, exactly-once delivery per stream regardless of what the
//! transport does. Each stream tracks the highest contiguous item delivered
//! (`last`). Items ahead of `last + 1` wait in a bounded buffer; items at or
//! below `last` are duplicates.
//!
//! A gap that stays open longer than the wait window produces exactly one
//! [`GapTimeout`]. The caller turns it into a resync request; the sequencer
//! does not try to fill history itself.
//!
//! One instance serves trip events (keyed by trip), another serves chat
//! (keyed by sender).

use std::{collections::BTreeMap, fmt, ops::Sub, time::Duration};

use rideflow_proto::{ChatMessage, TripEvent};

use crate::{env::elapsed_at_least, error::GapTimeout};

/// Default time a gap may stay open before a resync is requested.
pub const DEFAULT_GAP_WAIT: Duration = Duration::from_secs(10);

/// Default number of out-of-order items buffered per stream.
pub const DEFAULT_MAX_BUFFERED: usize = 64;

/// Something with a position in a sequenced stream.
pub trait Sequenced {
    /// 1-based position in the stream.
    fn sequence(&self) -> u64;
}

impl Sequenced for TripEvent {
    fn sequence(&self) -> u64 {
        self.version
    }
}

impl Sequenced for ChatMessage {
    fn sequence(&self) -> u64 {
        self.sequence_number
    }
}

/// Sequencer configuration
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// How long a gap may stay open before a resync is requested
    pub gap_wait: Duration,
    /// Maximum buffered items per stream
    pub max_buffered: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { gap_wait: DEFAULT_GAP_WAIT, max_buffered: DEFAULT_MAX_BUFFERED }
    }
}

/// Outcome of ingesting one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest<T> {
    /// Item was next in line. Delivered together with every buffered item it
    /// made contiguous, in order.
    Deliver(Vec<T>),
    /// Item is ahead of a gap and was buffered.
    Buffered,
    /// Item was already delivered or already buffered. Handed back so the
    /// caller can inspect it.
    Duplicate(T),
    /// Buffer was full. The item was dropped and the caller should resync
    /// now; the pending gap will not produce another timeout.
    Overflow,
}

#[derive(Debug, Clone)]
struct StreamState<T, I> {
    last: u64,
    buffered: BTreeMap<u64, T>,
    gap_since: Option<I>,
    /// `last` at the time a resync was issued for the current gap
    resync_issued_at: Option<u64>,
}

impl<T, I> Default for StreamState<T, I> {
    fn default() -> Self {
        Self { last: 0, buffered: BTreeMap::new(), gap_since: None, resync_issued_at: None }
    }
}

/// Per-stream ordering and deduplication.
#[derive(Debug, Clone)]
pub struct Sequencer<K, T, I> {
    // Key order keeps tick() output deterministic.
    streams: BTreeMap<K, StreamState<T, I>>,
    config: SequencerConfig,
}

impl<K, T, I> Sequencer<K, T, I>
where
    K: Copy + Ord + fmt::Display,
    T: Sequenced,
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Create an empty sequencer. Every stream starts at `last == 0`.
    pub fn new(config: SequencerConfig) -> Self {
        Self { streams: BTreeMap::new(), config }
    }

    /// Highest contiguous item delivered on `key`.
    pub fn last(&self, key: K) -> u64 {
        self.streams.get(&key).map_or(0, |s| s.last)
    }

    /// Number of items waiting behind a gap on `key`.
    pub fn buffered_len(&self, key: K) -> usize {
        self.streams.get(&key).map_or(0, |s| s.buffered.len())
    }

    /// Whether `key` has an open gap.
    pub fn has_gap(&self, key: K) -> bool {
        self.buffered_len(key) > 0
    }

    /// Ingest one item for `key`.
    pub fn ingest(&mut self, key: K, item: T, now: I) -> Ingest<T> {
        let max_buffered = self.config.max_buffered;
        let stream = self.streams.entry(key).or_default();
        let seq = item.sequence();

        if seq <= stream.last || stream.buffered.contains_key(&seq) {
            tracing::trace!(stream = %key, seq, last = stream.last, "Duplicate discarded");
            return Ingest::Duplicate(item);
        }

        if seq == stream.last + 1 {
            stream.last = seq;
            let mut batch = vec![item];
            batch.extend(drain_contiguous(stream, now));
            return Ingest::Deliver(batch);
        }

        if stream.buffered.len() >= max_buffered {
            tracing::warn!(
                stream = %key,
                seq,
                last = stream.last,
                buffered = stream.buffered.len(),
                "Gap buffer full, forcing resync"
            );
            stream.resync_issued_at = Some(stream.last);
            return Ingest::Overflow;
        }

        if stream.gap_since.is_none() {
            stream.gap_since = Some(now);
        }
        tracing::debug!(stream = %key, seq, last = stream.last, "Buffered behind gap");
        stream.buffered.insert(seq, item);
        Ingest::Buffered
    }

    /// Report gaps that outlived the wait window.
    ///
    /// Each gap is reported once. A gap counts as new when `last` has moved
    /// since the previous report.
    pub fn tick(&mut self, now: I) -> Vec<GapTimeout<K>> {
        let gap_wait = self.config.gap_wait;
        let mut timeouts = Vec::new();

        for (key, stream) in &mut self.streams {
            let Some(since) = stream.gap_since else {
                continue;
            };
            if stream.resync_issued_at == Some(stream.last) {
                continue;
            }
            if elapsed_at_least(now, since, gap_wait) {
                stream.resync_issued_at = Some(stream.last);
                timeouts.push(GapTimeout {
                    key: *key,
                    last_applied: stream.last,
                    waited: now - since,
                });
            }
        }

        timeouts
    }

    /// Fast-forward `key` to `version` after a snapshot or a local commit.
    ///
    /// Buffered items at or below `version` are discarded. Returns the
    /// buffered items that are now contiguous, in order. Never moves `last`
    /// backwards.
    pub fn reset_to(&mut self, key: K, version: u64, now: I) -> Vec<T> {
        let stream = self.streams.entry(key).or_default();
        if version <= stream.last {
            return Vec::new();
        }

        stream.last = version;
        stream.buffered = stream.buffered.split_off(&version.saturating_add(1));
        drain_contiguous(stream, now)
    }
}

/// Pop buffered items that follow `last` and restart or clear the gap timer.
fn drain_contiguous<T, I: Copy>(stream: &mut StreamState<T, I>, now: I) -> Vec<T> {
    let mut batch = Vec::new();
    while let Some(item) = stream.buffered.remove(&(stream.last + 1)) {
        stream.last += 1;
        batch.push(item);
    }

    if stream.buffered.is_empty() {
        stream.gap_since = None;
        stream.resync_issued_at = None;
    } else {
        // A new gap opens behind the remaining items.
        stream.gap_since = Some(now);
    }

    batch
}
