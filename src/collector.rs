use crate::envelope::{self, Envelope};
use crate::progress::{format_remaining, ArrivalEstimator};
use crate::symbol::Frame;

use std::collections::BTreeMap;
use std::time::Instant;

/// Receiver-side chunk storage: 1-based index -> payload text.
///
/// First write wins; a present key is never overwritten, which makes the
/// store idempotent under the many duplicate decodes a camera produces
/// while a symbol stays in frame.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: BTreeMap<u32, String>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and changes nothing) when the index is already
    /// present.
    pub fn insert(&mut self, index: u32, payload: String) -> bool {
        match self.chunks.entry(index) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(payload);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn max_index(&self) -> Option<u32> {
        self.chunks.keys().next_back().copied()
    }

    pub fn is_complete(&self, total: u32) -> bool {
        self.len() as u64 == total as u64
    }

    /// Sorted gap list, computed on demand at assembly time.
    pub fn missing(&self, total: u32) -> Vec<u32> {
        (1..=total).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// Payloads in ascending index order; order is load-bearing, arrival
    /// order is unrelated.
    pub fn payloads_in_order(&self) -> impl Iterator<Item = &str> {
        self.chunks.values().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Done,
}

/// What one observed frame did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// No decodable symbol this tick, or the session is not scanning.
    Blank,
    /// File info accepted; filename and total are now established.
    FileInfo { filename: String, total_chunks: u32 },
    /// Identical file info rescanned; values unchanged.
    FileInfoRepeated,
    /// File info contradicting established session state; rejected.
    FileInfoConflict { reason: String },
    /// Fresh chunk stored.
    Stored { index: u32, total: Option<u32> },
    /// Chunk index already present; nothing changed.
    Duplicate,
    /// Chunk contradicting established totals or out of range; rejected.
    ChunkConflict { index: u32, reason: String },
    /// Decoded text matched neither envelope shape.
    Invalid,
    /// The final chunk just arrived; the set is complete.
    Complete,
}

/// One receive session: owns the store and the derived metadata, and is
/// the only writer to either. All mutation happens inside `observe`,
/// one frame at a time.
pub struct Collector {
    state: SessionState,
    filename: Option<String>,
    total_chunks: Option<u32>,
    store: ChunkStore,
    estimator: ArrivalEstimator,
    frames_seen: usize,
    duplicates: usize,
    invalid: usize,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            filename: None,
            total_chunks: None,
            store: ChunkStore::new(),
            estimator: ArrivalEstimator::default(),
            frames_seen: 0,
            duplicates: 0,
            invalid: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn received(&self) -> u32 {
        self.store.len() as u32
    }

    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn invalid(&self) -> usize {
        self.invalid
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Enter Scanning. Only call after the frame source was acquired; a
    /// failed acquisition must leave the session Idle by never reaching
    /// this point.
    pub fn begin_scan(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Scanning;
        }
    }

    /// Leave Scanning without assembling. Idempotent; collected chunks
    /// are kept so a later session can fill the gaps.
    pub fn stop(&mut self) {
        if self.state == SessionState::Scanning {
            self.state = SessionState::Idle;
        }
    }

    /// Discard the whole session: store, metadata, estimator and
    /// counters, back to Idle.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advisory time remaining, from the moving average of recent
    /// inter-arrival gaps. "calculating" until both a total and at least
    /// one gap sample exist.
    pub fn remaining_text(&self) -> String {
        let eta = self
            .total_chunks
            .map(|total| u64::from(total.saturating_sub(self.received())))
            .and_then(|remaining| self.estimator.eta(remaining));
        format_remaining(eta)
    }

    /// Ingest one camera tick. Level-triggered: a frame without a
    /// decodable symbol is a no-op, not an error. Only mutates while
    /// Scanning.
    pub fn observe(&mut self, frame: &Frame, now: Instant) -> ScanEvent {
        if self.state != SessionState::Scanning {
            return ScanEvent::Blank;
        }
        let text = match frame {
            Frame::Decoded(text) => text,
            Frame::Blank | Frame::Exhausted => return ScanEvent::Blank,
        };
        self.frames_seen += 1;

        match envelope::classify(text) {
            None => {
                self.invalid += 1;
                ScanEvent::Invalid
            }
            Some(Envelope::FileInfo {
                filename,
                chunk_count,
            }) => self.ingest_file_info(filename, chunk_count),
            Some(Envelope::Chunk {
                index,
                total_chunks,
                data,
            }) => self.ingest_chunk(index, total_chunks, data, now),
        }
    }

    fn ingest_file_info(&mut self, filename: String, chunk_count: u32) -> ScanEvent {
        if let Some(known) = &self.filename {
            if *known != filename {
                return ScanEvent::FileInfoConflict {
                    reason: format!("announced file {:?} but session holds {:?}", filename, known),
                };
            }
        }
        if let Some(total) = self.total_chunks {
            if total != chunk_count {
                return ScanEvent::FileInfoConflict {
                    reason: format!("announced {} chunks but session expects {}", chunk_count, total),
                };
            }
        }
        if let Some(max) = self.store.max_index() {
            if max > chunk_count {
                return ScanEvent::FileInfoConflict {
                    reason: format!("announced {} chunks but chunk {} is already stored", chunk_count, max),
                };
            }
        }

        let repeated = self.filename.is_some();
        self.filename = Some(filename.clone());
        self.total_chunks = Some(chunk_count);
        self.estimator.reset();

        if self.store.is_complete(chunk_count) {
            // A zero-chunk transfer (or info arriving after every chunk
            // already did) completes on the spot.
            self.state = SessionState::Done;
            return ScanEvent::Complete;
        }
        if repeated {
            ScanEvent::FileInfoRepeated
        } else {
            ScanEvent::FileInfo {
                filename,
                total_chunks: chunk_count,
            }
        }
    }

    fn ingest_chunk(
        &mut self,
        index: u32,
        total_chunks: u32,
        data: String,
        now: Instant,
    ) -> ScanEvent {
        if index == 0 || index > total_chunks {
            return ScanEvent::ChunkConflict {
                index,
                reason: format!("index out of range 1..={}", total_chunks),
            };
        }
        if let Some(total) = self.total_chunks {
            if total != total_chunks {
                return ScanEvent::ChunkConflict {
                    index,
                    reason: format!("carries total {} but session expects {}", total_chunks, total),
                };
            }
        } else {
            // Bootstrap the total from the chunk itself so scan order
            // does not matter.
            self.total_chunks = Some(total_chunks);
        }

        if !self.store.insert(index, data) {
            self.duplicates += 1;
            return ScanEvent::Duplicate;
        }
        self.estimator.record_arrival(now);

        let total = self.total_chunks.unwrap_or(total_chunks);
        if self.store.is_complete(total) {
            self.state = SessionState::Done;
            ScanEvent::Complete
        } else {
            ScanEvent::Stored {
                index,
                total: self.total_chunks,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::Segmenter;
    use std::time::Duration;

    fn decoded(env: &Envelope) -> Frame {
        Frame::Decoded(env.to_wire())
    }

    fn scanning_collector() -> Collector {
        let mut c = Collector::new();
        c.begin_scan();
        c
    }

    #[test]
    fn store_is_first_write_wins() {
        let mut store = ChunkStore::new();
        assert!(store.insert(2, "first".to_string()));
        assert!(!store.insert(2, "second".to_string()));
        assert_eq!(store.payloads_in_order().collect::<Vec<_>>(), vec!["first"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_set_is_sorted_and_exact() {
        let mut store = ChunkStore::new();
        store.insert(1, "a".into());
        store.insert(3, "c".into());
        store.insert(4, "d".into());
        assert_eq!(store.missing(5), vec![2, 5]);
        assert!(!store.is_complete(5));
    }

    #[test]
    fn observe_is_inert_outside_scanning() {
        let mut c = Collector::new();
        let seg = Segmenter::new("x.bin", vec![1, 2, 3], 2).unwrap();
        let event = c.observe(&decoded(&seg.envelope(1)), Instant::now());
        assert_eq!(event, ScanEvent::Blank);
        assert_eq!(c.received(), 0);
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn stop_is_idempotent_and_keeps_chunks() {
        let mut c = scanning_collector();
        let seg = Segmenter::new("x.bin", vec![0u8; 100], 10).unwrap();
        c.observe(&decoded(&seg.envelope(3)), Instant::now());
        assert_eq!(c.received(), 1);

        c.stop();
        c.stop();
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(c.received(), 1);
    }

    #[test]
    fn reset_discards_the_whole_session() {
        let mut c = scanning_collector();
        let seg = Segmenter::new("x.bin", vec![9u8; 100], 10).unwrap();
        let now = Instant::now();
        c.observe(&decoded(&seg.envelope(0)), now);
        c.observe(&decoded(&seg.envelope(1)), now);
        assert_eq!(c.received(), 1);

        c.reset();
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(c.received(), 0);
        assert_eq!(c.filename(), None);
        assert_eq!(c.total_chunks(), None);
        assert_eq!(c.remaining_text(), "calculating");
    }

    #[test]
    fn any_arrival_order_completes() {
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let seg = Segmenter::new("x.bin", data, 60).unwrap();

        // Chunk 2, chunk 3, file info, chunk 1.
        let mut c = scanning_collector();
        let now = Instant::now();
        assert!(matches!(
            c.observe(&decoded(&seg.envelope(2)), now),
            ScanEvent::Stored { index: 2, .. }
        ));
        assert!(matches!(
            c.observe(&decoded(&seg.envelope(3)), now),
            ScanEvent::Stored { index: 3, .. }
        ));
        assert!(matches!(
            c.observe(&decoded(&seg.envelope(0)), now),
            ScanEvent::FileInfo { .. }
        ));
        assert_eq!(c.observe(&decoded(&seg.envelope(1)), now), ScanEvent::Complete);
        assert_eq!(c.state(), SessionState::Done);
        assert_eq!(c.filename(), Some("x.bin"));
        assert_eq!(c.total_chunks(), Some(3));
    }

    #[test]
    fn totals_bootstrap_from_chunks_without_file_info() {
        let seg = Segmenter::new("x.bin", vec![7u8; 90], 30).unwrap();
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(&decoded(&seg.envelope(1)), now);
        assert_eq!(c.total_chunks(), Some(3));
        c.observe(&decoded(&seg.envelope(2)), now);
        let event = c.observe(&decoded(&seg.envelope(3)), now);
        assert_eq!(event, ScanEvent::Complete);
        assert_eq!(c.filename(), None);
    }

    #[test]
    fn duplicates_are_no_ops() {
        let seg = Segmenter::new("x.bin", vec![1u8; 100], 10).unwrap();
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(&decoded(&seg.envelope(4)), now);
        let event = c.observe(&decoded(&seg.envelope(4)), now + Duration::from_secs(1));
        assert_eq!(event, ScanEvent::Duplicate);
        assert_eq!(c.received(), 1);
        assert_eq!(c.duplicates(), 1);
    }

    #[test]
    fn identical_file_info_rescan_is_idempotent() {
        let seg = Segmenter::new("x.bin", vec![1u8; 100], 60).unwrap();
        let mut c = scanning_collector();
        let now = Instant::now();
        assert!(matches!(
            c.observe(&decoded(&seg.envelope(0)), now),
            ScanEvent::FileInfo { .. }
        ));
        assert_eq!(
            c.observe(&decoded(&seg.envelope(0)), now),
            ScanEvent::FileInfoRepeated
        );
        assert_eq!(c.filename(), Some("x.bin"));
        assert_eq!(c.total_chunks(), Some(2));
    }

    #[test]
    fn conflicting_file_info_is_rejected_without_state_change() {
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(
            &Frame::Decoded(Envelope::file_info("a.bin", 3).to_wire()),
            now,
        );
        c.observe(&Frame::Decoded(Envelope::chunk(1, 3, b"abc").to_wire()), now);

        let event = c.observe(
            &Frame::Decoded(Envelope::file_info("b.bin", 5).to_wire()),
            now,
        );
        assert!(matches!(event, ScanEvent::FileInfoConflict { .. }));
        assert_eq!(c.filename(), Some("a.bin"));
        assert_eq!(c.total_chunks(), Some(3));
        assert_eq!(c.received(), 1);
    }

    #[test]
    fn file_info_below_stored_index_is_rejected() {
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(&Frame::Decoded(Envelope::chunk(4, 5, b"x").to_wire()), now);
        let event = c.observe(
            &Frame::Decoded(r#"{"kind":"file","filename":"f","chunks":"2"}"#.to_string()),
            now,
        );
        assert!(matches!(event, ScanEvent::FileInfoConflict { .. }));
        // The bootstrapped total survives.
        assert_eq!(c.total_chunks(), Some(5));
    }

    #[test]
    fn chunk_with_mismatched_total_is_rejected() {
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(
            &Frame::Decoded(Envelope::file_info("f", 3).to_wire()),
            now,
        );
        let event = c.observe(&Frame::Decoded(Envelope::chunk(1, 9, b"x").to_wire()), now);
        assert!(matches!(event, ScanEvent::ChunkConflict { index: 1, .. }));
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn out_of_range_chunk_is_rejected() {
        let mut c = scanning_collector();
        let now = Instant::now();
        let event = c.observe(&Frame::Decoded(Envelope::chunk(7, 3, b"x").to_wire()), now);
        assert!(matches!(event, ScanEvent::ChunkConflict { index: 7, .. }));
        let event = c.observe(
            &Frame::Decoded(r#"{"kind":"chunk","chunk":"0","total_chunks":"3","data":"QQ=="}"#.to_string()),
            now,
        );
        assert!(matches!(event, ScanEvent::ChunkConflict { index: 0, .. }));
    }

    #[test]
    fn malformed_payloads_count_as_invalid_but_change_nothing() {
        let mut c = scanning_collector();
        let now = Instant::now();
        assert_eq!(c.observe(&Frame::Decoded("???".to_string()), now), ScanEvent::Invalid);
        assert_eq!(c.observe(&Frame::Blank, now), ScanEvent::Blank);
        assert_eq!(c.invalid(), 1);
        assert_eq!(c.received(), 0);
        assert_eq!(c.state(), SessionState::Scanning);
    }

    #[test]
    fn zero_chunk_transfer_completes_on_file_info() {
        let mut c = scanning_collector();
        let event = c.observe(
            &Frame::Decoded(Envelope::file_info("empty.bin", 0).to_wire()),
            Instant::now(),
        );
        assert_eq!(event, ScanEvent::Complete);
        assert_eq!(c.state(), SessionState::Done);
    }

    #[test]
    fn remaining_text_degrades_to_calculating() {
        let mut c = scanning_collector();
        assert_eq!(c.remaining_text(), "calculating");

        let now = Instant::now();
        let seg = Segmenter::new("f", vec![0u8; 300], 10).unwrap();
        c.observe(&decoded(&seg.envelope(0)), now);
        // One arrival: still no gap sample.
        c.observe(&decoded(&seg.envelope(1)), now);
        assert_eq!(c.remaining_text(), "calculating");

        // Second arrival two seconds later: 28 remaining chunks at one
        // gap of 2s -> 56s, still in the seconds band.
        c.observe(&decoded(&seg.envelope(2)), now + Duration::from_secs(2));
        assert_eq!(c.remaining_text(), "56s");
    }

    #[test]
    fn file_info_rescan_resets_the_estimator() {
        let seg = Segmenter::new("f", vec![0u8; 300], 10).unwrap();
        let mut c = scanning_collector();
        let now = Instant::now();
        c.observe(&decoded(&seg.envelope(0)), now);
        c.observe(&decoded(&seg.envelope(1)), now);
        c.observe(&decoded(&seg.envelope(2)), now + Duration::from_secs(2));
        assert_ne!(c.remaining_text(), "calculating");

        c.observe(&decoded(&seg.envelope(0)), now + Duration::from_secs(3));
        assert_eq!(c.remaining_text(), "calculating");
    }
}
