use crate::envelope::Envelope;
use crate::progress::ProgressHandle;
use crate::symbol::SymbolSink;

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 60;
pub const DEFAULT_INTERVAL_MS: u64 = 250;

/// Sender-side view of one file: a deterministic fixed-size partition
/// plus the envelope sequence derived from it.
///
/// Pure over its inputs; re-derive a fresh Segmenter whenever the
/// source bytes or the chunk size change (an in-progress display cycle
/// is invalid after re-chunking and must restart from chunk 1).
pub struct Segmenter {
    filename: String,
    bytes: Vec<u8>,
    chunk_size: usize,
}

impl Segmenter {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be at least 1 byte");
        }
        Ok(Self {
            filename: filename.into(),
            bytes,
            chunk_size,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn file_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn chunk_count(&self) -> u32 {
        self.bytes.len().div_ceil(self.chunk_size) as u32
    }

    /// Symbols per full cycle: the file-info envelope plus every chunk.
    pub fn frame_count(&self) -> usize {
        1 + self.chunk_count() as usize
    }

    /// Chunk `k`, 0-based: `bytes[k*size .. min((k+1)*size, len)]`. The
    /// last chunk may be short; an exact-multiple file has no empty tail.
    pub fn chunk(&self, k: u32) -> &[u8] {
        let start = k as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.bytes.len());
        &self.bytes[start..end]
    }

    pub fn file_info(&self) -> Envelope {
        Envelope::file_info(&self.filename, self.chunk_count())
    }

    /// Envelope for display slot `frame_index`: slot 0 is the file-info
    /// symbol, slot k is chunk k.
    pub fn envelope(&self, frame_index: usize) -> Envelope {
        if frame_index == 0 {
            self.file_info()
        } else {
            let index = frame_index as u32;
            Envelope::chunk(index, self.chunk_count(), self.chunk(index - 1))
        }
    }

    /// Lazy, restartable, finite envelope sequence.
    pub fn envelopes(&self) -> Envelopes<'_> {
        Envelopes {
            segmenter: self,
            next: 0,
        }
    }
}

pub struct Envelopes<'a> {
    segmenter: &'a Segmenter,
    next: usize,
}

impl Iterator for Envelopes<'_> {
    type Item = Envelope;

    fn next(&mut self) -> Option<Envelope> {
        if self.next >= self.segmenter.frame_count() {
            return None;
        }
        let env = self.segmenter.envelope(self.next);
        self.next += 1;
        Some(env)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.segmenter.frame_count() - self.next;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Envelopes<'_> {}

struct Ticker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Paced symbol emission: one envelope per tick at a configurable
/// interval.
///
/// Owns at most one ticker at a time. Changing the interval stops the
/// previous ticker before arming a new one, and the display cursor
/// survives the restart, so no slot is skipped or emitted twice. Stop
/// is immediate (the sleep is sliced) and idempotent.
pub struct Playback {
    frames: Arc<Vec<String>>,
    cursor: Arc<AtomicUsize>,
    sink: Arc<Mutex<Box<dyn SymbolSink>>>,
    progress: ProgressHandle,
    first_error: Arc<Mutex<Option<String>>>,
    interval: Duration,
    ticker: Option<Ticker>,
}

impl Playback {
    pub fn new(
        segmenter: &Segmenter,
        interval: Duration,
        sink: Box<dyn SymbolSink>,
        progress: ProgressHandle,
    ) -> Self {
        let frames = segmenter.envelopes().map(|e| e.to_wire()).collect();
        Self {
            frames: Arc::new(frames),
            cursor: Arc::new(AtomicUsize::new(0)),
            sink: Arc::new(Mutex::new(sink)),
            progress,
            first_error: Arc::new(Mutex::new(None)),
            interval,
            ticker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn emitted(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Arm the ticker; a no-op when already running.
    pub fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::clone(&self.frames);
        let cursor = Arc::clone(&self.cursor);
        let sink = Arc::clone(&self.sink);
        let progress = self.progress.clone();
        let first_error = Arc::clone(&self.first_error);
        let interval = self.interval;
        let thread_stop = Arc::clone(&stop);

        let join = thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                let idx = cursor.load(Ordering::Acquire);
                if idx >= frames.len() {
                    break;
                }
                if let Err(err) = sink.lock().unwrap().emit(idx, &frames[idx]) {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(format!("{:#}", err));
                    }
                    break;
                }
                cursor.store(idx + 1, Ordering::Release);
                progress.inc_units(1);

                if idx + 1 >= frames.len() {
                    break;
                }
                // Sliced sleep so stop takes effect promptly.
                let mut remaining = interval;
                while remaining > Duration::ZERO {
                    if thread_stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let nap = remaining.min(Duration::from_millis(25));
                    thread::sleep(nap);
                    remaining -= nap;
                }
            }
        });

        self.ticker = Some(Ticker { stop, join });
    }

    /// Halt emission; idempotent, and a no-op when never started.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop.store(true, Ordering::Relaxed);
            let _ = ticker.join.join();
        }
    }

    /// Stop and rewind to the file-info symbol for a fresh display cycle.
    pub fn reset(&mut self) {
        self.stop();
        self.cursor.store(0, Ordering::Release);
        *self.first_error.lock().unwrap() = None;
    }

    /// Re-pace emission. The previous ticker is stopped before a new one
    /// starts; never two tickers for one Playback.
    pub fn set_interval(&mut self, interval: Duration) {
        let was_running = self.ticker.is_some();
        self.stop();
        self.interval = interval;
        if was_running {
            self.start();
        }
    }

    /// Block until the current ticker finishes its run (exhaustion, stop
    /// or sink failure), surfacing the first sink error.
    pub fn wait(&mut self) -> Result<usize> {
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join.join();
        }
        if let Some(err) = self.first_error.lock().unwrap().take() {
            bail!("symbol emission failed: {}", err);
        }
        Ok(self.emitted())
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}
