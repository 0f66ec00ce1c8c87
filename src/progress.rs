use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;

/// Number of recent inter-arrival gaps averaged for the advisory ETA.
pub const ESTIMATOR_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            plain_interval: Duration::from_secs(1),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        self.mode.resolve(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

impl ProgressMode {
    fn resolve(self, stderr_is_tty: bool) -> ResolvedProgressMode {
        match self {
            ProgressMode::Auto => {
                if stderr_is_tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendSummary {
    pub input: std::path::PathBuf,
    pub out_dir: std::path::PathBuf,
    pub file_bytes: u64,
    pub chunk_size: usize,
    pub chunk_count: u32,
    pub symbols_emitted: usize,
    pub interval_ms: u64,
    pub elapsed: Duration,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReceiveSummary {
    pub frames_dir: std::path::PathBuf,
    pub output: std::path::PathBuf,
    pub filename: String,
    pub file_bytes: u64,
    pub chunk_count: u32,
    pub frames_seen: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub crc32_hex: String,
    pub elapsed: Duration,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Chunk-granular progress display for one transfer direction.
///
/// Rich mode draws an indicatif bar, plain mode emits throttled
/// `[PROGRESS]` lines on stderr, quiet emits nothing. Advisory warnings
/// are collected (bounded) and carried into the summary.
pub struct TransferReporter {
    handle: ProgressHandle,
}

#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    label: String,
    mode: ResolvedProgressMode,
    plain_interval: Duration,
    state: Mutex<ProgressState>,
    bar: Option<ProgressBar>,
}

#[derive(Debug)]
struct ProgressState {
    started: Instant,
    stage: String,
    total_units: u64,
    processed_units: u64,
    eta_text: String,
    last_plain_emit: Option<Instant>,
    warnings: Vec<String>,
    warning_count: usize,
}

impl TransferReporter {
    pub fn new(label: impl Into<String>, total_units: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();

        let bar = if mode == ResolvedProgressMode::Rich {
            let pb = ProgressBar::new(total_units.max(1));
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} | {msg}",
                )
                .expect("valid progress template"),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_message(format!("{} starting", label));
            Some(pb)
        } else {
            None
        };

        let inner = Arc::new(ProgressInner {
            label,
            mode,
            plain_interval: config.plain_interval,
            state: Mutex::new(ProgressState {
                started: Instant::now(),
                stage: "starting".to_string(),
                total_units,
                processed_units: 0,
                eta_text: format_remaining(None),
                last_plain_emit: None,
                warnings: Vec::new(),
                warning_count: 0,
            }),
            bar,
        });

        Self {
            handle: ProgressHandle { inner },
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(self, final_message: impl Into<String>) -> ProgressOutcome {
        self.handle.inner.finalize(&final_message.into())
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let mut state = self.inner.state.lock().unwrap();
        state.stage = stage.into();
        self.inner.render_locked(&mut state, true);
    }

    pub fn set_total_units(&self, total: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.total_units = total;
        if let Some(bar) = &self.inner.bar {
            bar.set_length(total.max(1));
        }
        self.inner.render_locked(&mut state, true);
    }

    pub fn inc_units(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.processed_units = state.processed_units.saturating_add(delta);
        self.inner.render_locked(&mut state, false);
    }

    /// Update the advisory remaining-time text shown next to the bar.
    pub fn set_eta_text(&self, text: impl Into<String>) {
        let mut state = self.inner.state.lock().unwrap();
        state.eta_text = text.into();
        self.inner.render_locked(&mut state, false);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.warning_count += 1;
            if state.warnings.len() >= MAX_STORED_WARNINGS {
                state.warnings.remove(0);
            }
            state.warnings.push(message.clone());
        }
        self.inner.emit_message("WARN", &message);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.inner.emit_message("INFO", &message.into());
    }
}

impl ProgressInner {
    fn render_locked(&self, state: &mut ProgressState, force: bool) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.set_position(state.processed_units);
                    bar.set_message(format!(
                        "stage={} remaining={}",
                        state.stage, state.eta_text
                    ));
                }
            }
            ResolvedProgressMode::Plain => {
                let now = Instant::now();
                let due = match state.last_plain_emit {
                    Some(last) => now.duration_since(last) >= self.plain_interval,
                    None => true,
                };
                if force || due {
                    state.last_plain_emit = Some(now);
                    let pct = if state.total_units == 0 {
                        0.0
                    } else {
                        (state.processed_units as f64 / state.total_units as f64) * 100.0
                    };
                    eprintln!(
                        "[PROGRESS] {} elapsed={} stage={} done={}/{} ({:.1}%) remaining={}",
                        self.label,
                        format_duration(state.started.elapsed()),
                        state.stage,
                        state.processed_units,
                        state.total_units,
                        pct,
                        state.eta_text,
                    );
                }
            }
        }
    }

    fn emit_message(&self, level: &str, message: &str) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[{}] {}: {}", level, self.label, message);
            }
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.println(format!("[{}] {}: {}", level, self.label, message));
                } else {
                    eprintln!("[{}] {}: {}", level, self.label, message);
                }
            }
        }
    }

    fn finalize(&self, final_message: &str) -> ProgressOutcome {
        let mut state = self.state.lock().unwrap();
        self.render_locked(&mut state, true);

        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[DONE] {}: {}", self.label, final_message);
            }
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.finish_with_message(final_message.to_string());
                }
            }
        }

        ProgressOutcome {
            elapsed: state.started.elapsed(),
            warning_count: state.warning_count,
            warnings: state.warnings.clone(),
        }
    }
}

/// Moving average of the most recent chunk inter-arrival gaps.
///
/// Feeds the advisory "time remaining" figure only; it carries no
/// protocol semantics. Before the first gap exists the estimate is
/// `None` and renders as a "calculating" placeholder.
#[derive(Debug)]
pub struct ArrivalEstimator {
    window: usize,
    gaps: VecDeque<Duration>,
    last_arrival: Option<Instant>,
}

impl Default for ArrivalEstimator {
    fn default() -> Self {
        Self::new(ESTIMATOR_WINDOW)
    }
}

impl ArrivalEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            gaps: VecDeque::new(),
            last_arrival: None,
        }
    }

    pub fn reset(&mut self) {
        self.gaps.clear();
        self.last_arrival = None;
    }

    pub fn record_arrival(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival {
            self.gaps.push_back(now.saturating_duration_since(prev));
            while self.gaps.len() > self.window {
                self.gaps.pop_front();
            }
        }
        self.last_arrival = Some(now);
    }

    pub fn average_gap(&self) -> Option<Duration> {
        if self.gaps.is_empty() {
            return None;
        }
        let total: Duration = self.gaps.iter().sum();
        Some(total / self.gaps.len() as u32)
    }

    pub fn eta(&self, remaining_chunks: u64) -> Option<Duration> {
        let gap = self.average_gap()?;
        Some(gap.saturating_mul(u32::try_from(remaining_chunks).unwrap_or(u32::MAX)))
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Render the advisory ETA in second/minute/hour bands; `None` means no
/// sample exists yet.
pub fn format_remaining(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "calculating".to_string();
    };
    let secs = eta.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
