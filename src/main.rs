mod assembler;
mod collector;
mod envelope;
mod progress;
mod segmenter;
mod symbol;
mod util;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::HumanBytes;
use progress::{ProgressConfig, ProgressMode, ReceiveSummary, SendSummary, TransferReporter};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assembler::AssembleOutcome;
use collector::{Collector, ScanEvent, SessionState};
use segmenter::{Playback, Segmenter};
use symbol::{DirFrameSource, DirSink, Frame, FrameSource, MultiSink, SymbolSink, TermSink};

#[derive(Parser)]
#[command(
    name = "qrferry",
    version,
    about = "Air-gapped file transfer over a QR symbol stream (bytes->chunk envelopes->QR frames, and back)"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a file into chunk envelopes and emit one QR symbol per envelope
    Send {
        input_file: PathBuf,
        out_dir: PathBuf,

        /// Chunk payload size in bytes. Larger chunks mean fewer but denser
        /// symbols, which decode less reliably.
        #[arg(long, default_value_t = segmenter::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Delay between symbols in milliseconds; 0 disables pacing.
        #[arg(long, default_value_t = segmenter::DEFAULT_INTERVAL_MS)]
        interval_ms: u64,

        /// Also render each symbol as a scannable QR on the terminal.
        #[arg(long, default_value_t = false)]
        display: bool,

        /// Emit wire text only, skipping the PNG rasters.
        #[arg(long, default_value_t = false)]
        no_png: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Rebuild a file from a directory of decoded symbol frames
    Receive {
        frames_dir: PathBuf,
        out_dir: PathBuf,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Send into a temp dir, replay the frames, and verify byte identity
    Roundtrip {
        input_file: PathBuf,
        temp_dir: PathBuf,

        /// Chunk payload size in bytes.
        #[arg(long, default_value_t = segmenter::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Replay the frames in random order.
        #[arg(long, default_value_t = false)]
        shuffle: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Send {
            input_file,
            out_dir,
            chunk_size,
            interval_ms,
            display,
            no_png,
            progress,
        } => {
            let summary = run_send(
                &input_file,
                &out_dir,
                chunk_size,
                interval_ms,
                display,
                !no_png,
                ProgressConfig::new(progress),
            )?;
            print_send_summary(&summary);
        }

        Commands::Receive {
            frames_dir,
            out_dir,
            progress,
        } => {
            let source = DirFrameSource::open(&frames_dir)
                .with_context(|| format!("acquire frame source {:?}", frames_dir))?;
            let summary = run_receive(
                source,
                &frames_dir,
                &out_dir,
                ProgressConfig::new(progress),
            )?;
            print_receive_summary(&summary);
        }

        Commands::Roundtrip {
            input_file,
            temp_dir,
            chunk_size,
            shuffle,
            progress,
        } => {
            run_roundtrip(
                &input_file,
                &temp_dir,
                chunk_size,
                shuffle,
                ProgressConfig::new(progress),
            )?;
        }
    }

    Ok(())
}

fn run_send(
    input_file: &Path,
    out_dir: &Path,
    chunk_size: usize,
    interval_ms: u64,
    display: bool,
    render_png: bool,
    progress_cfg: ProgressConfig,
) -> Result<SendSummary> {
    // A failed read produces no partial frame set.
    let bytes =
        std::fs::read(input_file).with_context(|| format!("read input file {:?}", input_file))?;
    let filename = input_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file.bin".to_string());

    let seg = Segmenter::new(filename, bytes, chunk_size)?;
    let reporter = TransferReporter::new("send", seg.frame_count() as u64, progress_cfg);
    let handle = reporter.handle();
    handle.set_stage("emit symbols");
    handle.log(format!(
        "file {:?}: {} in {} chunks of {} bytes",
        seg.filename(),
        HumanBytes(seg.file_bytes()),
        seg.chunk_count(),
        seg.chunk_size(),
    ));

    let dir_sink = DirSink::create(out_dir, render_png)?;
    let sink: Box<dyn SymbolSink> = if display {
        Box::new(MultiSink::new(vec![
            Box::new(dir_sink),
            Box::new(TermSink::new(seg.frame_count())),
        ]))
    } else {
        Box::new(dir_sink)
    };

    let mut playback = Playback::new(
        &seg,
        Duration::from_millis(interval_ms),
        sink,
        handle.clone(),
    );
    playback.start();
    let symbols_emitted = playback.wait()?;

    let outcome = reporter.finish(format!(
        "emitted {} symbols into {}",
        symbols_emitted,
        out_dir.display()
    ));

    Ok(SendSummary {
        input: input_file.to_path_buf(),
        out_dir: out_dir.to_path_buf(),
        file_bytes: seg.file_bytes(),
        chunk_size,
        chunk_count: seg.chunk_count(),
        symbols_emitted,
        interval_ms,
        elapsed: outcome.elapsed,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

fn run_receive(
    mut source: impl FrameSource,
    frames_dir: &Path,
    out_dir: &Path,
    progress_cfg: ProgressConfig,
) -> Result<ReceiveSummary> {
    let reporter = TransferReporter::new("receive", 0, progress_cfg);
    let handle = reporter.handle();
    handle.set_stage("scanning");

    let mut collector = Collector::new();
    collector.begin_scan();

    loop {
        let frame = source.next_frame();
        if frame == Frame::Exhausted {
            break;
        }
        let before = collector.received();
        match collector.observe(&frame, Instant::now()) {
            ScanEvent::FileInfo {
                filename,
                total_chunks,
            } => {
                handle.set_total_units(u64::from(total_chunks));
                handle.log(format!("file {:?}: {} chunks announced", filename, total_chunks));
            }
            ScanEvent::Invalid => {
                handle.warn("symbol decoded but matched no envelope shape");
            }
            ScanEvent::FileInfoConflict { reason } => {
                handle.warn(format!("ignored conflicting file info: {}", reason));
            }
            ScanEvent::ChunkConflict { index, reason } => {
                handle.warn(format!("ignored chunk {}: {}", index, reason));
            }
            ScanEvent::Stored { index, total } => {
                if let Some(total) = total {
                    handle.set_total_units(u64::from(total));
                }
                handle.set_eta_text(collector.remaining_text());
                handle.log(format!(
                    "chunk {} stored ({} collected)",
                    index,
                    collector.received()
                ));
            }
            ScanEvent::Complete => {
                handle.set_eta_text("0s");
            }
            ScanEvent::Blank | ScanEvent::Duplicate | ScanEvent::FileInfoRepeated => {}
        }
        handle.inc_units(u64::from(collector.received() - before));

        if collector.state() == SessionState::Done {
            break;
        }
    }
    collector.stop();
    drop(source); // release the frame source

    let Some(total) = collector.total_chunks() else {
        bail!(
            "no envelopes decoded from {:?}; nothing to assemble",
            frames_dir
        );
    };
    let filename = match collector.filename() {
        Some(name) => name.to_string(),
        None => {
            handle.warn("file info never arrived; saving as \"received.bin\"");
            "received.bin".to_string()
        }
    };

    handle.set_stage("assemble");
    let assembly = match assembler::assemble(collector.store(), total, &filename)? {
        AssembleOutcome::Missing(missing) => {
            let list = missing
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            println!("Missing chunks: {}", list);
            bail!(
                "transfer incomplete: {} of {} chunks missing; rescan the listed symbols",
                missing.len(),
                total
            );
        }
        AssembleOutcome::Complete(assembly) => assembly,
    };

    let written = assembler::write_assembly(&assembly, out_dir)?;
    let outcome = reporter.finish(format!("assembled {}", written.display()));

    Ok(ReceiveSummary {
        frames_dir: frames_dir.to_path_buf(),
        output: written,
        filename,
        file_bytes: assembly.bytes.len() as u64,
        chunk_count: total,
        frames_seen: collector.frames_seen(),
        duplicates: collector.duplicates(),
        invalid: collector.invalid(),
        crc32_hex: util::crc32_hex(&assembly.bytes),
        elapsed: outcome.elapsed,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

fn run_roundtrip(
    input_file: &Path,
    temp_dir: &Path,
    chunk_size: usize,
    shuffle: bool,
    progress_cfg: ProgressConfig,
) -> Result<()> {
    let frames_dir = temp_dir.join("frames");
    let out_dir = temp_dir.join("received");

    let send_summary = run_send(
        input_file,
        &frames_dir,
        chunk_size,
        0,
        false,
        false,
        progress_cfg,
    )?;

    let mut frame_paths = util::list_frame_files(&frames_dir)?;
    if shuffle {
        frame_paths.shuffle(&mut rand::thread_rng());
    }
    let source = DirFrameSource::from_paths(frame_paths);
    let receive_summary = run_receive(source, &frames_dir, &out_dir, progress_cfg)?;

    let sent = std::fs::read(input_file)?;
    let received = std::fs::read(&receive_summary.output)?;
    if sent != received {
        bail!(
            "roundtrip mismatch: sent {} bytes (crc {}) but received {} bytes (crc {})",
            sent.len(),
            util::crc32_hex(&sent),
            received.len(),
            receive_summary.crc32_hex,
        );
    }

    println!("Roundtrip: OK");
    print_send_summary(&send_summary);
    print_receive_summary(&receive_summary);
    println!(
        "Roundtrip summary: bytes={} crc={} shuffled={}",
        HumanBytes(sent.len() as u64),
        receive_summary.crc32_hex,
        shuffle
    );
    Ok(())
}

fn print_send_summary(summary: &SendSummary) {
    println!(
        "Send summary: input={} out={} bytes={} chunk_size={} chunks={} symbols={} interval={}ms duration={} warnings={}",
        summary.input.display(),
        summary.out_dir.display(),
        HumanBytes(summary.file_bytes),
        summary.chunk_size,
        summary.chunk_count,
        summary.symbols_emitted,
        summary.interval_ms,
        progress::format_duration(summary.elapsed),
        summary.warning_count,
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_receive_summary(summary: &ReceiveSummary) {
    println!(
        "Receive summary: frames={} output={} file={} bytes={} chunks={} frames_seen={} duplicates={} invalid={} crc32={} duration={} warnings={}",
        summary.frames_dir.display(),
        summary.output.display(),
        summary.filename,
        HumanBytes(summary.file_bytes),
        summary.chunk_count,
        summary.frames_seen,
        summary.duplicates,
        summary.invalid,
        summary.crc32_hex,
        progress::format_duration(summary.elapsed),
        summary.warning_count,
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}
