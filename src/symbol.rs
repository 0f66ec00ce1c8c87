use anyhow::{bail, Context, Result};
use image::Luma;
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util;

/// Consumes one envelope's wire text per emitted symbol.
///
/// The protocol core never touches pixels; rasterization lives behind
/// this seam.
pub trait SymbolSink: Send {
    fn emit(&mut self, frame_index: usize, wire_text: &str) -> Result<()>;
}

/// Writes each symbol into a directory as `frame_NNNN.txt` (the wire
/// text, i.e. what a real symbol decoder would yield) plus a
/// `frame_NNNN.png` QR raster.
pub struct DirSink {
    dir: PathBuf,
    render_png: bool,
}

impl DirSink {
    pub fn create(dir: &Path, render_png: bool) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create frame dir {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            render_png,
        })
    }
}

impl SymbolSink for DirSink {
    fn emit(&mut self, frame_index: usize, wire_text: &str) -> Result<()> {
        let txt_path = self.dir.join(util::frame_file_name(frame_index, "txt"));
        fs::write(&txt_path, wire_text).with_context(|| format!("write {:?}", txt_path))?;

        if self.render_png {
            let png_path = self.dir.join(util::frame_file_name(frame_index, "png"));
            let code = QrCode::with_error_correction_level(wire_text, EcLevel::L)
                .with_context(|| format!("symbol {} does not fit a QR code", frame_index))?;
            let img = code.render::<Luma<u8>>().min_dimensions(256, 256).build();
            img.save(&png_path)
                .with_context(|| format!("write {:?}", png_path))?;
        }
        Ok(())
    }
}

/// Renders each symbol as Unicode half-blocks on stdout so a phone
/// camera can scan them straight off the terminal.
pub struct TermSink {
    total: usize,
}

impl TermSink {
    pub fn new(total: usize) -> Self {
        Self { total }
    }
}

impl SymbolSink for TermSink {
    fn emit(&mut self, frame_index: usize, wire_text: &str) -> Result<()> {
        let code = QrCode::with_error_correction_level(wire_text, EcLevel::L)
            .with_context(|| format!("symbol {} does not fit a QR code", frame_index))?;
        let art = code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build();
        println!("symbol {}/{}", frame_index + 1, self.total);
        println!("{}", art);
        Ok(())
    }
}

/// Fans one emission out to several sinks, e.g. frame files plus a
/// terminal render.
pub struct MultiSink {
    sinks: Vec<Box<dyn SymbolSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn SymbolSink>>) -> Self {
        Self { sinks }
    }
}

impl SymbolSink for MultiSink {
    fn emit(&mut self, frame_index: usize, wire_text: &str) -> Result<()> {
        for sink in &mut self.sinks {
            sink.emit(frame_index, wire_text)?;
        }
        Ok(())
    }
}

/// One camera tick's worth of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A symbol was in frame and decoded to this text.
    Decoded(String),
    /// No decodable symbol this tick; not an error.
    Blank,
    /// The source has no further frames.
    Exhausted,
}

/// The camera-plus-decoder collaborator: acquisition happens at
/// construction and may fail; each tick yields one `Frame`; dropping
/// the source releases the device.
pub trait FrameSource {
    fn next_frame(&mut self) -> Frame;
}

/// Replays decoded symbol text from `.txt` files, in the given order.
pub struct DirFrameSource {
    frames: std::vec::IntoIter<PathBuf>,
}

impl DirFrameSource {
    /// Acquire the source from a frame directory; fails cleanly when the
    /// directory cannot be read, leaving the caller's session idle.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("frame source {:?} is not a readable directory", dir);
        }
        let frames = util::list_frame_files(dir)?;
        Ok(Self::from_paths(frames))
    }

    /// Replay an explicit frame order, e.g. a shuffled one.
    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            frames: paths.into_iter(),
        }
    }
}

impl FrameSource for DirFrameSource {
    fn next_frame(&mut self) -> Frame {
        match self.frames.next() {
            None => Frame::Exhausted,
            // An unreadable or non-UTF-8 entry is a tick without a
            // decodable symbol.
            Some(path) => match fs::read_to_string(&path) {
                Ok(text) => Frame::Decoded(text),
                Err(_) => Frame::Blank,
            },
        }
    }
}
