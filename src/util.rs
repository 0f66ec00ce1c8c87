use anyhow::Result;
use crc32fast::Hasher;
use std::path::{Path, PathBuf};

pub fn crc32_hex(data: &[u8]) -> String {
    let mut h = Hasher::new();
    h.update(data);
    format!("{:08x}", h.finalize())
}

/// Frame files are named so that lexicographic order equals emission
/// order: frame 0 is the file-info symbol, frame k is chunk k.
pub fn frame_file_name(frame_index: usize, ext: &str) -> String {
    format!("frame_{:04}.{}", frame_index, ext)
}

pub fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut v = vec![];
    for entry in std::fs::read_dir(dir)? {
        let p = entry?.path();
        if p.is_file()
            && p.extension()
                .map(|e| e.to_string_lossy().to_lowercase() == "txt")
                .unwrap_or(false)
        {
            v.push(p);
        }
    }
    v.sort();
    Ok(v)
}
