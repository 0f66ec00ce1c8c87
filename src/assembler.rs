use crate::collector::ChunkStore;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleOutcome {
    Complete(Assembly),
    /// Sorted indices that never arrived. The store is untouched so
    /// scanning can resume to fill the gaps; rescanning is the only
    /// retry mechanism.
    Missing(Vec<u32>),
}

/// Rebuild the file from a store. Pure over the store contents, so
/// re-invoking on an unchanged complete store yields identical bytes.
/// Errors only when a stored payload is not valid base64.
pub fn assemble(store: &ChunkStore, total: u32, filename: &str) -> Result<AssembleOutcome> {
    let missing = store.missing(total);
    if !missing.is_empty() {
        return Ok(AssembleOutcome::Missing(missing));
    }

    // Decode per chunk, concatenating bytes in index order; equivalent
    // to decoding the payload concatenation whenever intermediate chunks
    // are unpadded, and tolerant of chunk sizes that are not multiples
    // of three.
    let mut bytes = Vec::new();
    for (slot, payload) in store.payloads_in_order().enumerate() {
        let decoded = BASE64
            .decode(payload)
            .with_context(|| format!("chunk {} payload is not valid base64", slot + 1))?;
        bytes.extend_from_slice(&decoded);
    }

    Ok(AssembleOutcome::Complete(Assembly {
        filename: filename.to_string(),
        bytes,
    }))
}

/// Deliver assembled bytes under the announced name. The filename is
/// opaque display data; it is joined to the destination directory as-is.
pub fn write_assembly(assembly: &Assembly, dest_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).with_context(|| format!("create output dir {:?}", dest_dir))?;
    let path = dest_dir.join(&assembly.filename);
    fs::write(&path, &assembly.bytes).with_context(|| format!("write {:?}", path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::segmenter::Segmenter;

    fn store_from(seg: &Segmenter, order: &[u32]) -> ChunkStore {
        let mut store = ChunkStore::new();
        for &index in order {
            match seg.envelope(index as usize) {
                Envelope::Chunk { index, data, .. } => {
                    store.insert(index, data);
                }
                Envelope::FileInfo { .. } => unreachable!(),
            }
        }
        store
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn missing_indices_are_reported_sorted() {
        let seg = Segmenter::new("x.bin", pattern(250), 50).unwrap();
        let store = store_from(&seg, &[1, 3, 4]);
        let outcome = assemble(&store, 5, "x.bin").unwrap();
        assert_eq!(outcome, AssembleOutcome::Missing(vec![2, 5]));
        // Nothing was discarded.
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn complete_store_reassembles_byte_identically() {
        let data = pattern(150);
        let seg = Segmenter::new("x.bin", data.clone(), 60).unwrap();
        let store = store_from(&seg, &[2, 3, 1]);
        match assemble(&store, 3, "x.bin").unwrap() {
            AssembleOutcome::Complete(assembly) => {
                assert_eq!(assembly.filename, "x.bin");
                assert_eq!(assembly.bytes, data);
            }
            AssembleOutcome::Missing(m) => panic!("unexpected missing {:?}", m),
        }
    }

    #[test]
    fn assembly_is_idempotent() {
        let seg = Segmenter::new("x.bin", pattern(100), 7).unwrap();
        let order: Vec<u32> = (1..=seg.chunk_count()).rev().collect();
        let store = store_from(&seg, &order);
        let first = assemble(&store, seg.chunk_count(), "x.bin").unwrap();
        let second = assemble(&store, seg.chunk_count(), "x.bin").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn roundtrip_survives_any_permutation_and_chunk_size() {
        let data = pattern(233);
        for chunk_size in [1usize, 7, 60, 233, 500] {
            let seg = Segmenter::new("x.bin", data.clone(), chunk_size).unwrap();
            let n = seg.chunk_count();

            // Forward, reverse, and a rotated order.
            let forward: Vec<u32> = (1..=n).collect();
            let reverse: Vec<u32> = (1..=n).rev().collect();
            let rotated: Vec<u32> = forward
                .iter()
                .cycle()
                .skip(n as usize / 2)
                .take(n as usize)
                .copied()
                .collect();

            for order in [forward, reverse, rotated] {
                let store = store_from(&seg, &order);
                match assemble(&store, n, "x.bin").unwrap() {
                    AssembleOutcome::Complete(assembly) => assert_eq!(
                        assembly.bytes, data,
                        "chunk_size={} order mattered",
                        chunk_size
                    ),
                    AssembleOutcome::Missing(m) => panic!("missing {:?}", m),
                }
            }
        }
    }

    #[test]
    fn zero_chunk_store_assembles_to_empty_file() {
        let store = ChunkStore::new();
        match assemble(&store, 0, "empty.bin").unwrap() {
            AssembleOutcome::Complete(assembly) => assert!(assembly.bytes.is_empty()),
            AssembleOutcome::Missing(m) => panic!("missing {:?}", m),
        }
    }

    #[test]
    fn corrupt_payload_surfaces_an_error() {
        let mut store = ChunkStore::new();
        store.insert(1, "@@not-base64@@".to_string());
        let err = assemble(&store, 1, "x.bin").unwrap_err();
        assert!(format!("{err:#}").contains("chunk 1"));
    }

    #[test]
    fn write_assembly_delivers_under_announced_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let assembly = Assembly {
            filename: "out.bin".to_string(),
            bytes: vec![1, 2, 3],
        };
        let path = write_assembly(&assembly, tmp.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "out.bin");
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3]);
    }
}
