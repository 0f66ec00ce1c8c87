use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

pub const KIND_FILE: &str = "file";
pub const KIND_CHUNK: &str = "chunk";

// Wire format: one JSON object per symbol, UTF-8.
//   file info: {"kind":"file","filename":<string>,"chunks":<decimal string>}
//   chunk:     {"kind":"chunk","chunk":<decimal string, 1-based>,
//               "total_chunks":<decimal string>,"data":<base64>}
// Numeric fields are written as decimal strings and accepted as either
// strings or JSON numbers; payloads without "kind" are classified by
// field set (legacy senders).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    FileInfo {
        filename: String,
        chunk_count: u32,
    },
    Chunk {
        index: u32,
        total_chunks: u32,
        data: String,
    },
}

impl Envelope {
    pub fn file_info(filename: impl Into<String>, chunk_count: u32) -> Self {
        Envelope::FileInfo {
            filename: filename.into(),
            chunk_count,
        }
    }

    pub fn chunk(index: u32, total_chunks: u32, bytes: &[u8]) -> Self {
        Envelope::Chunk {
            index,
            total_chunks,
            data: BASE64.encode(bytes),
        }
    }

    /// Canonical wire text for this envelope, consumed by the symbol encoder.
    pub fn to_wire(&self) -> String {
        let value = match self {
            Envelope::FileInfo {
                filename,
                chunk_count,
            } => json!({
                "kind": KIND_FILE,
                "filename": filename,
                "chunks": chunk_count.to_string(),
            }),
            Envelope::Chunk {
                index,
                total_chunks,
                data,
            } => json!({
                "kind": KIND_CHUNK,
                "chunk": index.to_string(),
                "total_chunks": total_chunks.to_string(),
                "data": data,
            }),
        };
        value.to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numberish {
    Int(u64),
    Text(String),
}

impl Numberish {
    fn as_u32(&self) -> Option<u32> {
        match self {
            Numberish::Int(n) => u32::try_from(*n).ok(),
            Numberish::Text(s) => s.trim().parse::<u32>().ok(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSymbol {
    kind: Option<String>,
    filename: Option<String>,
    chunks: Option<Numberish>,
    chunk: Option<Numberish>,
    total_chunks: Option<Numberish>,
    data: Option<String>,
}

/// Classify one decoded symbol. Returns `None` for anything that is not a
/// well-formed envelope: parse errors, unknown kinds, missing or
/// out-of-range fields. Callers surface an advisory and keep scanning.
pub fn classify(decoded_text: &str) -> Option<Envelope> {
    let raw: RawSymbol = serde_json::from_str(decoded_text).ok()?;

    match raw.kind.as_deref() {
        Some(KIND_FILE) => file_info_from(&raw),
        Some(KIND_CHUNK) => chunk_from(&raw),
        Some(_) => None,
        // Legacy payloads carry no discriminant; sniff the field set,
        // file-info shape first.
        None => file_info_from(&raw).or_else(|| chunk_from(&raw)),
    }
}

fn file_info_from(raw: &RawSymbol) -> Option<Envelope> {
    let filename = raw.filename.clone()?;
    let chunk_count = raw.chunks.as_ref()?.as_u32()?;
    Some(Envelope::FileInfo {
        filename,
        chunk_count,
    })
}

fn chunk_from(raw: &RawSymbol) -> Option<Envelope> {
    let index = raw.chunk.as_ref()?.as_u32()?;
    let total_chunks = raw.total_chunks.as_ref()?.as_u32()?;
    let data = raw.data.clone()?;
    Some(Envelope::Chunk {
        index,
        total_chunks,
        data,
    })
}
