//! Manifest import: rebuilds a tape image from an unpacked directory.
//!
//! The inverse of [`crate::export`]: reads the JSON manifest, pulls region
//! payloads back in from their files (split into bulk-data packets of at
//! most [`BULK_DATA_MAX`] bytes), synthesizes the end markers that export
//! folded into their region entries, and recomputes every checksum.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::export::{Manifest, ManifestEntry};
use crate::packet::{
    BULK_DATA_MAX, DataType, FILLER_BYTE, Packet, PacketKind, PacketMeta,
};
use crate::{AudioFormat, Page, StudyBox, TAPE_VERSION, TapeAudio};

#[derive(Debug)]
pub enum ImportError {
    Io { path: PathBuf, source: io::Error },
    Json(serde_json::Error),
    UnknownEntryType(String),
    MissingValues { entry_type: String, expected: usize },
    /// A value that does not fit the field it encodes.
    BadValue { entry_type: String, value: i64 },
    UnknownAudioExtension(String),
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "unable to read {}: {source}", path.display())
            }
            Self::Json(e) => write!(f, "manifest parse error: {e}"),
            Self::UnknownEntryType(t) => write!(f, "unknown manifest entry type: {t:?}"),
            Self::MissingValues {
                entry_type,
                expected,
            } => write!(
                f,
                "manifest entry {entry_type:?} needs at least {expected} values"
            ),
            Self::BadValue { entry_type, value } => {
                write!(f, "manifest entry {entry_type:?} has out-of-range value {value}")
            }
            Self::UnknownAudioExtension(ext) => {
                write!(f, "unsupported audio format: {ext:?}")
            }
        }
    }
}

impl std::error::Error for ImportError {}

impl From<serde_json::Error> for ImportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Rebuilds a tape from a manifest. `File` and audio paths are resolved
/// relative to the manifest's directory.
pub fn import(manifest_path: &Path) -> Result<StudyBox, ImportError> {
    let raw = read_file(manifest_path)?;
    let manifest: Manifest = serde_json::from_slice(&raw)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));
    import_manifest(&manifest, base)
}

/// As [`import`], for an already-parsed manifest.
pub fn import_manifest(manifest: &Manifest, base: &Path) -> Result<StudyBox, ImportError> {
    let audio_path = resolve(base, &manifest.audio);
    let ext = audio_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let format = AudioFormat::from_extension(ext)
        .ok_or_else(|| ImportError::UnknownAudioExtension(ext.to_string()))?;
    let audio = TapeAudio {
        format,
        data: read_file(&audio_path)?,
    };

    let mut pages = Vec::new();
    for manifest_page in &manifest.pages {
        let packets = build_page_packets(&manifest_page.data, base)?;
        pages.push(Page {
            length: 0,
            audio_offset_lead_in: manifest_page.audio_offset_lead_in,
            audio_offset_data: manifest_page.audio_offset_data,
            file_offset: 0,
            data_offset: 0,
            packets,
            decode_error: None,
        });
    }
    assign_offsets(&mut pages);

    Ok(StudyBox {
        version: TAPE_VERSION,
        pages,
        audio,
    })
}

/// Fills per-page chunk lengths and file-absolute offsets from the layout
/// the serialized file will have.
fn assign_offsets(pages: &mut [Page]) {
    let mut idx = 12;
    for page in pages {
        let payload: usize = page.packets.iter().map(|p| p.meta.length).sum();
        page.length = payload + 8;
        page.file_offset = idx;
        page.data_offset = idx + 16;
        for packet in &mut page.packets {
            packet.meta.start = page.data_offset + packet.meta.offset;
        }
        idx += page.length + 8;
    }
}

/// Builds one page's packet sequence from its manifest entries, tracking
/// the decoder state each packet would be parsed in so the metadata matches
/// a subsequent decode.
fn build_page_packets(
    entries: &[ManifestEntry],
    base: &Path,
) -> Result<Vec<Packet>, ImportError> {
    let mut builder = PageBuilder {
        packets: Vec::new(),
        offset: 0,
        state: 0,
    };

    for entry in entries {
        match entry.entry_type.as_str() {
            "header" => {
                let page_number = value_u8(entry, 0)?;
                builder.push(
                    0x01,
                    PacketKind::Header {
                        page_number,
                        checksum: 0,
                    },
                );
                builder.state = 2;
            }
            "delay" => {
                let length = value_usize(entry, 0)?;
                builder.push(0x05, PacketKind::Delay { length });
                builder.state = 1;
                builder.end_marker(5, entry.reset);
            }
            "script" => {
                let bank_id = value_u8(entry, 0)?;
                let load_address_high = value_u8(entry, 1)?;
                builder.push(
                    0x02,
                    PacketKind::WorkRamLoad {
                        bank_id,
                        load_address_high,
                        checksum: 0,
                    },
                );
                builder.state = 1;
                builder.bulk_data(entry, base)?;
                builder.end_marker(DataType::Script.type_byte(), entry.reset);
            }
            "nametable" | "pattern" => {
                let data_type = if entry.entry_type == "nametable" {
                    DataType::Nametable
                } else {
                    DataType::Pattern
                };
                let arg_a = value_u8(entry, 0)?;
                let arg_b = value_u8(entry, 1)?;
                builder.push(
                    data_type.type_byte(),
                    PacketKind::MarkDataStart {
                        arg_a,
                        arg_b,
                        data_type,
                        checksum: 0,
                    },
                );
                builder.state = 1;
                builder.bulk_data(entry, base)?;
                builder.end_marker(data_type.type_byte(), entry.reset);
            }
            "padding" => {
                let length = value_usize(entry, 0)?;
                builder.push(FILLER_BYTE, PacketKind::Padding { length });
            }
            "unknown" => {
                let raw = entry
                    .values
                    .iter()
                    .map(|&v| {
                        u8::try_from(v).map_err(|_| ImportError::BadValue {
                            entry_type: entry.entry_type.clone(),
                            value: v,
                        })
                    })
                    .collect::<Result<Vec<u8>, ImportError>>()?;
                let type_byte = raw.get(1).copied().unwrap_or(0);
                builder.push(
                    type_byte,
                    PacketKind::Unknown {
                        raw,
                        notes: String::new(),
                    },
                );
            }
            other => return Err(ImportError::UnknownEntryType(other.to_string())),
        }
    }

    Ok(builder.packets)
}

struct PageBuilder {
    packets: Vec<Packet>,
    offset: usize,
    state: u8,
}

impl PageBuilder {
    fn push(&mut self, type_byte: u8, kind: PacketKind) {
        let packet = Packet::build(
            kind,
            PacketMeta {
                start: 0,
                offset: self.offset,
                length: 0,
                state: self.state,
                type_byte,
            },
        );
        self.offset += packet.meta.length;
        self.packets.push(packet);
    }

    /// Splits a region's payload file into bulk-data packets.
    fn bulk_data(&mut self, entry: &ManifestEntry, base: &Path) -> Result<(), ImportError> {
        let Some(file) = &entry.file else {
            return Ok(());
        };
        let data = read_file(&resolve(base, file))?;
        for chunk in data.chunks(BULK_DATA_MAX) {
            self.push(
                chunk.len() as u8,
                PacketKind::BulkData {
                    data: chunk.to_vec(),
                    checksum: 0,
                },
            );
        }
        Ok(())
    }

    fn end_marker(&mut self, data_type: u8, reset: bool) {
        let arg = if reset { 0xF0 } else { 0x00 } | (data_type & 0x0F);
        self.push(
            0x00,
            PacketKind::MarkDataEnd {
                arg,
                checksum: 0,
            },
        );
        self.state = if reset { 0 } else { 2 };
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ImportError> {
    fs::read(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn value_i64(entry: &ManifestEntry, index: usize) -> Result<i64, ImportError> {
    entry
        .values
        .get(index)
        .copied()
        .ok_or_else(|| ImportError::MissingValues {
            entry_type: entry.entry_type.clone(),
            expected: index + 1,
        })
}

fn value_u8(entry: &ManifestEntry, index: usize) -> Result<u8, ImportError> {
    let v = value_i64(entry, index)?;
    u8::try_from(v).map_err(|_| ImportError::BadValue {
        entry_type: entry.entry_type.clone(),
        value: v,
    })
}

fn value_usize(entry: &ManifestEntry, index: usize) -> Result<usize, ImportError> {
    let v = value_i64(entry, index)?;
    usize::try_from(v).map_err(|_| ImportError::BadValue {
        entry_type: entry.entry_type.clone(),
        value: v,
    })
}
