//! Tape export: region reassembly and the unpacked directory writer.
//!
//! Reassembly walks a page's packets in order, accumulating bulk-data
//! payloads between a region opener (`MarkDataStart`, or `WorkRamLoad` for
//! script regions) and its `MarkDataEnd`. The export writer turns the
//! result into a directory of listings and payload blobs plus a JSON
//! manifest compatible with the original tooling's schema.

use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::packet::{DataType, Packet, PacketKind};
use crate::{StudyBox, script};

/// Top-level JSON manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub version: u32,
    /// Output `.studybox` filename; defaults to the manifest's name when
    /// empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    /// Path to the audio file.
    pub audio: String,
    pub pages: Vec<ManifestPage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestPage {
    pub audio_offset_lead_in: u32,
    pub audio_offset_data: u32,
    pub data: Vec<ManifestEntry>,
}

/// One manifest entry: a scalar packet, or a reassembled region with its
/// payload file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    #[serde(rename = "Type")]
    pub entry_type: String,
    pub values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !b
}

impl ManifestEntry {
    fn new(entry_type: &str, values: Vec<i64>) -> ManifestEntry {
        ManifestEntry {
            entry_type: entry_type.to_string(),
            values,
            file: None,
            reset: false,
        }
    }
}

/// A reassembled payload region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Packet index of the region's opener, used in output filenames.
    pub start_id: usize,
    pub kind: DataType,
    pub data: Vec<u8>,
    /// Index of the region's entry in the page's manifest entries.
    pub entry_index: usize,
}

/// Manifest entries plus payload regions for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageExport {
    pub entries: Vec<ManifestEntry>,
    pub regions: Vec<Region>,
}

/// Reassembles one page's packet sequence into manifest entries and region
/// payloads. Pure; does no I/O.
#[must_use]
pub fn reassemble_page(page_index: usize, packets: &[Packet]) -> PageExport {
    let mut entries: Vec<ManifestEntry> = Vec::new();
    let mut regions: Vec<Region> = Vec::new();

    // Entry under construction: delays and region openers stay pending
    // until their MarkDataEnd commits them (contributing the reset flag).
    let mut pending = ManifestEntry::default();
    let mut open: Option<DataType> = None;
    let mut start_id = 0;
    let mut buf: Vec<u8> = Vec::new();

    for (i, packet) in packets.iter().enumerate() {
        match &packet.kind {
            PacketKind::Header { page_number, .. } => {
                entries.push(ManifestEntry::new("header", vec![i64::from(*page_number)]));
            }
            PacketKind::Delay { length } => {
                pending = ManifestEntry::new("delay", vec![*length as i64]);
            }
            PacketKind::WorkRamLoad {
                bank_id,
                load_address_high,
                ..
            } => {
                pending = ManifestEntry::new(
                    DataType::Script.name(),
                    vec![i64::from(*bank_id), i64::from(*load_address_high)],
                );
                open = Some(DataType::Script);
                start_id = i;
                buf.clear();
            }
            PacketKind::MarkDataStart {
                arg_a,
                arg_b,
                data_type,
                ..
            } => {
                pending = ManifestEntry::new(
                    data_type.name(),
                    vec![i64::from(*arg_a), i64::from(*arg_b)],
                );
                open = Some(*data_type);
                start_id = i;
                buf.clear();
            }
            PacketKind::BulkData { data, .. } => {
                if open.is_some() {
                    buf.extend_from_slice(data);
                }
            }
            PacketKind::MarkDataEnd { arg, .. } => {
                pending.reset = arg & 0xF0 == 0xF0;
                match open.take() {
                    Some(kind) if buf.is_empty() => {
                        eprintln!(
                            "[WARN] no {} data at page {page_index}, start id {start_id}",
                            kind.name()
                        );
                        entries.push(mem::take(&mut pending));
                    }
                    Some(kind) => {
                        let entry_index = entries.len();
                        entries.push(mem::take(&mut pending));
                        regions.push(Region {
                            start_id,
                            kind,
                            data: mem::take(&mut buf),
                            entry_index,
                        });
                    }
                    // Delay regions and stray end markers carry no payload.
                    None => entries.push(mem::take(&mut pending)),
                }
            }
            PacketKind::Padding { length } => {
                entries.push(ManifestEntry::new("padding", vec![*length as i64]));
            }
            PacketKind::Unknown { raw, .. } => {
                entries.push(ManifestEntry::new(
                    "unknown",
                    raw.iter().map(|&b| i64::from(b)).collect(),
                ));
            }
        }
    }

    PageExport { entries, regions }
}

#[derive(Debug)]
pub enum ExportError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "export I/O error: {e}"),
            Self::Json(e) => write!(f, "export manifest error: {e}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<io::Error> for ExportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Unpacks a tape into `directory`: per-page listings, region payload
/// blobs, script disassemblies, the audio file, and a `<directory>.json`
/// manifest next to it.
///
/// A script region that fails to disassemble logs a warning; its payload
/// blob is still written and the rest of the page is unaffected.
pub fn export(sb: &StudyBox, directory: &Path) -> Result<(), ExportError> {
    fs::create_dir_all(directory)?;
    let dir = directory.display();

    let mut manifest = Manifest {
        version: 1,
        filename: String::new(),
        audio: format!("{dir}/audio{}", sb.audio.format.extension()),
        pages: Vec::new(),
    };

    for (pidx, page) in sb.pages.iter().enumerate() {
        let listing = directory.join(format!("Page_{pidx:02}.txt"));
        fs::write(listing, page.info_string() + "\n")?;

        let mut page_export = reassemble_page(pidx, &page.packets);
        for region in &page_export.regions {
            let file = match region.kind {
                DataType::Pattern => {
                    format!("{dir}/chrData_page{pidx:02}_{:04}.chr", region.start_id)
                }
                DataType::Nametable => {
                    format!("{dir}/ntData_page{pidx:02}_{:04}.dat", region.start_id)
                }
                DataType::Script => {
                    format!("{dir}/scriptData_page{pidx:02}_{:04}.dat", region.start_id)
                }
            };
            fs::write(&file, &region.data)?;

            if region.kind == DataType::Script {
                match script::disassemble(&region.data) {
                    Ok(s) => {
                        let path =
                            directory.join(format!("script_page{pidx:02}_{:04}.txt", region.start_id));
                        s.write_to_file(&path)?;
                    }
                    Err(e) => eprintln!(
                        "[WARN] script at page {pidx}, start id {}: {e}",
                        region.start_id
                    ),
                }
            }

            page_export.entries[region.entry_index].file = Some(file);
        }

        manifest.pages.push(ManifestPage {
            audio_offset_lead_in: page.audio_offset_lead_in,
            audio_offset_data: page.audio_offset_data,
            data: page_export.entries,
        });
    }

    let audio_path = directory.join(format!("audio{}", sb.audio.format.extension()));
    fs::write(audio_path, &sb.audio.data)?;

    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(format!("{dir}.json"), json)?;
    Ok(())
}
