//! StudyBox tape image parser and writer.
//!
//! The StudyBox was a cassette-tape peripheral for the Famicom; a `.studybox`
//! file is a chunked dump of one tape:
//!
//! - `"STBX"` magic, u32le remaining-length, u32le version
//! - one or more `"PAGE"` chunks: u32le length, u32le audio lead-in offset,
//!   u32le audio data offset, then `length - 8` bytes of packet stream
//! - exactly one `"AUDI"` chunk: u32le length, u32le format tag
//!   (0=WAV 1=FLAC 2=OGG 3=MP3), then the raw audio payload
//!
//! Each page's packet stream is decoded by [`decoder::decode_packets`] into
//! typed [`packet::Packet`]s. A framing problem is fatal for the whole file;
//! a packet problem is recorded on the affected [`Page`] and the remaining
//! pages are still read.

pub mod decoder;
pub mod export;
pub mod import;
pub mod packet;
pub mod script;

use std::fmt;

pub use decoder::{DecodeError, decode_packets};
pub use export::export;
pub use import::{ImportError, import};
pub use packet::{BULK_DATA_MAX, DataType, Packet, PacketKind, PacketMeta, checksum};
pub use script::{Script, ScriptError, ScriptNode, disassemble};

/// File magic.
pub const MAGIC: [u8; 4] = *b"STBX";
/// Page chunk tag.
pub const PAGE_TAG: [u8; 4] = *b"PAGE";
/// Audio chunk tag.
pub const AUDIO_TAG: [u8; 4] = *b"AUDI";
/// Version field written to freshly built tape images.
pub const TAPE_VERSION: u32 = 0x100;

#[derive(Debug)]
pub enum TapeError {
    /// File ended inside the named structure.
    Truncated { offset: usize, context: &'static str },
    BadMagic([u8; 4]),
    /// The first chunk after the file header was not a PAGE chunk.
    MissingPageChunk,
    /// The chunk after the last PAGE was not the AUDI chunk.
    MissingAudioChunk([u8; 4]),
    /// A chunk's length field runs past the end of the file.
    ChunkTooLong {
        offset: usize,
        length: usize,
        remaining: usize,
    },
    UnknownAudioFormat(u32),
}

impl fmt::Display for TapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset, context } => {
                write!(f, "file truncated at {offset:08X} while reading {context}")
            }
            Self::BadMagic(tag) => write!(f, "missing STBX identifier (found {tag:02X?})"),
            Self::MissingPageChunk => write!(f, "missing PAGE chunks"),
            Self::MissingAudioChunk(tag) => {
                write!(f, "missing AUDI chunk (found {tag:02X?})")
            }
            Self::ChunkTooLong {
                offset,
                length,
                remaining,
            } => write!(
                f,
                "chunk at {offset:08X} claims {length} bytes with {remaining} remaining"
            ),
            Self::UnknownAudioFormat(tag) => write!(f, "unknown audio format: {tag}"),
        }
    }
}

impl std::error::Error for TapeError {}

/// Audio payload container format. The payload itself is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Flac,
    Ogg,
    Mp3,
}

impl AudioFormat {
    /// Format from the AUDI chunk's tag field.
    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Wav),
            1 => Some(Self::Flac),
            2 => Some(Self::Ogg),
            3 => Some(Self::Mp3),
            _ => None,
        }
    }

    /// Tag field value for the AUDI chunk.
    #[must_use]
    pub fn tag(self) -> u32 {
        match self {
            Self::Wav => 0,
            Self::Flac => 1,
            Self::Ogg => 2,
            Self::Mp3 => 3,
        }
    }

    /// File extension, with the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => ".wav",
            Self::Flac => ".flac",
            Self::Ogg => ".ogg",
            Self::Mp3 => ".mp3",
        }
    }

    /// Format inferred from a file extension (without the dot, any case).
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            "flac" => Some(Self::Flac),
            "ogg" => Some(Self::Ogg),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }
}

/// The tape's audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeAudio {
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

/// One removable page of tape data.
#[derive(Debug, Clone)]
pub struct Page {
    /// Chunk length field (audio offsets + packet stream).
    pub length: usize,
    pub audio_offset_lead_in: u32,
    pub audio_offset_data: u32,
    /// Offset of the chunk tag in the file.
    pub file_offset: usize,
    /// Offset of the packet stream in the file.
    pub data_offset: usize,
    pub packets: Vec<Packet>,
    /// Set when the packet stream failed to decode; `packets` then holds
    /// everything decoded before the failure.
    pub decode_error: Option<DecodeError>,
}

impl Page {
    /// Human-readable packet listing, one `offset: asm` line per packet.
    #[must_use]
    pub fn info_string(&self) -> String {
        let lines: Vec<String> = self
            .packets
            .iter()
            .map(|p| format!("{:08X}: {}", p.meta.start, p.asm()))
            .collect();
        lines.join("\n")
    }

    /// Serialized PAGE chunk, packets re-encoded via [`Packet::raw_bytes`].
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.audio_offset_lead_in.to_le_bytes());
        payload.extend_from_slice(&self.audio_offset_data.to_le_bytes());
        for packet in &self.packets {
            payload.extend_from_slice(&packet.raw_bytes());
        }

        let mut chunk = Vec::with_capacity(payload.len() + 8);
        chunk.extend_from_slice(&PAGE_TAG);
        chunk.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&payload);
        chunk
    }
}

/// A whole parsed tape: pages plus the audio track.
#[derive(Debug, Clone)]
pub struct StudyBox {
    pub version: u32,
    pub pages: Vec<Page>,
    pub audio: TapeAudio,
}

impl StudyBox {
    /// Parses a `.studybox` image. Framing errors fail the whole file;
    /// per-page packet errors are recorded on the page.
    pub fn from_bytes(data: &[u8]) -> Result<StudyBox, TapeError> {
        if data.len() < 16 {
            return Err(TapeError::Truncated {
                offset: data.len(),
                context: "file header",
            });
        }
        if data[0..4] != MAGIC {
            return Err(TapeError::BadMagic([data[0], data[1], data[2], data[3]]));
        }

        let version = read_u32(data, 8, "file header")?;

        let mut idx = 12;
        if tag_at(data, idx) != Some(PAGE_TAG) {
            return Err(TapeError::MissingPageChunk);
        }

        let mut pages = Vec::new();
        while tag_at(data, idx) == Some(PAGE_TAG) {
            let page = read_page(data, idx)?;
            idx += page.length + 8;
            pages.push(page);
        }

        match tag_at(data, idx) {
            Some(tag) if tag == AUDIO_TAG => {}
            Some(tag) => return Err(TapeError::MissingAudioChunk(tag)),
            None => {
                return Err(TapeError::Truncated {
                    offset: idx,
                    context: "AUDI chunk tag",
                });
            }
        }
        let audio = read_audio(data, idx + 4)?;

        Ok(StudyBox {
            version,
            pages,
            audio,
        })
    }

    /// Serializes the tape back to a `.studybox` image.
    ///
    /// The remaining-length field is written as 4 and the last 4 bytes of
    /// audio data are dropped, matching images produced by the original
    /// tooling (the audio length field still counts the full payload).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());

        for page in &self.pages {
            out.extend_from_slice(&page.raw_bytes());
        }

        out.extend_from_slice(&AUDIO_TAG);
        out.extend_from_slice(&(self.audio.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.audio.format.tag().to_le_bytes());
        let trimmed = self.audio.data.len().saturating_sub(4);
        out.extend_from_slice(&self.audio.data[..trimmed]);
        out
    }
}

fn tag_at(data: &[u8], offset: usize) -> Option<[u8; 4]> {
    data.get(offset..offset + 4)
        .map(|t| [t[0], t[1], t[2], t[3]])
}

fn read_u32(data: &[u8], offset: usize, context: &'static str) -> Result<u32, TapeError> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(TapeError::Truncated { offset, context }),
    }
}

/// Reads one PAGE chunk. `start` points at the chunk tag.
fn read_page(data: &[u8], start: usize) -> Result<Page, TapeError> {
    let length = read_u32(data, start + 4, "PAGE header")? as usize;
    let audio_offset_lead_in = read_u32(data, start + 8, "PAGE header")?;
    let audio_offset_data = read_u32(data, start + 12, "PAGE header")?;

    if length < 8 || start + 8 + length > data.len() {
        return Err(TapeError::ChunkTooLong {
            offset: start,
            length,
            remaining: data.len() - start,
        });
    }

    let data_offset = start + 16;
    let payload = &data[data_offset..start + 8 + length];
    let (packets, decode_error) = decode_packets(payload, data_offset);
    if let Some(ref e) = decode_error {
        eprintln!("==> {e}");
    }

    Ok(Page {
        length,
        audio_offset_lead_in,
        audio_offset_data,
        file_offset: start,
        data_offset,
        packets,
        decode_error,
    })
}

/// Reads the AUDI chunk body. `start` points just past the chunk tag.
fn read_audio(data: &[u8], start: usize) -> Result<TapeAudio, TapeError> {
    let length = read_u32(data, start, "AUDI header")? as usize;
    let tag = read_u32(data, start + 4, "AUDI header")?;
    let format = AudioFormat::from_tag(tag).ok_or(TapeError::UnknownAudioFormat(tag))?;

    let body = data
        .get(start + 8..start + 8 + length)
        .ok_or(TapeError::ChunkTooLong {
            offset: start - 4,
            length,
            remaining: data.len() - start,
        })?;

    Ok(TapeAudio {
        format,
        data: body.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_chunk(payload: &[u8]) -> Vec<u8> {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(b"PAGE");
        chunk.extend_from_slice(&((payload.len() + 8) as u32).to_le_bytes());
        chunk.extend_from_slice(&100u32.to_le_bytes());
        chunk.extend_from_slice(&200u32.to_le_bytes());
        chunk.extend_from_slice(payload);
        chunk
    }

    fn tape(pages: &[Vec<u8>], audio: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"STBX");
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&TAPE_VERSION.to_le_bytes());
        for page in pages {
            data.extend_from_slice(page);
        }
        data.extend_from_slice(b"AUDI");
        data.extend_from_slice(&(audio.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(audio);
        data
    }

    #[test]
    fn reject_bad_magic() {
        let mut data = tape(&[page_chunk(&[0xAA; 4])], &[0; 8]);
        data[0] = b'X';
        assert!(matches!(
            StudyBox::from_bytes(&data),
            Err(TapeError::BadMagic(_))
        ));
    }

    #[test]
    fn reject_missing_page() {
        let mut data = Vec::new();
        data.extend_from_slice(b"STBX");
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&TAPE_VERSION.to_le_bytes());
        data.extend_from_slice(b"AUDI");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            StudyBox::from_bytes(&data),
            Err(TapeError::MissingPageChunk)
        ));
    }

    #[test]
    fn reject_missing_audio() {
        let mut data = Vec::new();
        data.extend_from_slice(b"STBX");
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&TAPE_VERSION.to_le_bytes());
        data.extend_from_slice(&page_chunk(&[0xAA; 4]));
        data.extend_from_slice(b"JUNK");
        data.extend_from_slice(&[0; 8]);
        assert!(matches!(
            StudyBox::from_bytes(&data),
            Err(TapeError::MissingAudioChunk(_))
        ));
    }

    #[test]
    fn reject_oversized_page_chunk() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(b"PAGE");
        chunk.extend_from_slice(&1000u32.to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        let data = tape(&[chunk], &[0; 8]);
        assert!(matches!(
            StudyBox::from_bytes(&data),
            Err(TapeError::ChunkTooLong { .. })
        ));
    }

    #[test]
    fn read_pages_and_audio() {
        let data = tape(
            &[page_chunk(&[0xAA; 6]), page_chunk(&[0xAA; 2])],
            &[1, 2, 3, 4, 5, 6, 7, 8],
        );
        let sb = StudyBox::from_bytes(&data).expect("valid tape");
        assert_eq!(sb.version, TAPE_VERSION);
        assert_eq!(sb.pages.len(), 2);
        assert_eq!(sb.pages[0].audio_offset_lead_in, 100);
        assert_eq!(sb.pages[0].audio_offset_data, 200);
        assert_eq!(sb.audio.format, AudioFormat::Wav);
        assert_eq!(sb.audio.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // All-filler payload decodes to a single padding packet.
        assert_eq!(sb.pages[0].packets.len(), 1);
        assert!(sb.pages[0].decode_error.is_none());
    }

    #[test]
    fn page_offsets_are_file_absolute() {
        let data = tape(&[page_chunk(&[0xAA; 6])], &[0; 8]);
        let sb = StudyBox::from_bytes(&data).expect("valid tape");
        assert_eq!(sb.pages[0].file_offset, 12);
        assert_eq!(sb.pages[0].data_offset, 28);
        assert_eq!(sb.pages[0].packets[0].meta.start, 28);
    }

    #[test]
    fn write_trims_audio_tail() {
        let data = tape(&[page_chunk(&[0xAA; 4])], &[9; 12]);
        let sb = StudyBox::from_bytes(&data).expect("valid tape");
        let out = sb.to_bytes();
        let reread = StudyBox::from_bytes(&out);
        // The trimmed audio makes the AUDI length field overrun the file.
        assert!(matches!(reread, Err(TapeError::ChunkTooLong { .. })));
        // Page bytes themselves round-trip exactly.
        let page_region = &data[12..12 + sb.pages[0].length + 8];
        assert_eq!(&out[12..12 + sb.pages[0].length + 8], page_region);
    }

    #[test]
    fn audio_format_tags_and_extensions() {
        for (tag, ext) in [(0, ".wav"), (1, ".flac"), (2, ".ogg"), (3, ".mp3")] {
            let format = AudioFormat::from_tag(tag).expect("known tag");
            assert_eq!(format.tag(), tag);
            assert_eq!(format.extension(), ext);
            assert_eq!(AudioFormat::from_extension(&ext[1..]), Some(format));
        }
        assert!(AudioFormat::from_tag(4).is_none());
        assert!(AudioFormat::from_extension("aiff").is_none());
    }
}
