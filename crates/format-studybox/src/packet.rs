//! Packet model for the page command stream.
//!
//! Every framed packet starts with the frame byte `$C5` followed by a type
//! byte; most end with an XOR checksum over everything before it. Padding is
//! the one unframed kind: a run of filler after the last meaningful packet.

/// Frame byte opening every framed packet.
pub const FRAME_BYTE: u8 = 0xC5;
/// Filler byte used by delay runs and trailing padding.
pub const FILLER_BYTE: u8 = 0xAA;
/// Largest bulk-data payload the encoder will emit per packet.
pub const BULK_DATA_MAX: usize = 128;

/// Running XOR over a byte slice.
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |sum, b| sum ^ b)
}

/// Payload kind of a data region, as carried by the region markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Script,
    Nametable,
    Pattern,
}

impl DataType {
    /// Region type from a marker's type byte.
    #[must_use]
    pub fn from_type_byte(b: u8) -> Option<Self> {
        match b {
            2 => Some(Self::Script),
            3 => Some(Self::Nametable),
            4 => Some(Self::Pattern),
            _ => None,
        }
    }

    /// Type byte used in the marker encoding.
    #[must_use]
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Script => 2,
            Self::Nametable => 3,
            Self::Pattern => 4,
        }
    }

    /// Name used in listings and the export manifest.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Nametable => "nametable",
            Self::Pattern => "pattern",
        }
    }
}

/// Decode-time metadata. Not part of the format itself; carried for
/// diagnostics and offset-accurate listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// File-absolute offset of the packet's first byte.
    pub start: usize,
    /// Offset within the page's packet stream.
    pub offset: usize,
    /// Total encoded length in bytes.
    pub length: usize,
    /// Decoder state the packet was parsed in.
    pub state: u8,
    /// Raw type byte (second byte of the encoding).
    pub type_byte: u8,
}

/// One framed unit of a page's packet stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// `C5 01 01 01 01 pp pp zz` — opens a page's command stream.
    Header { page_number: u8, checksum: u8 },
    /// `C5 05 05` followed by a run of `AA` filler bytes.
    Delay { length: usize },
    /// `C5 02 02 nn mm zz` — maps an 8KB work-RAM bank and sets the high
    /// byte of the load address. Also opens a script region.
    WorkRamLoad {
        bank_id: u8,
        load_address_high: u8,
        checksum: u8,
    },
    /// `C5 tt tt aa bb zz` — opens a typed bulk-data region.
    MarkDataStart {
        arg_a: u8,
        arg_b: u8,
        data_type: DataType,
        checksum: u8,
    },
    /// `C5 00 vv zz` — closes a region. The low nibble of `vv` names what is
    /// ending (2=script 3=nametable 4=pattern 5=delay); a high nibble of
    /// `$F` resets the decoder state machine. The byte is stored whole so
    /// markers with any other high nibble re-encode verbatim.
    MarkDataEnd { arg: u8, checksum: u8 },
    /// `C5 LL <payload> zz` — one chunk of a region's payload.
    BulkData { data: Vec<u8>, checksum: u8 },
    /// Trailing filler; consumes the rest of the page stream.
    Padding { length: usize },
    /// Recognized but unmodelled packet, preserved verbatim.
    Unknown { raw: Vec<u8>, notes: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub meta: PacketMeta,
}

impl Packet {
    /// Builds a packet from its fields, computing the trailing checksum and
    /// the encoded length. Used when constructing packets from a manifest
    /// rather than from tape bytes.
    #[must_use]
    pub fn build(kind: PacketKind, meta: PacketMeta) -> Packet {
        let mut packet = Packet { kind, meta };
        let raw = packet.raw_bytes();
        packet.meta.length = raw.len();
        if let Some(&last) = raw.last() {
            match &mut packet.kind {
                PacketKind::Header { checksum, .. }
                | PacketKind::WorkRamLoad { checksum, .. }
                | PacketKind::MarkDataStart { checksum, .. }
                | PacketKind::MarkDataEnd { checksum, .. }
                | PacketKind::BulkData { checksum, .. } => *checksum = last,
                _ => {}
            }
        }
        packet
    }

    /// Byte-exact encoding. Checksums are recomputed from the fields, never
    /// copied from the stored checksum.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        match &self.kind {
            PacketKind::Header { page_number, .. } => seal(vec![
                FRAME_BYTE,
                0x01,
                0x01,
                0x01,
                0x01,
                *page_number,
                *page_number,
            ]),
            PacketKind::Delay { length } => {
                let mut raw = vec![FRAME_BYTE, 0x05, 0x05];
                raw.resize(length + 3, FILLER_BYTE);
                raw
            }
            PacketKind::WorkRamLoad {
                bank_id,
                load_address_high,
                ..
            } => seal(vec![FRAME_BYTE, 0x02, 0x02, *bank_id, *load_address_high]),
            PacketKind::MarkDataStart {
                arg_a,
                arg_b,
                data_type,
                ..
            } => {
                let t = data_type.type_byte();
                seal(vec![FRAME_BYTE, t, t, *arg_a, *arg_b])
            }
            PacketKind::MarkDataEnd { arg, .. } => seal(vec![FRAME_BYTE, 0x00, *arg]),
            PacketKind::BulkData { data, .. } => {
                let mut raw = vec![FRAME_BYTE, data.len() as u8];
                raw.extend_from_slice(data);
                seal(raw)
            }
            PacketKind::Padding { length } => vec![FILLER_BYTE; *length],
            PacketKind::Unknown { raw, .. } => raw.clone(),
        }
    }

    /// One line of disassembly text.
    #[must_use]
    pub fn asm(&self) -> String {
        match &self.kind {
            PacketKind::Header { page_number, .. } => format!("header {page_number}"),
            PacketKind::Delay { length } => format!("delay {length}"),
            PacketKind::WorkRamLoad {
                bank_id,
                load_address_high,
                ..
            } => format!("work_ram_load ${bank_id:02X} ${load_address_high:02X}"),
            PacketKind::MarkDataStart {
                arg_a,
                arg_b,
                data_type,
                ..
            } => format!(
                "mark_datatype_start {} ${arg_a:02X} ${arg_b:02X}",
                data_type.name()
            ),
            PacketKind::MarkDataEnd { arg, .. } => {
                let tag = arg & 0x0F;
                let mut tstr = match DataType::from_type_byte(tag) {
                    Some(dt) => dt.name().to_string(),
                    None if tag == 5 => "delay".to_string(),
                    None => format!("unknown ${tag:02X}"),
                };
                if arg & 0xF0 == 0xF0 {
                    tstr.push_str(" reset_state");
                }
                format!("mark_datatype_end {tstr}")
            }
            PacketKind::BulkData { data, .. } => match (data.first(), data.last()) {
                (Some(first), Some(last)) => format!(
                    "data ${first:02X}, [...], ${last:02X} ; Length {}",
                    data.len()
                ),
                _ => "data ; Length 0".to_string(),
            },
            PacketKind::Padding { length } => format!("padding {length}"),
            PacketKind::Unknown { raw, notes } => {
                let hex: Vec<String> = raw.iter().map(|b| format!("{b:02X}")).collect();
                let notes = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" ; {notes}")
                };
                format!(
                    "unknown_state{}_type{} {}{notes}",
                    self.meta.state,
                    self.meta.type_byte,
                    hex.join(" ")
                )
            }
        }
    }

    /// Short kind name for debug listings and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match &self.kind {
            PacketKind::Header { .. } => "header",
            PacketKind::Delay { .. } => "delay",
            PacketKind::WorkRamLoad { .. } => "work_ram_load",
            PacketKind::MarkDataStart { .. } => "mark_datatype_start",
            PacketKind::MarkDataEnd { .. } => "mark_datatype_end",
            PacketKind::BulkData { .. } => "bulk_data",
            PacketKind::Padding { .. } => "padding",
            PacketKind::Unknown { .. } => "unknown",
        }
    }
}

/// Appends the XOR checksum of the bytes so far.
fn seal(mut raw: Vec<u8>) -> Vec<u8> {
    raw.push(checksum(&raw));
    raw
}
