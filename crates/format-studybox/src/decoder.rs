//! Page command-stream decoder.
//!
//! Decoding is a small state machine over the page's byte buffer:
//!
//! | state | type byte | packet          | next state        |
//! |-------|-----------|-----------------|-------------------|
//! | 0     | `$01`     | header          | 2                 |
//! | 1     | `$00`     | mark-data end   | 2 (0 on reset)    |
//! | 1     | other     | bulk data       | 1                 |
//! | 2     | `$02`     | work-RAM load   | 1                 |
//! | 2     | `$03/$04` | mark-data start | 1                 |
//! | 2     | `$05`     | delay           | 1                 |
//!
//! Any other (state, type byte) pair is a hard error. A first byte that is
//! not the frame byte terminates the stream with a padding packet. State is
//! local to one `decode_packets` call; pages decode independently.

use std::fmt;

use crate::packet::{
    DataType, FILLER_BYTE, FRAME_BYTE, Packet, PacketKind, PacketMeta, checksum,
};

/// A structural decode failure. Offsets are file-absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The page buffer ended inside a packet.
    Truncated { offset: usize, state: u8 },
    /// A duplicated type byte pair did not match.
    TypeMismatch {
        offset: usize,
        first: u8,
        second: u8,
    },
    /// Header payload bytes were not `01 01 01 01`.
    BadHeaderPayload { offset: usize, bytes: [u8; 4] },
    /// The header's repeated page number bytes did not match.
    PageNumberMismatch {
        offset: usize,
        first: u8,
        second: u8,
    },
    ChecksumMismatch {
        offset: usize,
        computed: u8,
        stored: u8,
    },
    /// No handler for this (state, type byte) pair.
    UnhandledType {
        offset: usize,
        state: u8,
        type_byte: u8,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset, state } => {
                write!(f, "packet truncated at offset {offset:08X} in state {state}")
            }
            Self::TypeMismatch {
                offset,
                first,
                second,
            } => write!(
                f,
                "packet at offset {offset:08X} has mismatched type bytes: {first:02X} vs {second:02X}"
            ),
            Self::BadHeaderPayload { offset, bytes } => write!(
                f,
                "packet header at offset {offset:08X} has invalid payload: {bytes:02X?}"
            ),
            Self::PageNumberMismatch {
                offset,
                first,
                second,
            } => write!(
                f,
                "packet header at offset {offset:08X} has mismatched page numbers: {first:02X} vs {second:02X}"
            ),
            Self::ChecksumMismatch {
                offset,
                computed,
                stored,
            } => write!(
                f,
                "packet at offset {offset:08X} has bad checksum: computed {computed:02X}, stored {stored:02X}"
            ),
            Self::UnhandledType {
                offset,
                state,
                type_byte,
            } => write!(
                f,
                "packet at offset {offset:08X} in state {state} with type {type_byte:02X} isn't implemented"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes one page's packet stream. `data_offset` is the stream's
/// file-absolute position, used for offsets in packets and errors.
///
/// Returns every packet decoded before the first error, if any, so a
/// failing page still yields its valid prefix.
#[must_use]
pub fn decode_packets(data: &[u8], data_offset: usize) -> (Vec<Packet>, Option<DecodeError>) {
    Decoder {
        data,
        data_offset,
        idx: 0,
        state: 0,
        packets: Vec::new(),
    }
    .run()
}

struct Decoder<'a> {
    data: &'a [u8],
    data_offset: usize,
    idx: usize,
    state: u8,
    packets: Vec<Packet>,
}

impl Decoder<'_> {
    fn run(mut self) -> (Vec<Packet>, Option<DecodeError>) {
        while self.idx < self.data.len() {
            if self.data[self.idx] != FRAME_BYTE {
                self.padding();
                break;
            }
            let result = match self.state {
                0 => self.header(),
                1 => self.state_one(),
                _ => self.state_two(),
            };
            if let Err(e) = result {
                return (self.packets, Some(e));
            }
        }
        (self.packets, None)
    }

    fn file_offset(&self, idx: usize) -> usize {
        self.data_offset + idx
    }

    fn require(&self, len: usize) -> Result<(), DecodeError> {
        if self.idx + len > self.data.len() {
            Err(DecodeError::Truncated {
                offset: self.file_offset(self.idx),
                state: self.state,
            })
        } else {
            Ok(())
        }
    }

    /// Verifies the trailing checksum of a `len`-byte packet at the cursor
    /// and returns the stored byte.
    fn verify_checksum(&self, len: usize) -> Result<u8, DecodeError> {
        let raw = &self.data[self.idx..self.idx + len];
        let computed = checksum(&raw[..len - 1]);
        let stored = raw[len - 1];
        if computed != stored {
            return Err(DecodeError::ChecksumMismatch {
                offset: self.file_offset(self.idx),
                computed,
                stored,
            });
        }
        Ok(stored)
    }

    fn meta(&self, length: usize, type_byte: u8) -> PacketMeta {
        PacketMeta {
            start: self.file_offset(self.idx),
            offset: self.idx,
            length,
            state: self.state,
            type_byte,
        }
    }

    fn push(&mut self, kind: PacketKind, meta: PacketMeta) {
        self.packets.push(Packet { kind, meta });
        self.idx += meta.length;
    }

    /// State 0: only a header is valid.
    fn header(&mut self) -> Result<(), DecodeError> {
        self.require(8)?;
        let d = &self.data[self.idx..self.idx + 8];
        if d[1] != 0x01 {
            return Err(DecodeError::UnhandledType {
                offset: self.file_offset(self.idx),
                state: self.state,
                type_byte: d[1],
            });
        }
        if d[2..5] != [0x01, 0x01, 0x01] {
            return Err(DecodeError::BadHeaderPayload {
                offset: self.file_offset(self.idx),
                bytes: [d[1], d[2], d[3], d[4]],
            });
        }
        if d[5] != d[6] {
            return Err(DecodeError::PageNumberMismatch {
                offset: self.file_offset(self.idx),
                first: d[5],
                second: d[6],
            });
        }
        let stored = self.verify_checksum(8)?;
        let meta = self.meta(8, 0x01);
        self.push(
            PacketKind::Header {
                page_number: self.data[self.idx + 6],
                checksum: stored,
            },
            meta,
        );
        self.state = 2;
        Ok(())
    }

    /// State 1: bulk data, or `$00` for the end-of-region marker.
    fn state_one(&mut self) -> Result<(), DecodeError> {
        self.require(2)?;
        let type_byte = self.data[self.idx + 1];
        if type_byte == 0x00 {
            self.mark_data_end()
        } else {
            self.bulk_data(type_byte)
        }
    }

    fn bulk_data(&mut self, len_byte: u8) -> Result<(), DecodeError> {
        let payload_len = len_byte as usize;
        let total = payload_len + 3;
        self.require(total)?;
        let stored = self.verify_checksum(total)?;
        let data = self.data[self.idx + 2..self.idx + 2 + payload_len].to_vec();
        let meta = self.meta(total, len_byte);
        self.push(
            PacketKind::BulkData {
                data,
                checksum: stored,
            },
            meta,
        );
        Ok(())
    }

    fn mark_data_end(&mut self) -> Result<(), DecodeError> {
        self.require(4)?;
        let stored = self.verify_checksum(4)?;
        let arg = self.data[self.idx + 2];
        let reset = arg & 0xF0 == 0xF0;
        let meta = self.meta(4, 0x00);
        self.push(
            PacketKind::MarkDataEnd {
                arg,
                checksum: stored,
            },
            meta,
        );
        self.state = if reset { 0 } else { 2 };
        Ok(())
    }

    /// State 2: delay, work-RAM load, or a region start marker. All carry a
    /// duplicated type byte.
    fn state_two(&mut self) -> Result<(), DecodeError> {
        self.require(3)?;
        let t = self.data[self.idx + 1];
        if t != self.data[self.idx + 2] {
            return Err(DecodeError::TypeMismatch {
                offset: self.file_offset(self.idx),
                first: t,
                second: self.data[self.idx + 2],
            });
        }
        match t {
            0x02 => self.work_ram_load(),
            0x03 => self.mark_data_start(DataType::Nametable),
            0x04 => self.mark_data_start(DataType::Pattern),
            0x05 => self.delay(),
            other => Err(DecodeError::UnhandledType {
                offset: self.file_offset(self.idx),
                state: self.state,
                type_byte: other,
            }),
        }
    }

    fn work_ram_load(&mut self) -> Result<(), DecodeError> {
        self.require(6)?;
        let stored = self.verify_checksum(6)?;
        let meta = self.meta(6, 0x02);
        self.push(
            PacketKind::WorkRamLoad {
                bank_id: self.data[self.idx + 3],
                load_address_high: self.data[self.idx + 4],
                checksum: stored,
            },
            meta,
        );
        self.state = 1;
        Ok(())
    }

    fn mark_data_start(&mut self, data_type: DataType) -> Result<(), DecodeError> {
        self.require(6)?;
        let stored = self.verify_checksum(6)?;
        let meta = self.meta(6, data_type.type_byte());
        self.push(
            PacketKind::MarkDataStart {
                arg_a: self.data[self.idx + 3],
                arg_b: self.data[self.idx + 4],
                data_type,
                checksum: stored,
            },
            meta,
        );
        self.state = 1;
        Ok(())
    }

    fn delay(&mut self) -> Result<(), DecodeError> {
        let mut run = 0;
        while self.idx + 3 + run < self.data.len() && self.data[self.idx + 3 + run] == FILLER_BYTE {
            run += 1;
        }
        // The running XOR over `C5 05 05` plus the filler run equals the
        // frame byte only for even-length runs; the check is against that
        // constant rather than a trailing byte, and a mismatch only warns.
        if checksum(&self.data[self.idx..self.idx + 3 + run]) != FRAME_BYTE {
            eprintln!(
                "[WARN] delay packet at offset {:08X} has an odd number of 0xAA filler bytes",
                self.file_offset(self.idx)
            );
        }
        let meta = self.meta(run + 3, 0x05);
        self.push(PacketKind::Delay { length: run }, meta);
        self.state = 1;
        Ok(())
    }

    fn padding(&mut self) {
        let length = self.data.len() - self.idx;
        let meta = self.meta(length, self.data[self.idx]);
        self.push(PacketKind::Padding { length }, meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(bytes: &[u8]) -> Vec<u8> {
        let mut v = bytes.to_vec();
        v.push(checksum(&v));
        v
    }

    fn header(page: u8) -> Vec<u8> {
        sealed(&[0xC5, 0x01, 0x01, 0x01, 0x01, page, page])
    }

    #[test]
    fn end_to_end_pattern_region() {
        let mut data = header(5);
        data.extend(sealed(&[0xC5, 0x04, 0x04, 0x10, 0x20]));
        data.extend(sealed(&[0xC5, 0x03, 0xAA, 0xBB, 0xCC]));
        data.extend(sealed(&[0xC5, 0x00, 0x04]));

        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert_eq!(packets.len(), 4);
        assert!(matches!(
            packets[0].kind,
            PacketKind::Header { page_number: 5, .. }
        ));
        assert!(matches!(
            packets[1].kind,
            PacketKind::MarkDataStart {
                arg_a: 0x10,
                arg_b: 0x20,
                data_type: DataType::Pattern,
                ..
            }
        ));
        assert!(
            matches!(&packets[2].kind, PacketKind::BulkData { data, .. } if data == &[0xAA, 0xBB, 0xCC])
        );
        assert!(matches!(
            packets[3].kind,
            PacketKind::MarkDataEnd { arg: 0x04, .. }
        ));
    }

    #[test]
    fn metadata_records_offsets_and_states() {
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x02, 0x02, 0x03, 0x60]));
        let (packets, err) = decode_packets(&data, 0x1000);
        assert_eq!(err, None);
        assert_eq!(packets[0].meta.start, 0x1000);
        assert_eq!(packets[0].meta.state, 0);
        assert_eq!(packets[0].meta.length, 8);
        assert_eq!(packets[1].meta.start, 0x1008);
        assert_eq!(packets[1].meta.offset, 8);
        assert_eq!(packets[1].meta.state, 2);
        assert_eq!(packets[1].meta.type_byte, 2);
    }

    #[test]
    fn padding_terminates_stream() {
        let mut data = header(1);
        data.extend([0xAA, 0xAA, 0xAA, 0x55]);
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[1].kind, PacketKind::Padding { length: 4 }));
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut data = header(1);
        let mut wrl = sealed(&[0xC5, 0x02, 0x02, 0x03, 0x60]);
        wrl[3] ^= 0xFF; // corrupt a payload byte, keep the stored checksum
        data.extend(wrl);
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(packets.len(), 1);
        assert!(matches!(err, Some(DecodeError::ChecksumMismatch { .. })));
    }

    #[test]
    fn unhandled_state_type_pairs_fail() {
        // State 0 with a non-header type byte.
        let (_, err) = decode_packets(&sealed(&[0xC5, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00]), 0);
        assert!(matches!(
            err,
            Some(DecodeError::UnhandledType { state: 0, type_byte: 0x02, .. })
        ));

        // State 2 with an unknown type byte.
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x07, 0x07, 0x00, 0x00]));
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(packets.len(), 1);
        assert!(matches!(
            err,
            Some(DecodeError::UnhandledType { state: 2, type_byte: 0x07, .. })
        ));
    }

    #[test]
    fn mismatched_type_bytes_fail() {
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x02, 0x03, 0x00, 0x00]));
        let (_, err) = decode_packets(&data, 0);
        assert!(matches!(
            err,
            Some(DecodeError::TypeMismatch {
                first: 0x02,
                second: 0x03,
                ..
            })
        ));
    }

    #[test]
    fn mismatched_page_numbers_fail() {
        let data = sealed(&[0xC5, 0x01, 0x01, 0x01, 0x01, 0x05, 0x06]);
        let (_, err) = decode_packets(&data, 0);
        assert!(matches!(
            err,
            Some(DecodeError::PageNumberMismatch {
                first: 0x05,
                second: 0x06,
                ..
            })
        ));
    }

    #[test]
    fn truncated_packet_fails_with_offset() {
        let mut data = header(1);
        data.extend([0xC5, 0x02]);
        let (_, err) = decode_packets(&data, 0x20);
        assert_eq!(
            err,
            Some(DecodeError::Truncated {
                offset: 0x28,
                state: 2,
            })
        );
    }

    #[test]
    fn delay_then_end_marker() {
        let mut data = header(1);
        data.extend([0xC5, 0x05, 0x05, 0xAA, 0xAA, 0xAA, 0xAA]);
        data.extend(sealed(&[0xC5, 0x00, 0x05]));
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert!(matches!(packets[1].kind, PacketKind::Delay { length: 4 }));
        assert!(matches!(
            packets[2].kind,
            PacketKind::MarkDataEnd { arg: 0x05, .. }
        ));
    }

    #[test]
    fn odd_delay_run_is_accepted() {
        let mut data = header(1);
        data.extend([0xC5, 0x05, 0x05, 0xAA, 0xAA, 0xAA]);
        data.extend(sealed(&[0xC5, 0x00, 0x05]));
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert!(matches!(packets[1].kind, PacketKind::Delay { length: 3 }));
    }

    #[test]
    fn reset_flag_returns_to_state_zero() {
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x02, 0x02, 0x00, 0x60]));
        data.extend(sealed(&[0xC5, 0x00, 0xF2]));
        data.extend(header(2));
        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert_eq!(packets.len(), 4);
        assert!(matches!(
            packets[2].kind,
            PacketKind::MarkDataEnd { arg: 0xF2, .. }
        ));
        assert!(matches!(
            packets[3].kind,
            PacketKind::Header { page_number: 2, .. }
        ));
    }

    #[test]
    fn end_marker_keeps_nonstandard_high_nibble() {
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x02, 0x02, 0x03, 0x60]));
        data.extend(sealed(&[0xC5, 0x00, 0x14]));
        // A high nibble of $1 does not reset; the delay parses in state 2.
        data.extend([0xC5, 0x05, 0x05]);

        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert_eq!(packets.len(), 4);
        assert!(matches!(
            packets[2].kind,
            PacketKind::MarkDataEnd { arg: 0x14, .. }
        ));
        assert!(matches!(packets[3].kind, PacketKind::Delay { length: 0 }));

        let reencoded: Vec<u8> = packets.iter().flat_map(|p| p.raw_bytes()).collect();
        assert_eq!(reencoded, data);
    }

    #[test]
    fn bulk_payload_above_encoder_cap_decodes_whole() {
        let payload: Vec<u8> = (0..200u8).collect();
        let mut data = header(1);
        data.extend(sealed(&[0xC5, 0x02, 0x02, 0x03, 0x60]));
        let mut bulk = vec![0xC5, 200];
        bulk.extend_from_slice(&payload);
        data.extend(sealed(&bulk));

        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        assert_eq!(packets.len(), 3);
        assert!(
            matches!(&packets[2].kind, PacketKind::BulkData { data, .. } if data == &payload)
        );
        assert_eq!(packets[2].meta.length, 203);

        let reencoded: Vec<u8> = packets.iter().flat_map(|p| p.raw_bytes()).collect();
        assert_eq!(reencoded, data);
    }

    #[test]
    fn packets_reencode_to_source_bytes() {
        let mut data = header(3);
        data.extend(sealed(&[0xC5, 0x03, 0x03, 0x01, 0x02]));
        data.extend(sealed(&[0xC5, 0x02, 0x11, 0x22]));
        data.extend(sealed(&[0xC5, 0x00, 0xF3]));
        data.extend([0xAA, 0xAA]);

        let (packets, err) = decode_packets(&data, 0);
        assert_eq!(err, None);
        let reencoded: Vec<u8> = packets.iter().flat_map(|p| p.raw_bytes()).collect();
        assert_eq!(reencoded, data);
    }
}
