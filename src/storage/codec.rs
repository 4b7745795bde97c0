//! Record framing shared by the WAL and the snapshot file.
//!
//! Every record is `[4-byte checksum][4-byte length][payload]`, both header
//! fields little-endian. The checksum is XxHash32 over the payload.

use std::hash::Hasher;

use twox_hash::XxHash32;

pub(crate) const HEADER_LEN: usize = 8;

const CHECKSUM_SEED: u32 = 0;

pub(crate) fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(CHECKSUM_SEED);
    hasher.write(payload);
    hasher.finish() as u32
}

/// Wrap a payload in a checksummed, length-prefixed record.
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&checksum(payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Outcome of reading one record at a given offset.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame<'a> {
    /// A complete record whose checksum verified.
    Record { payload: &'a [u8], next: usize },
    /// Clean end of input.
    End,
    /// Header or payload cut short.
    Torn,
    /// Payload present but the checksum does not match.
    Corrupt,
}

pub(crate) fn read_frame(buf: &[u8], offset: usize) -> Frame<'_> {
    if offset == buf.len() {
        return Frame::End;
    }
    let Some(header) = buf.get(offset..offset + HEADER_LEN) else {
        return Frame::Torn;
    };
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let start = offset + HEADER_LEN;
    let Some(payload) = buf.get(start..start + len) else {
        return Frame::Torn;
    };
    if checksum(payload) != expected {
        return Frame::Corrupt;
    }
    Frame::Record {
        payload,
        next: start + len,
    }
}
