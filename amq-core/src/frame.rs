// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! On-wire layout of a single queued record: `{sender_id, handler, data_len,
//! data}`, packed with no padding and no alignment between records. Native
//! endianness throughout; peers are assumed homogeneous (see the base
//! spec's endianness assumption).

use crate::error::AmqError;

/// `sizeof(unit_id)` on the wire.
const SENDER_ID_LEN: usize = 4;
/// `sizeof(pointer)` on the wire: wide enough to carry either a `HandlerId`
/// or a translated 64-bit address.
const HANDLER_LEN: usize = 8;
/// `sizeof(size)` on the wire.
const DATA_LEN_LEN: usize = 8;
/// Fixed portion of a record, before the payload.
pub const HEADER_LEN: usize = SENDER_ID_LEN + HANDLER_LEN + DATA_LEN_LEN;

/// Total on-wire length of a record carrying `data_len` payload bytes.
pub fn record_len(data_len: usize) -> usize {
    HEADER_LEN + data_len
}

/// Writes one record's header and payload into `dst`, which must be exactly
/// `record_len(data.len())` bytes.
pub fn encode(dst: &mut [u8], sender_id: u32, handler: u64, data: &[u8]) {
    debug_assert_eq!(dst.len(), record_len(data.len()));
    dst[0..4].copy_from_slice(&sender_id.to_ne_bytes());
    dst[4..12].copy_from_slice(&handler.to_ne_bytes());
    dst[12..20].copy_from_slice(&(data.len() as u64).to_ne_bytes());
    dst[20..].copy_from_slice(data);
}

/// One decoded record borrowed from a drain snapshot.
pub struct Record<'a> {
    pub sender_id: u32,
    pub handler: u64,
    pub data: &'a [u8],
}

/// Decodes a single record at the start of `buf`, returning it along with
/// the number of bytes consumed.
///
/// Returns `AmqError::Inval` if `buf` is too short to hold a full header, or
/// the header's `data_len` would read past the end of `buf` — this is the
/// drain-time corruption check from the base spec (a decoded record
/// extending beyond the observed tail aborts the drain).
pub fn decode(buf: &[u8]) -> Result<(Record<'_>, usize), AmqError> {
    if buf.len() < HEADER_LEN {
        return Err(AmqError::Inval(format!(
            "record header truncated: {} bytes available, {HEADER_LEN} required",
            buf.len()
        )));
    }

    let sender_id = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let handler = u64::from_ne_bytes(buf[4..12].try_into().unwrap());
    let data_len = u64::from_ne_bytes(buf[12..20].try_into().unwrap()) as usize;
    let total = HEADER_LEN + data_len;

    if total > buf.len() {
        return Err(AmqError::Inval(format!(
            "record of {total} bytes overruns snapshot of {} bytes",
            buf.len()
        )));
    }

    Ok((
        Record {
            sender_id,
            handler,
            data: &buf[HEADER_LEN..total],
        },
        total,
    ))
}
