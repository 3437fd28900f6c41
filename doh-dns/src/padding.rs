//! EDNS(0) padding for outgoing DNS queries
//!
//! Encrypted DNS still leaks the length of each message. Padding every query
//! up to a multiple of a fixed block size (RFC 7830, with the block-length
//! policy from RFC 8467) hides most of that signal.
//!
//! The padding travels as option 12 inside the OPT pseudo-record of the
//! additional section. The message is walked with `hickory-proto`'s decoder
//! just far enough to find that record; only the OPT RDATA is rewritten, the
//! rest of the message is copied byte for byte.

use std::borrow::Cow;

use hickory_proto::op::Query;
use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};

use crate::error::{Error, Result};

/// Recommended block size for padded queries
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Option code plus option length, prepended to the padding bytes
pub const OPT_HEADER_LEN: usize = 4;

/// EDNS(0) option code for PADDING
pub const PADDING_OPTION_CODE: u16 = 12;

/// Largest block size whose padding option still fits in a 16-bit length
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize - OPT_HEADER_LEN;

const ARCOUNT_POS: usize = 10;
const OPT_RR_TYPE: u16 = 41;
const OPT_UDP_PAYLOAD: u16 = 4096;

/// Number of zero bytes needed so that `message_length` plus a padding
/// option header plus the padding lands on a multiple of `block_size`.
///
/// Always in `[0, block_size)`. A block size of zero disables padding.
pub fn size_needed(message_length: usize, block_size: usize) -> usize {
    if block_size == 0 {
        return 0;
    }
    (block_size - (message_length + OPT_HEADER_LEN) % block_size) % block_size
}

/// Location of the OPT record inside a message
#[derive(Debug, Clone, Copy)]
struct OptRecord {
    /// Offset of the two-byte RDLENGTH field
    rdlength_pos: usize,
    rdata_start: usize,
    rdata_end: usize,
}

/// Pad a raw DNS query to a multiple of `block_size`.
///
/// Any existing padding option is dropped and exactly one is added back,
/// zero bytes long when the message already sits four bytes short of a
/// boundary. An OPT record is appended when the query has none. The input is
/// handed back borrowed when it was already padded this way.
pub fn apply_padding(raw: &[u8], block_size: usize) -> Result<Cow<'_, [u8]>> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(Error::Padding(format!(
            "block size {} out of range (1..={})",
            block_size, MAX_BLOCK_SIZE
        )));
    }

    let mut buf;
    let opt = match find_opt(raw)? {
        Some(opt) => {
            let options = strip_padding(&raw[opt.rdata_start..opt.rdata_end])?;
            buf = Vec::with_capacity(raw.len() + block_size);
            buf.extend_from_slice(&raw[..opt.rdata_start]);
            buf.extend_from_slice(&options);
            buf.extend_from_slice(&raw[opt.rdata_end..]);
            OptRecord {
                rdata_end: opt.rdata_start + options.len(),
                ..opt
            }
        }
        None => {
            buf = Vec::with_capacity(raw.len() + 11 + block_size);
            buf.extend_from_slice(raw);
            append_opt(&mut buf)?
        }
    };

    let padding = size_needed(buf.len(), block_size);
    let rdlength = opt.rdata_end - opt.rdata_start + OPT_HEADER_LEN + padding;
    let rdlength = u16::try_from(rdlength)
        .map_err(|_| Error::Padding(format!("OPT RDATA of {} bytes is too long", rdlength)))?;

    let mut option = Vec::with_capacity(OPT_HEADER_LEN + padding);
    option.extend_from_slice(&PADDING_OPTION_CODE.to_be_bytes());
    option.extend_from_slice(&(padding as u16).to_be_bytes());
    option.resize(OPT_HEADER_LEN + padding, 0);

    buf.splice(opt.rdata_end..opt.rdata_end, option);
    write_u16(&mut buf, opt.rdlength_pos, rdlength);

    if buf == raw {
        return Ok(Cow::Borrowed(raw));
    }

    log::trace!(
        "Padded DNS query from {} to {} bytes (block {})",
        raw.len(),
        buf.len(),
        block_size
    );
    Ok(Cow::Owned(buf))
}

fn malformed(e: impl std::fmt::Display) -> Error {
    Error::Padding(e.to_string())
}

fn read_u16(decoder: &mut BinDecoder<'_>) -> Result<u16> {
    Ok(decoder.read_u16().map_err(malformed)?.unverified())
}

/// Walk the whole message and return the OPT record of the additional
/// section, if present. Trailing bytes after the last record are rejected.
fn find_opt(msg: &[u8]) -> Result<Option<OptRecord>> {
    let mut decoder = BinDecoder::new(msg);

    // id and flags
    decoder.read_slice(4).map_err(malformed)?;
    let qdcount = read_u16(&mut decoder)?;
    let ancount = read_u16(&mut decoder)? as usize;
    let nscount = read_u16(&mut decoder)? as usize;
    let arcount = read_u16(&mut decoder)? as usize;

    for _ in 0..qdcount {
        Query::read(&mut decoder).map_err(malformed)?;
    }

    let mut opt = None;
    let additional_from = ancount + nscount;
    for index in 0..additional_from + arcount {
        Name::read(&mut decoder).map_err(malformed)?;
        let rtype = read_u16(&mut decoder)?;
        // class and TTL
        decoder.read_slice(6).map_err(malformed)?;
        let rdlength_pos = decoder.index();
        let rdlength = read_u16(&mut decoder)? as usize;
        let rdata_start = decoder.index();
        decoder.read_slice(rdlength).map_err(malformed)?;

        if rtype == OPT_RR_TYPE && index >= additional_from {
            if opt.is_some() {
                return Err(Error::Padding("message carries more than one OPT record".into()));
            }
            opt = Some(OptRecord {
                rdlength_pos,
                rdata_start,
                rdata_end: decoder.index(),
            });
        }
    }

    if !decoder.is_empty() {
        return Err(Error::Padding(format!(
            "{} trailing bytes after the last record",
            decoder.len()
        )));
    }

    Ok(opt)
}

/// Copy the OPT RDATA, dropping every PADDING option
fn strip_padding(rdata: &[u8]) -> Result<Vec<u8>> {
    let mut kept = Vec::with_capacity(rdata.len());
    let mut decoder = BinDecoder::new(rdata);
    while !decoder.is_empty() {
        let start = decoder.index();
        let code = read_u16(&mut decoder)?;
        let len = read_u16(&mut decoder)? as usize;
        decoder.read_slice(len).map_err(malformed)?;
        if code != PADDING_OPTION_CODE {
            kept.extend_from_slice(&rdata[start..decoder.index()]);
        }
    }
    Ok(kept)
}

/// Append an empty OPT record and bump ARCOUNT
fn append_opt(buf: &mut Vec<u8>) -> Result<OptRecord> {
    let arcount = u16::from_be_bytes([buf[ARCOUNT_POS], buf[ARCOUNT_POS + 1]])
        .checked_add(1)
        .ok_or_else(|| Error::Padding("additional record count overflow".into()))?;
    write_u16(buf, ARCOUNT_POS, arcount);

    buf.push(0); // root owner name
    buf.extend_from_slice(&OPT_RR_TYPE.to_be_bytes());
    buf.extend_from_slice(&OPT_UDP_PAYLOAD.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]); // extended RCODE, version, flags
    let rdlength_pos = buf.len();
    buf.extend_from_slice(&[0, 0]);

    let rdata_start = buf.len();
    Ok(OptRecord {
        rdlength_pos,
        rdata_start,
        rdata_end: rdata_start,
    })
}

fn write_u16(buf: &mut [u8], pos: usize, value: u16) {
    buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
}
