//! Fiscal printer frame codec
//!
//! Checksummed command framing used by fiscal receipt printers for paper
//! control and status queries.
//!
//! Frame format:
//! `PREAMBLE | LEN | SEQ | CMD | DATA... | POSTAMBLE | BCC(4) | TERMINATOR`
//!
//! Responses may carry a status block:
//! `PREAMBLE | LEN | SEQ | CMD | DATA... | SEPARATOR | STATUS(6) | POSTAMBLE | BCC(4) | TERMINATOR`
//!
//! The BCC is the 16-bit sum of LEN..=POSTAMBLE, sent as four nibbles
//! (most significant first), each offset by 0x30.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::error::{DeviceFault, ProtocolError, ProtocolResult};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub const PREAMBLE: u8 = 0x01;
pub const SEPARATOR: u8 = 0x04;
pub const POSTAMBLE: u8 = 0x05;
pub const TERMINATOR: u8 = 0x03;
pub const NAK: u8 = 0x15;
pub const SYN: u8 = 0x16;

/// Offset added to LEN and to every BCC nibble
const OFFSET: u8 = 0x20;
const BCC_NIBBLE_OFFSET: u8 = 0x30;

const SEQ_FIRST: u8 = 0x20;
const SEQ_WRAP: u8 = 0xFF;

/// Responses shorter than this cannot hold a complete frame
pub const MIN_RESPONSE_LEN: usize = 10;
pub const STATUS_LEN: usize = 6;

/// Largest DATA section that still fits the LEN byte
pub const MAX_PAYLOAD: usize = (u8::MAX - OFFSET - 3) as usize;

// Command bytes
pub const CMD_ADVANCE_PAPER: u8 = 0x2C;
pub const CMD_CUT: u8 = 0x2D;
pub const CMD_STATUS: u8 = 0x4A;

/// Paper station argument of the advance command
pub const STATION_RECEIPT: u8 = 1;

// ---------------------------------------------------------------------------
// Frame building
// ---------------------------------------------------------------------------

/// Frame builder for one protocol session
///
/// Owns the sequence counter. The counter is atomic, so the codec can be
/// shared between tasks and two frames never get the same number.
#[derive(Debug)]
pub struct FiscalCodec {
    seq: AtomicU8,
}

impl FiscalCodec {
    pub fn new() -> Self {
        Self {
            seq: AtomicU8::new(SEQ_FIRST),
        }
    }

    /// Next sequence byte (cycles 0x20..=0xFE)
    fn next_seq(&self) -> u8 {
        let prev = self.seq.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            let next = s.wrapping_add(1);
            Some(if next >= SEQ_WRAP || next < SEQ_FIRST {
                SEQ_FIRST
            } else {
                next
            })
        });
        // The closure always returns Some
        match prev {
            Ok(s) | Err(s) => s,
        }
    }

    /// Build a command frame
    pub fn build_frame(&self, command: u8, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }

        let seq = self.next_seq();
        // Length = Seq(1) + Cmd(1) + Data(N) + PostAmble(1) + 0x20 offset
        let len = OFFSET + 3 + payload.len() as u8;

        let mut frame = Vec::with_capacity(payload.len() + 10);
        frame.push(PREAMBLE);
        frame.push(len);
        frame.push(seq);
        frame.push(command);
        frame.extend_from_slice(payload);
        frame.push(POSTAMBLE);

        let bcc = checksum(&frame[1..]);
        frame.extend_from_slice(&encode_bcc(bcc));
        frame.push(TERMINATOR);
        Ok(frame)
    }

    /// Feed `lines` lines on the given paper station
    pub fn advance_paper(&self, lines: u8, station: u8) -> ProtocolResult<Vec<u8>> {
        let data = format!("{},{}", lines, station);
        self.build_frame(CMD_ADVANCE_PAPER, data.as_bytes())
    }

    pub fn cut(&self) -> ProtocolResult<Vec<u8>> {
        self.build_frame(CMD_CUT, &[])
    }

    pub fn status(&self) -> ProtocolResult<Vec<u8>> {
        self.build_frame(CMD_STATUS, &[])
    }
}

impl Default for FiscalCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// 16-bit wrapping sum
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Render a checksum as four offset nibbles
pub fn encode_bcc(sum: u16) -> [u8; 4] {
    [
        ((sum >> 12) & 0x0F) as u8 + BCC_NIBBLE_OFFSET,
        ((sum >> 8) & 0x0F) as u8 + BCC_NIBBLE_OFFSET,
        ((sum >> 4) & 0x0F) as u8 + BCC_NIBBLE_OFFSET,
        (sum & 0x0F) as u8 + BCC_NIBBLE_OFFSET,
    ]
}

/// Inverse of [`encode_bcc`]; `None` if a byte is not an offset nibble
pub fn decode_bcc(bytes: &[u8]) -> Option<u16> {
    if bytes.len() != 4 {
        return None;
    }
    bytes.iter().try_fold(0u16, |acc, &b| {
        let nibble = b.checked_sub(BCC_NIBBLE_OFFSET).filter(|n| *n <= 0x0F)?;
        Some((acc << 4) | u16::from(nibble))
    })
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Result of parsing a response frame
///
/// `valid == false` always comes with a non-empty `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub valid: bool,
    pub seq: Option<u8>,
    pub command: Option<u8>,
    pub payload: Vec<u8>,
    pub status: Option<[u8; STATUS_LEN]>,
    pub error: Option<String>,
    kind: Option<ProtocolError>,
}

impl ParsedResponse {
    fn invalid(err: ProtocolError) -> Self {
        Self {
            valid: false,
            error: Some(err.to_string()),
            kind: Some(err),
            ..Default::default()
        }
    }

    /// Convert into a `Result`, keeping the structural error
    pub fn into_result(self) -> ProtocolResult<Self> {
        match self.kind.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Decoded status block, if the response carried one
    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.status.as_ref().and_then(|s| decode_status(s).ok())
    }
}

/// Index of the postamble implied by the LEN byte
///
/// LEN counts SEQ through POSTAMBLE plus the offset, so the postamble sits
/// `LEN - 0x20` bytes after the LEN byte. `None` if LEN is below the
/// smallest frame.
fn postamble_index(len: u8) -> Option<usize> {
    let counted = len.checked_sub(OFFSET).filter(|n| *n >= 3)?;
    Some(usize::from(counted) + 1)
}

/// Parse a response frame
///
/// Frame boundaries come from the LEN byte, so DATA and status bytes may
/// hold any value. A status block is recognized when the separator sits
/// exactly `STATUS_LEN + 1` bytes before the postamble.
pub fn parse_response(bytes: &[u8]) -> ParsedResponse {
    if bytes.len() < MIN_RESPONSE_LEN {
        return ParsedResponse::invalid(ProtocolError::TooShort(bytes.len()));
    }
    if bytes[0] != PREAMBLE {
        return ParsedResponse::invalid(ProtocolError::MissingPreamble);
    }

    let postamble = match postamble_index(bytes[1]) {
        Some(p) if bytes.get(p) == Some(&POSTAMBLE) => p,
        Some(p) if p >= bytes.len() => return truncated(bytes),
        _ => return ParsedResponse::invalid(ProtocolError::MissingPostamble),
    };

    // Verify the checksum when it was delivered
    if let Some(bcc_bytes) = bytes.get(postamble + 1..postamble + 5) {
        let expected = checksum(&bytes[1..=postamble]);
        match decode_bcc(bcc_bytes) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return ParsedResponse::invalid(ProtocolError::ChecksumMismatch { expected, actual });
            }
            None => {
                return ParsedResponse::invalid(ProtocolError::Invalid(format!(
                    "malformed checksum bytes {:02X?}",
                    bcc_bytes
                )));
            }
        }
    }

    let separator = postamble
        .checked_sub(STATUS_LEN + 1)
        .filter(|&sep| sep >= 4 && bytes[sep] == SEPARATOR);

    let status = separator.map(|sep| {
        let mut s = [0u8; STATUS_LEN];
        s.copy_from_slice(&bytes[sep + 1..postamble]);
        s
    });

    let payload_end = separator.unwrap_or(postamble);
    ParsedResponse {
        valid: true,
        seq: Some(bytes[2]),
        command: Some(bytes[3]),
        payload: bytes[4..payload_end].to_vec(),
        status,
        error: None,
        kind: None,
    }
}

/// Classify a frame whose LEN points past the received bytes
fn truncated(bytes: &[u8]) -> ParsedResponse {
    let status_bytes = bytes[4..]
        .iter()
        .rposition(|&b| b == SEPARATOR)
        .map(|p| bytes.len() - (p + 4 + 1));

    match status_bytes {
        Some(n) if n < STATUS_LEN => ParsedResponse::invalid(ProtocolError::TruncatedStatus(n)),
        _ => ParsedResponse::invalid(ProtocolError::MissingPostamble),
    }
}

/// Split a receive buffer into complete frames
///
/// Leading keep-alive SYN bytes are dropped. Each frame's extent comes from
/// its LEN byte. Returns the frames found and the number of bytes consumed;
/// an incomplete trailing frame is left for the next read.
pub fn split_frames(buffer: &[u8]) -> ProtocolResult<(Vec<Vec<u8>>, usize)> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < buffer.len() {
        match buffer[pos] {
            SYN => pos += 1,
            NAK => return Err(ProtocolError::Nak),
            PREAMBLE => {
                let Some(&len) = buffer.get(pos + 1) else {
                    break;
                };
                let postamble = postamble_index(len).ok_or_else(|| {
                    ProtocolError::Invalid(format!("length byte 0x{:02X} below minimum", len))
                })?;
                // POSTAMBLE, BCC(4), TERMINATOR
                let end = pos + postamble + 5;
                if end >= buffer.len() {
                    break;
                }
                if buffer[end] != TERMINATOR {
                    return Err(ProtocolError::Invalid(format!(
                        "frame at offset {} not terminated, found 0x{:02X}",
                        pos, buffer[end]
                    )));
                }
                frames.push(buffer[pos..=end].to_vec());
                pos = end + 1;
            }
            other => {
                return Err(ProtocolError::Invalid(format!(
                    "unexpected byte 0x{:02X} outside a frame",
                    other
                )));
            }
        }
    }

    Ok((frames, pos))
}

// ---------------------------------------------------------------------------
// Device status
// ---------------------------------------------------------------------------

/// Decoded status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub general_error: bool,
    pub syntax_error: bool,
    pub invalid_command: bool,
    pub cover_open: bool,
    pub paper_out: bool,
    pub fiscal_receipt_open: bool,
    pub non_fiscal_receipt_open: bool,
}

impl DeviceStatus {
    /// Conditions an operator has to act on
    pub fn faults(&self) -> Vec<DeviceFault> {
        let mut faults = Vec::new();
        if self.paper_out {
            faults.push(DeviceFault::PaperOut);
        }
        if self.cover_open {
            faults.push(DeviceFault::CoverOpen);
        }
        if self.fiscal_receipt_open {
            faults.push(DeviceFault::FiscalReceiptOpen);
        }
        if self.non_fiscal_receipt_open {
            faults.push(DeviceFault::NonFiscalReceiptOpen);
        }
        if self.syntax_error || self.invalid_command {
            faults.push(DeviceFault::CommandRejected);
        }
        // General error is a summary bit; report it only when nothing
        // more specific explains it.
        if self.general_error && faults.is_empty() {
            faults.push(DeviceFault::GeneralError);
        }
        faults
    }

    pub fn is_ok(&self) -> bool {
        self.faults().is_empty()
    }
}

/// Decode a 6-byte status block
pub fn decode_status(status: &[u8]) -> ProtocolResult<DeviceStatus> {
    if status.len() < STATUS_LEN {
        return Err(ProtocolError::TruncatedStatus(status.len()));
    }

    Ok(DeviceStatus {
        general_error: status[0] & 0x20 != 0,
        syntax_error: status[0] & 0x01 != 0,
        invalid_command: status[0] & 0x02 != 0,
        cover_open: status[1] & 0x20 != 0,
        paper_out: status[2] & 0x01 != 0,
        fiscal_receipt_open: status[2] & 0x08 != 0,
        non_fiscal_receipt_open: status[2] & 0x20 != 0,
    })
}
