//! APDU codec: build command APDUs, parse status words, and drive the
//! transparent continuation-frame protocol (`91AF`).
//!
//! An APDU is `[CLA, INS, P1, P2, Lc, <data>, Le]` (ISO/IEC 7816-4).
//! `CLA` is `0x90` for NTAG424-proprietary commands and `0x00` for ISO
//! commands (select, ISO update binary). `Lc` is the one-byte data
//! length; `Le` is `0x00` meaning "up to 256 bytes expected".

use crate::error::{Error, Result, StatusWord};

pub const CLA_PROPRIETARY: u8 = 0x90;
pub const CLA_ISO: u8 = 0x00;

/// Status word `91AF`: more data follows, send a continuation APDU.
pub const SW_ADDITIONAL_FRAME: StatusWord = 0x91AF;
/// Status word `9100`: success for proprietary (`90`-class) commands.
pub const SW_SUCCESS_PROPRIETARY: StatusWord = 0x9100;
/// Status word `9000`: success for ISO (`00`-class) commands.
pub const SW_SUCCESS_ISO: StatusWord = 0x9000;

/// The continuation APDU sent after receiving `91AF`.
pub const CONTINUATION_APDU: [u8; 5] = [CLA_PROPRIETARY, 0xAF, 0x00, 0x00, 0x00];

/// Build a command APDU. `le` is appended only when `Some`; NTAG424
/// proprietary commands always expect a trailing `Le` byte, while some
/// ISO commands (plain `SELECT`) omit it entirely.
pub fn build(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8], le: Option<u8>) -> Vec<u8> {
    assert!(data.len() <= 255, "APDU data field too long");
    let mut apdu = vec![cla, ins, p1, p2];
    if !data.is_empty() {
        apdu.push(data.len() as u8);
        apdu.extend_from_slice(data);
    }
    if let Some(le) = le {
        apdu.push(le);
    }
    apdu
}

/// Outcome class of a status word, 
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `9000`/`9100`.
    Success,
    /// `91AF` — more data, issue a continuation APDU.
    MoreData,
    /// Anything else — an error whose kind is given by the status word.
    Error,
}

pub fn classify(sw: StatusWord) -> Outcome {
    match sw {
        SW_SUCCESS_PROPRIETARY | SW_SUCCESS_ISO => Outcome::Success,
        SW_ADDITIONAL_FRAME => Outcome::MoreData,
        _ => Outcome::Error,
    }
}

/// Split a raw response buffer into `(body, status_word)`. The status
/// word is the trailing two bytes; everything before it is the body.
pub fn parse_response(raw: &[u8]) -> Result<(Vec<u8>, StatusWord)> {
    if raw.len() < 2 {
        return Err(Error::ProtocolError {
            command: "<transport>",
            sw: 0,
            detail: "response shorter than a status word".into(),
        });
    }
    let (body, sw_bytes) = raw.split_at(raw.len() - 2);
    let sw = u16::from_be_bytes([sw_bytes[0], sw_bytes[1]]);
    Ok((body.to_vec(), sw))
}

/// Transparently drive the `91AF` continuation protocol: issue `first`,
/// and for every `91AF` response issue [`CONTINUATION_APDU`], concatenating
/// body fragments until a terminal status word is returned.
///
/// Two command shapes bypass this and must not call it:
/// the second half of `AuthenticateEV2First`, where `91AF` is the
/// *expected* success signal of the mid-protocol handoff, and
/// `GetFileSettings`, whose continuation frames carry their own CMAC.
pub fn exchange_with_continuation(
    command: &'static str,
    first: &[u8],
    mut exchange: impl FnMut(&[u8]) -> Result<(Vec<u8>, StatusWord)>,
) -> Result<(Vec<u8>, StatusWord)> {
    let (mut body, mut sw) = exchange(first)?;
    while classify(sw) == Outcome::MoreData {
        let (frame, next_sw) = exchange(&CONTINUATION_APDU)?;
        body.extend_from_slice(&frame);
        sw = next_sw;
    }
    match classify(sw) {
        Outcome::Success => Ok((body, sw)),
        Outcome::MoreData => unreachable!("loop above only exits on non-MoreData"),
        Outcome::Error => Err(Error::from_status_word(command, sw)),
    }
}
