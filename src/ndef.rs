//! NDEF message construction: a single URI record whose query string
//! carries literal hex-zero placeholders for SDM to substitute live
//! values into.
//!
//! NTAG424 DNA's NDEF file (file `02`) is an ISO/IEC 7816-4 transparent
//! file holding a 2-byte big-endian length (`NLEN`) followed by the raw
//! NDEF message — not the `0x03`/`0xFE` TLV wrapper Type 2 tags use.
//! Offsets recorded here are absolute byte offsets from the start of
//! that file content, since that is exactly what `ISOUpdateBinary`
//! writes at offset zero and what `ChangeFileSettings`'s SDM offsets
//! index into.

use crate::error::{Error, Result};

const URI_IDENTIFIER_HTTPS: u8 = 0x04; // "https://"

const UID_PLACEHOLDER_LEN: usize = 14;
const CTR_PLACEHOLDER_LEN: usize = 6;
const CMAC_PLACEHOLDER_LEN: usize = 16;

/// A built NDEF file content plus the offsets SDM needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdefMessage {
    /// Full file-02 content: `NLEN` (2 bytes) followed by the NDEF
    /// message bytes.
    pub bytes: Vec<u8>,
    pub uid_offset: u32,
    pub read_counter_offset: u32,
    pub mac_input_offset: u32,
    pub mac_offset: u32,
}

/// Build the NDEF URI record for `url_template`, appending the
/// `?uid=...&ctr=...&cmac=...` placeholder query string. `url_template`
/// must start with `https://`; placeholder hex digits are lowercase `0`,
/// matching what the tag mints dynamically.
pub fn build(url_template: &str) -> Result<NdefMessage> {
    let rest = url_template.strip_prefix("https://").ok_or_else(|| {
        Error::StoreError("URL template must start with https://".into())
    })?;

    let mut url_tail = rest.to_string();
    url_tail.push_str("?uid=");
    let uid_field_start = url_tail.len();
    url_tail.push_str(&"0".repeat(UID_PLACEHOLDER_LEN));

    url_tail.push_str("&ctr=");
    let ctr_field_start = url_tail.len();
    url_tail.push_str(&"0".repeat(CTR_PLACEHOLDER_LEN));

    url_tail.push_str("&cmac=");
    let cmac_field_start = url_tail.len();
    url_tail.push_str(&"0".repeat(CMAC_PLACEHOLDER_LEN));

    // Record payload: URI identifier code + remaining URL text.
    let mut record_payload = Vec::with_capacity(1 + url_tail.len());
    record_payload.push(URI_IDENTIFIER_HTTPS);
    record_payload.extend_from_slice(url_tail.as_bytes());

    // Short record: MB|ME|SR|TNF=well-known = 0xD1, type length 1,
    // payload length 1 byte, type 'U' (URI).
    let mut record = Vec::with_capacity(3 + 1 + record_payload.len());
    record.push(0xD1);
    record.push(0x01);
    record.push(record_payload.len() as u8);
    record.push(b'U');
    record.extend_from_slice(&record_payload);

    let nlen = record.len() as u16;
    let mut file = Vec::with_capacity(2 + record.len());
    file.extend_from_slice(&nlen.to_be_bytes());
    file.extend_from_slice(&record);

    // Offset of the record header within `file`: 2 (NLEN) + 3 (record
    // header) + 1 (URI identifier byte) = 6 bytes before url_tail starts.
    let url_tail_start_in_file = 2 + 3 + 1;
    let uid_offset = (url_tail_start_in_file + uid_field_start) as u32;
    let read_counter_offset = (url_tail_start_in_file + ctr_field_start) as u32;
    let mac_offset = (url_tail_start_in_file + cmac_field_start) as u32;
    // SDM MACs the mirrored dynamic region starting at the UID mirror.
    let mac_input_offset = uid_offset;

    Ok(NdefMessage {
        bytes: file,
        uid_offset,
        read_counter_offset,
        mac_input_offset,
        mac_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_places_placeholders_at_recorded_offsets() {
        let msg = build("https://example.com/s/AK").unwrap();
        let hex_zero = |offset: u32, len: usize| -> String {
            let start = offset as usize;
            String::from_utf8(msg.bytes[start..start + len].to_vec()).unwrap()
        };
        assert_eq!(hex_zero(msg.uid_offset, 14), "0".repeat(14));
        assert_eq!(hex_zero(msg.read_counter_offset, 6), "0".repeat(6));
        assert_eq!(hex_zero(msg.mac_offset, 16), "0".repeat(16));
    }

    #[test]
    fn test_rejects_non_https() {
        assert!(build("http://example.com").is_err());
    }

    #[test]
    fn test_nlen_matches_record_length() {
        let msg = build("https://example.com/x").unwrap();
        let nlen = u16::from_be_bytes([msg.bytes[0], msg.bytes[1]]) as usize;
        assert_eq!(nlen, msg.bytes.len() - 2);
    }
}
