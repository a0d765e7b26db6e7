//! Typed commands: each owns its INS byte, header, plaintext payload,
//! response parser, and communication mode.
//!
//! Unauthenticated / `Plain` commands that need no live [`Session`] hang
//! off [`Tag`], mirroring the one-method-per-command shape of a chip
//! access layer. Commands that require secure messaging (`ChangeKey`,
//! `ChangeFileSettings`, authenticated `ReadData`/`WriteData`) hang off
//! [`Session`] instead, since their wrapping depends on session state.
//!
//! This is the closed set of commands this engine needs; anything else
//! is refused with [`Error::NotImplemented`].

use crate::apdu::{self, CLA_ISO, CLA_PROPRIETARY};
use crate::crypto;
use crate::error::{Error, Result};
use crate::session::{CommMode, Session};
use crate::transport::{self, CardTransport};

const INS_ISO_SELECT: u8 = 0xA4;
const INS_ISO_UPDATE_BINARY: u8 = 0xD6;
const INS_GET_VERSION: u8 = 0x60;
const INS_GET_KEY_VERSION: u8 = 0x64;
const INS_GET_FILE_SETTINGS: u8 = 0xF5;
const INS_CHANGE_KEY: u8 = 0xC4;
const INS_CHANGE_FILE_SETTINGS: u8 = 0x5F;
const INS_READ_DATA: u8 = 0xAD;
const INS_WRITE_DATA: u8 = 0x8D;

/// The PICC-level DESFire/NTAG424 application AID.
const PICC_APPLICATION_AID: [u8; 7] = [0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

/// Result of `GetChipVersion`: three frames concatenated into hardware
/// info, software info, and UID/production data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipVersion {
    pub hardware_info: [u8; 7],
    pub software_info: [u8; 7],
    pub uid: [u8; 7],
    pub batch_no: [u8; 5],
    pub calendar_week_prod: u8,
    pub year_prod: u8,
}

/// Result of `GetFileSettings`: public fields plus an
/// opaque SDM tail when SDM is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSettings {
    pub file_option: u8,
    pub access_rights: [u8; 2],
    pub file_size: u32,
    pub sdm_tail: Option<Vec<u8>>,
}

/// Which byte range `ChangeKey`'s CRC32 covers for non-zero key slots.
/// The datasheet's wording on this is ambiguous; [`CrcMode::NewKeyOnly`]
/// follows its literal reading and is this crate's default — see
/// DESIGN.md for the recorded decision. [`CrcMode::NewKeyAndVersion`] is
/// kept available for interoperability disputes without requiring a
/// code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcMode {
    NewKeyOnly,
    NewKeyAndVersion,
}

/// The four little-endian 3-byte offsets `ChangeFileSettings` needs to
/// point SDM at the NDEF payload's placeholder bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmOffsets {
    pub uid_offset: u32,
    pub read_counter_offset: u32,
    pub mac_input_offset: u32,
    pub mac_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFileSettingsParams {
    pub file_no: u8,
    pub file_option: u8,
    pub access_rights: [u8; 2],
    pub sdm_options: u8,
    pub sdm_access_rights: [u8; 2],
    pub offsets: SdmOffsets,
}

fn le3(v: u32) -> [u8; 3] {
    let b = v.to_le_bytes();
    [b[0], b[1], b[2]]
}

/// Unauthenticated access to a selected card: commands that are `Plain`
/// and need no session.
pub struct Tag<'t> {
    transport: &'t mut dyn CardTransport,
}

impl<'t> Tag<'t> {
    pub fn new(transport: &'t mut dyn CardTransport) -> Self {
        Self { transport }
    }

    fn exchange_plain(&mut self, command: &'static str, apdu: &[u8]) -> Result<Vec<u8>> {
        let (body, _sw) =
            apdu::exchange_with_continuation(command, apdu, |a| self.transport.exchange(a))?;
        Ok(body)
    }

    /// `00 A4 04 00 07 D2 76 00 00 85 01 01 00`. Always permitted, resets
    /// selection.
    pub fn select_picc_application(&mut self) -> Result<()> {
        let apdu = apdu::build(CLA_ISO, INS_ISO_SELECT, 0x04, 0x00, &PICC_APPLICATION_AID, Some(0x00));
        self.exchange_plain("SelectPiccApplication", &apdu)?;
        Ok(())
    }

    /// Select an elementary file by its 2-byte file identifier, e.g. the
    /// NDEF file `0xE104`, ahead of `ISOUpdateBinary`.
    pub fn iso_select_file(&mut self, fid: u16) -> Result<()> {
        let fid_bytes = fid.to_be_bytes();
        let apdu = apdu::build(CLA_ISO, INS_ISO_SELECT, 0x00, 0x0C, &fid_bytes, None);
        self.exchange_plain("ISOSelectFile", &apdu)?;
        Ok(())
    }

    /// Auto-chunked (52-byte slices) unauthenticated binary write.
    pub fn iso_update_binary(&mut self, offset: u16, data: &[u8]) -> Result<()> {
        transport::iso_update_binary_chunked(self.transport, offset, data)
    }

    /// `60`: three-frame unauthenticated read of hardware/software info
    /// and the 7-byte UID.
    pub fn get_chip_version(&mut self) -> Result<ChipVersion> {
        let apdu = apdu::build(CLA_PROPRIETARY, INS_GET_VERSION, 0x00, 0x00, &[], Some(0x00));
        let body = self.exchange_plain("GetChipVersion", &apdu)?;
        if body.len() != 28 {
            return Err(Error::ProtocolError {
                command: "GetChipVersion",
                sw: 0,
                detail: format!("expected 28-byte concatenated response, got {}", body.len()),
            });
        }
        Ok(ChipVersion {
            hardware_info: body[0..7].try_into().unwrap(),
            software_info: body[7..14].try_into().unwrap(),
            uid: body[14..21].try_into().unwrap(),
            batch_no: body[21..26].try_into().unwrap(),
            calendar_week_prod: body[26],
            year_prod: body[27],
        })
    }

    /// `64`: key version for `slot`. `0x00` is inconclusive — factory
    /// tags and freshly-provisioned tags both read `0x00` until the key
    /// is explicitly versioned.
    pub fn get_key_version(&mut self, slot: u8) -> Result<u8> {
        let apdu = apdu::build(CLA_PROPRIETARY, INS_GET_KEY_VERSION, 0x00, 0x00, &[slot], Some(0x00));
        let body = self.exchange_plain("GetKeyVersion", &apdu)?;
        body.first().copied().ok_or_else(|| Error::ProtocolError {
            command: "GetKeyVersion",
            sw: 0,
            detail: "empty response".into(),
        })
    }

    /// `F5`: public file settings, unauthenticated (valid when the
    /// file's read access is free).
    pub fn get_file_settings(&mut self, file_no: u8) -> Result<FileSettings> {
        let apdu = apdu::build(CLA_PROPRIETARY, INS_GET_FILE_SETTINGS, 0x00, 0x00, &[file_no], Some(0x00));
        let body = self.exchange_plain("GetFileSettings", &apdu)?;
        parse_file_settings(&body)
    }

    /// `AD`, `Plain` communication mode: unauthenticated read, valid
    /// when the file's read access right is free.
    pub fn read_data_plain(&mut self, file_no: u8, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut header = vec![file_no];
        header.extend_from_slice(&le3(offset));
        header.extend_from_slice(&le3(length));
        let apdu = apdu::build(CLA_PROPRIETARY, INS_READ_DATA, 0x00, 0x00, &header, Some(0x00));
        self.exchange_plain("ReadData", &apdu)
    }
}

fn parse_file_settings(body: &[u8]) -> Result<FileSettings> {
    if body.len() < 6 {
        return Err(Error::ProtocolError {
            command: "GetFileSettings",
            sw: 0,
            detail: format!("response too short: {} bytes", body.len()),
        });
    }
    let file_option = body[0];
    let access_rights = [body[1], body[2]];
    let file_size = u32::from_le_bytes([body[3], body[4], body[5], 0]);
    let sdm_tail = if body.len() > 6 {
        Some(body[6..].to_vec())
    } else {
        None
    };
    Ok(FileSettings {
        file_option,
        access_rights,
        file_size,
        sdm_tail,
    })
}

impl Session {
    /// `C4`, `Full`. Header = slot byte (clear). Plaintext layout
    /// depends on the slot:
    /// - slot 0: `new_key(16) || 0x01 || 0x80 || 0x00*14`
    /// - slots 1-4: `(new_key XOR old_key)(16) || 0x01 || crc32(..)(4) || 0x80 || 0x00*10`
    pub fn change_key(
        &mut self,
        transport: &mut dyn CardTransport,
        slot: u8,
        new_key: &[u8; 16],
        old_key: &[u8; 16],
        crc_mode: CrcMode,
    ) -> Result<()> {
        let payload = change_key_plaintext(slot, new_key, old_key, crc_mode);
        self.execute_wrapped(transport, "ChangeKey", INS_CHANGE_KEY, &[slot], &payload, CommMode::Full)?;
        Ok(())
    }

    /// `5F`, `Full`. Header is empty — the file number lives inside the
    /// encrypted payload. Encrypting the file number into the header
    /// instead was a source of `919E` errors in the system this crate
    /// replaces.
    pub fn change_file_settings(
        &mut self,
        transport: &mut dyn CardTransport,
        params: ChangeFileSettingsParams,
    ) -> Result<()> {
        let payload = change_file_settings_plaintext(&params);
        self.execute_wrapped(
            transport,
            "ChangeFileSettings",
            INS_CHANGE_FILE_SETTINGS,
            &[],
            &payload,
            CommMode::Full,
        )?;
        Ok(())
    }

    /// `AD` within an authenticated session, communication mode matching
    /// the file's configured mode.
    pub fn read_data(
        &mut self,
        transport: &mut dyn CardTransport,
        file_no: u8,
        offset: u32,
        length: u32,
        comm_mode: CommMode,
    ) -> Result<Vec<u8>> {
        let mut header = vec![file_no];
        header.extend_from_slice(&le3(offset));
        header.extend_from_slice(&le3(length));
        self.execute_wrapped(transport, "ReadData", INS_READ_DATA, &header, &[], comm_mode)
    }

    /// `8D`. Header = `file_no || offset(3 LE) || length(3 LE)`, then
    /// data; communication mode equals the file's configured mode.
    pub fn write_data(
        &mut self,
        transport: &mut dyn CardTransport,
        file_no: u8,
        offset: u32,
        data: &[u8],
        comm_mode: CommMode,
    ) -> Result<()> {
        let mut header = vec![file_no];
        header.extend_from_slice(&le3(offset));
        header.extend_from_slice(&le3(data.len() as u32));
        self.execute_wrapped(transport, "WriteData", INS_WRITE_DATA, &header, data, comm_mode)?;
        Ok(())
    }
}

fn change_key_plaintext(slot: u8, new_key: &[u8; 16], old_key: &[u8; 16], crc_mode: CrcMode) -> Vec<u8> {
    const NEW_KEY_VERSION: u8 = 0x01;
    let mut plaintext = Vec::with_capacity(32);
    if slot == 0 {
        plaintext.extend_from_slice(new_key);
        plaintext.push(NEW_KEY_VERSION);
        plaintext.push(0x80);
        plaintext.extend(std::iter::repeat(0x00).take(14));
    } else {
        let xored: Vec<u8> = new_key.iter().zip(old_key.iter()).map(|(a, b)| a ^ b).collect();
        plaintext.extend_from_slice(&xored);
        plaintext.push(NEW_KEY_VERSION);
        let crc_input: Vec<u8> = match crc_mode {
            CrcMode::NewKeyOnly => new_key.to_vec(),
            CrcMode::NewKeyAndVersion => {
                let mut v = new_key.to_vec();
                v.push(NEW_KEY_VERSION);
                v
            }
        };
        plaintext.extend_from_slice(&crypto::crc32_ieee(&crc_input));
        plaintext.push(0x80);
        plaintext.extend(std::iter::repeat(0x00).take(10));
    }
    debug_assert_eq!(plaintext.len(), 32);
    plaintext
}

fn change_file_settings_plaintext(p: &ChangeFileSettingsParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    out.push(p.file_no);
    out.push(p.file_option);
    out.extend_from_slice(&p.access_rights);
    out.push(p.sdm_options);
    out.extend_from_slice(&p.sdm_access_rights);
    out.extend_from_slice(&le3(p.offsets.uid_offset));
    out.extend_from_slice(&le3(p.offsets.read_counter_offset));
    out.extend_from_slice(&le3(p.offsets.mac_input_offset));
    out.extend_from_slice(&le3(p.offsets.mac_offset));
    out
}

/// SDM `file_option` bit layout helper: bit 6 enables SDM,
/// bits 1..0 select the file's base communication mode.
pub fn file_option(sdm_enable: bool, comm_mode: CommMode) -> u8 {
    let mode_bits = match comm_mode {
        CommMode::Plain => 0b00,
        CommMode::Mac => 0b01,
        CommMode::Full => 0b11,
    };
    let sdm_bit = if sdm_enable { 1 << 6 } else { 0 };
    sdm_bit | mode_bits
}

/// Access-rights key values: 0-4 select a key slot, `0xE` is free,
/// `0xF` is never.
pub const ACCESS_FREE: u8 = 0xE;
pub const ACCESS_NEVER: u8 = 0xF;

pub fn access_rights(read_write: u8, change: u8, read: u8, write: u8) -> [u8; 2] {
    [(read_write << 4) | change, (read << 4) | write]
}

pub fn sdm_options(uid_mirror: bool, counter_mirror: bool, ascii_encoding: bool) -> u8 {
    let mut b = 0u8;
    if uid_mirror {
        b |= 1 << 7;
    }
    if counter_mirror {
        b |= 1 << 6;
    }
    if ascii_encoding {
        b |= 1; // bit 0 MUST be set for hex-ASCII placeholders
    }
    b
}

pub fn sdm_access_rights(ctr_ret_right: u8, meta_read_right: u8, file_read_right: u8) -> [u8; 2] {
    [(0xF << 4) | ctr_ret_right, (meta_read_right << 4) | file_read_right]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_key_slot0_layout() {
        let new_key = [0xAAu8; 16];
        let old_key = [0u8; 16];
        let pt = change_key_plaintext(0, &new_key, &old_key, CrcMode::NewKeyOnly);
        assert_eq!(pt.len(), 32);
        assert_eq!(&pt[0..16], &new_key);
        assert_eq!(pt[16], 0x01);
        assert_eq!(pt[17], 0x80);
        assert!(pt[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_change_key_nonzero_slot_xors_and_crcs() {
        let new_key = [0x11u8; 16];
        let old_key = [0x22u8; 16];
        let pt = change_key_plaintext(1, &new_key, &old_key, CrcMode::NewKeyOnly);
        let expected_xor: Vec<u8> = new_key.iter().zip(old_key.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(&pt[0..16], expected_xor.as_slice());
        assert_eq!(pt[16], 0x01);
        assert_eq!(&pt[17..21], &crypto::crc32_ieee(&new_key));
        assert_eq!(pt[21], 0x80);
        assert!(pt[22..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_change_file_settings_layout_length() {
        let params = ChangeFileSettingsParams {
            file_no: 0x02,
            file_option: file_option(true, CommMode::Mac),
            access_rights: access_rights(ACCESS_FREE, 0, ACCESS_FREE, 0),
            sdm_options: sdm_options(true, true, true),
            sdm_access_rights: sdm_access_rights(ACCESS_FREE, ACCESS_FREE, ACCESS_NEVER),
            offsets: SdmOffsets {
                uid_offset: 10,
                read_counter_offset: 20,
                mac_input_offset: 30,
                mac_offset: 40,
            },
        };
        let pt = change_file_settings_plaintext(&params);
        assert_eq!(pt.len(), 19);
        assert_eq!(pt[0], 0x02);
    }

    #[test]
    fn test_parse_file_settings_without_sdm() {
        let body = [0b0000_0001u8, 0xE0, 0x00, 0x00, 0x01, 0x00];
        let parsed = parse_file_settings(&body).unwrap();
        assert_eq!(parsed.file_option, 0b0000_0001);
        assert_eq!(parsed.sdm_tail, None);
    }
}
