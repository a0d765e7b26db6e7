//! AES-128 ECB/CBC, AES-CMAC with even-index truncation, CRC32, and
//! ISO/IEC 7816-4 padding (method 2).
//!
//! These are thin wrappers over vetted crates (`aes`, `cbc`, `cmac`,
//! `crc`) rather than hand-rolled primitives. Odd-byte truncation and
//! the padding scheme are easy to get subtly wrong by hand, so they're
//! covered by fixed test vectors below rather than trusted on sight.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cipher::{BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};
use crc::{Crc, CRC_32_ISO_HDLC};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypt a single 16-byte block under AES-128 ECB. NTAG424 uses this
/// only to derive per-command IVs, never to encrypt payloads directly.
pub fn aes128_ecb_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut buf = (*block).into();
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// AES-128 CBC encryption with no padding; caller applies ISO 7816-4
/// padding first if needed. `plaintext.len()` must be a multiple of 16.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    assert_eq!(plaintext.len() % 16, 0, "CBC input must be block-aligned");
    let mut buf = plaintext.to_vec();
    let enc = Aes128CbcEnc::new(key.into(), iv.into());
    let n = buf.len();
    enc.encrypt_padded_mut::<cipher::block_padding::NoPadding>(&mut buf, n)
        .expect("block-aligned buffer cannot fail to pad")
        .to_vec()
}

/// AES-128 CBC decryption with no padding removed; caller unpads if
/// needed. `ciphertext.len()` must be a multiple of 16.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Vec<u8> {
    assert_eq!(ciphertext.len() % 16, 0, "CBC input must be block-aligned");
    let mut buf = ciphertext.to_vec();
    let dec = Aes128CbcDec::new(key.into(), iv.into());
    dec.decrypt_padded_mut::<cipher::block_padding::NoPadding>(&mut buf)
        .expect("block-aligned buffer cannot fail to unpad")
        .to_vec()
}

/// Full (untruncated) AES-CMAC over `msg` under `key`.
pub fn aes_cmac(key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key).expect("16-byte key");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Reduce a 16-byte CMAC to 8 bytes by taking the odd-indexed bytes
/// (indices 1, 3, 5, 7, 9, 11, 13, 15). This truncation is mandatory for
/// every NTAG424 CMAC field; any other scheme fails with `911E`.
pub fn truncate_even(full: &[u8; 16]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, o) in out.iter_mut().enumerate() {
        *o = full[2 * i + 1];
    }
    out
}

/// `aes_cmac` followed by `truncate_even` — the form every session-level
/// MAC in this crate actually needs.
pub fn aes_cmac_truncated(key: &[u8; 16], msg: &[u8]) -> [u8; 8] {
    truncate_even(&aes_cmac(key, msg))
}

pub fn crc32_ieee(msg: &[u8]) -> [u8; 4] {
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    crc.checksum(msg).to_le_bytes()
}

/// ISO/IEC 9797-1 padding method 2: append `0x80`, then zero bytes to the
/// next 16-byte boundary. Never use PKCS#7 here — that was the source of
/// a spec-violating bug in the system this crate replaces.
pub fn iso7816_pad(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.push(0x80);
    while out.len() % 16 != 0 {
        out.push(0x00);
    }
    out
}

/// Inverse of [`iso7816_pad`]: strip trailing zero bytes, then the
/// terminating `0x80`. Returns `None` if no `0x80` marker is found.
pub fn iso7816_unpad(data: &[u8]) -> Option<Vec<u8>> {
    let trimmed = data
        .iter()
        .rposition(|&b| b != 0x00)
        .map(|i| &data[..=i])?;
    if *trimmed.last()? != 0x80 {
        return None;
    }
    Some(trimmed[..trimmed.len() - 1].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_truncate_even_is_odd_indices() {
        let full: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let truncated = truncate_even(&full);
        assert_eq!(truncated, [0x11, 0x33, 0x55, 0x77, 0x99, 0xBB, 0xDD, 0xFF]);
    }

    #[test]
    fn test_iso7816_pad_roundtrip() {
        for len in 0..=47usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let padded = iso7816_pad(&data);
            assert_eq!(padded.len() % 16, 0);
            assert_eq!(iso7816_unpad(&padded).unwrap(), data);
        }
    }

    #[test]
    fn test_aes_cmac_deterministic() {
        let key = [0u8; 16];
        let msg = b"hello world";
        assert_eq!(aes_cmac(&key, msg), aes_cmac(&key, msg));
    }

    #[test]
    fn test_crc32_known_vector() {
        // "123456789" -> 0xCBF43926 for CRC-32/ISO-HDLC
        let out = crc32_ieee(b"123456789");
        assert_eq!(out, 0x_CBF4_3926u32.to_le_bytes());
    }

    #[test]
    fn test_ecb_encrypt_known_vector() {
        // FIPS-197 AES-128 test vector
        let key: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");
        let block: [u8; 16] = hex!("00112233445566778899aabbccddeeff");
        let ct = aes128_ecb_encrypt(&key, &block);
        assert_eq!(ct, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }
}
