//! Drives the two-pass `AuthenticateEV2First` challenge-response and
//! yields a [`Session`] bound to a specific key slot.

use rand::RngCore;

use crate::apdu::{self, CLA_PROPRIETARY};
use crate::crypto;
use crate::error::{Error, Result};
use crate::session::{self, Session};
use crate::transport::CardTransport;

const INS_AUTHENTICATE: u8 = 0x71;
const INS_AUTHENTICATE_CONTINUE: u8 = 0xAF;

/// Run `AuthenticateEV2First` against `slot` using `key`, and return the
/// `Session` it establishes. The session's keys are zeroized the moment
/// it is dropped; callers must not let it outlive the card
/// scope that produced it.
pub fn authenticate(transport: &mut dyn CardTransport, slot: u8, key: &[u8; 16]) -> Result<Session> {
    // Pass 1: 90 71 00 00 02 <slot> 00 00 -> 91AF + 16-byte encrypted rndb.
    let pass1 = apdu::build(CLA_PROPRIETARY, INS_AUTHENTICATE, 0x00, 0x00, &[slot, 0x00], Some(0x00));
    let (body, sw) = transport.exchange(&pass1)?;
    if sw != apdu::SW_ADDITIONAL_FRAME {
        return Err(Error::from_status_word("AuthenticateEV2First/1", sw));
    }
    if body.len() != 16 {
        return Err(Error::ProtocolError {
            command: "AuthenticateEV2First/1",
            sw,
            detail: format!("expected 16-byte challenge, got {} bytes", body.len()),
        });
    }
    let zero_iv = [0u8; 16];
    let rndb_vec = crypto::aes128_cbc_decrypt(key, &zero_iv, &body);
    let rndb: [u8; 16] = rndb_vec.try_into().expect("16-byte CBC block stays 16 bytes");

    // Pass 2: generate RndA, rotate RndB, encrypt RndA||RndB_rot.
    let mut rnda = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut rnda);
    let rndb_rot = rotate_left_one(&rndb);

    let mut plaintext = Vec::with_capacity(32);
    plaintext.extend_from_slice(&rnda);
    plaintext.extend_from_slice(&rndb_rot);
    let cipher32 = crypto::aes128_cbc_encrypt(key, &zero_iv, &plaintext);

    let pass2 = apdu::build(
        CLA_PROPRIETARY,
        INS_AUTHENTICATE_CONTINUE,
        0x00,
        0x00,
        &cipher32,
        Some(0x00),
    );
    let (body2, sw2) = transport.exchange(&pass2)?;
    if sw2 != apdu::SW_SUCCESS_PROPRIETARY {
        return Err(Error::from_status_word("AuthenticateEV2First/2", sw2));
    }
    if body2.len() != 32 {
        return Err(Error::ProtocolError {
            command: "AuthenticateEV2First/2",
            sw: sw2,
            detail: format!("expected 32-byte response, got {} bytes", body2.len()),
        });
    }

    let decrypted = crypto::aes128_cbc_decrypt(key, &zero_iv, &body2);
    let ti: [u8; 4] = decrypted[0..4].try_into().unwrap();
    let rnda_rot_received: [u8; 16] = decrypted[4..20].try_into().unwrap();
    // decrypted[20..26] = pdcap2, decrypted[26..32] = pcdcap2 — reserved
    // capability fields this crate does not interpret.

    let expected_rnda_rot = rotate_left_one(&rnda);
    if rnda_rot_received != expected_rnda_rot {
        return Err(Error::AuthenticationFailed {
            command: "AuthenticateEV2First/2",
            sw: sw2,
        });
    }

    let (ses_auth_enc_key, ses_auth_mac_key) = session::derive_session_keys(&rnda, &rndb, key);
    Ok(Session::new(ti, ses_auth_enc_key, ses_auth_mac_key, slot))
}

fn rotate_left_one(input: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..15].copy_from_slice(&input[1..]);
    out[15] = input[0];
    out
}
