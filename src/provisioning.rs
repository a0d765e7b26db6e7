//! Three-session provisioning state machine with recovery points.
//!
//! A tag is classified first (see [`crate::inspector`]), then walked
//! through three independent authenticated sessions so a dropped card or
//! crashed process mid-flight leaves the tag in a state the next attempt
//! can still classify, rather than half-committed. Session boundaries are
//! also transaction boundaries: `ChangeFileSettings` never shares a
//! session with a preceding `ChangeKey` — locking a file's access rights
//! right after the key that guards it just changed is the easiest way to
//! brick a tag beyond recovery.
//!
//! The key store's two-phase [`crate::keystore::ProvisionGuard`] is the
//! other half of the safety story: it transitions to `pending` before
//! session 1 touches the PICC master key, and rolls back to the prior
//! record (or removes it) if anything below fails.

use rand::RngCore;

use crate::auth;
use crate::commands::{self, ChangeFileSettingsParams, CrcMode, SdmOffsets, Tag};
use crate::error::{Error, Result};
use crate::inspector::{self, Label};
use crate::keystore::{KeyStore, Outcome, Status, TagKeys, Uid};
use crate::ndef;
use crate::session::CommMode;
use crate::transport::CardTransport;

const SLOT_PICC_MASTER: u8 = 0;
const SLOT_APP_READ: u8 = 1;
const SLOT_SDM_MAC: u8 = 3;
const NDEF_FILE_NO: u8 = 0x02;
const NDEF_FID: u16 = 0xE104;
const FACTORY_KEY: [u8; 16] = [0u8; 16];

fn random_key() -> [u8; 16] {
    let mut k = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut k);
    k
}

fn random_key_triple() -> ([u8; 16], [u8; 16], [u8; 16]) {
    (random_key(), random_key(), random_key())
}

/// Classify the selected tag, pick a recovery-safe path, and on success
/// record `coin_name`/`outcome` against it. Refuses to proceed on a tag
/// whose store record disagrees with what is actually on the tag —
/// that needs an explicit [`reset`] first.
pub fn provision(
    transport: &mut dyn CardTransport,
    store: &mut KeyStore,
    coin_name: &str,
    outcome: Outcome,
    url_template: &str,
) -> Result<TagKeys> {
    let state = {
        let mut tag = Tag::new(transport);
        tag.select_picc_application()?;
        inspector::classify(&mut tag, store)?
    };

    if state.inconsistent {
        return Err(Error::StateError(format!(
            "tag {} disagrees with its store record ({}); reset it explicitly before provisioning",
            state.uid, state.reason
        )));
    }

    let auth_key = match (&state.label, &state.store_record) {
        (Label::UnregisteredFactory, _) => FACTORY_KEY,
        (Label::RegisteredFactory, _) => FACTORY_KEY,
        (Label::RegisteredProvisioned, Some(record)) => record.picc_master_key,
        (Label::RegisteredProvisioned, None) => {
            return Err(Error::StateError(format!(
                "tag {} classified as provisioned but has no store record",
                state.uid
            )))
        }
        (Label::RegisteredFailed, _) => {
            return Err(Error::StateError(format!(
                "tag {} has a pending or failed store record; reset or resume explicitly",
                state.uid
            )))
        }
    };

    run_provisioning(transport, store, state.uid, auth_key, coin_name, outcome, url_template)
}

fn run_provisioning(
    transport: &mut dyn CardTransport,
    store: &mut KeyStore,
    uid: Uid,
    auth_key: [u8; 16],
    coin_name: &str,
    outcome: Outcome,
    url_template: &str,
) -> Result<TagKeys> {
    let guard = store.provision_begin(uid, random_key_triple)?;
    let prior = guard.prior_keys().cloned();
    let new_keys = guard.new_keys().clone();
    let old_picc = prior.as_ref().map_or(FACTORY_KEY, |p| p.picc_master_key);
    let old_app = prior.as_ref().map_or(FACTORY_KEY, |p| p.app_read_key);
    let old_sdm = prior.as_ref().map_or(FACTORY_KEY, |p| p.sdm_mac_key);

    let outcome_of_sessions = run_sessions(
        transport,
        &auth_key,
        &new_keys,
        old_picc,
        old_app,
        old_sdm,
        url_template,
    );

    match outcome_of_sessions {
        Ok(()) => {
            guard.commit()?;
        }
        Err(err) => {
            if let Err(rollback_err) = guard.fail() {
                tracing::error!(%rollback_err, original = %err, "rollback failed after aborted provisioning attempt");
            }
            return Err(err);
        }
    }

    store.assign_coin(&new_keys.uid, coin_name, outcome)?;
    Ok(store
        .get(&new_keys.uid)
        .expect("record exists immediately after commit and assign_coin"))
}

/// The three sessions themselves, with no store interaction — kept
/// separate so `run_provisioning` owns the only place that decides
/// commit vs. rollback.
fn run_sessions(
    transport: &mut dyn CardTransport,
    auth_key: &[u8; 16],
    new_keys: &TagKeys,
    old_picc: [u8; 16],
    old_app: [u8; 16],
    old_sdm: [u8; 16],
    url_template: &str,
) -> Result<()> {
    // Session 1: rotate the PICC master key alone. The moment this
    // succeeds, the old key is gone from the tag; only the store's
    // pending record (already written before this call) remembers it.
    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, auth_key)?;
        session.change_key(
            transport,
            SLOT_PICC_MASTER,
            &new_keys.picc_master_key,
            &old_picc,
            CrcMode::NewKeyOnly,
        )?;
    }

    // Session 2: rotate the application keys while file 02 is still
    // unlocked, then write the NDEF payload.
    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, &new_keys.picc_master_key)?;
        session.change_key(
            transport,
            SLOT_APP_READ,
            &new_keys.app_read_key,
            &old_app,
            CrcMode::NewKeyOnly,
        )?;
        session.change_key(
            transport,
            SLOT_SDM_MAC,
            &new_keys.sdm_mac_key,
            &old_sdm,
            CrcMode::NewKeyOnly,
        )?;
    }

    let ndef_msg = ndef::build(url_template)?;
    {
        let mut tag = Tag::new(transport);
        tag.iso_select_file(NDEF_FID)?;
        tag.iso_update_binary(0, &ndef_msg.bytes)?;
    }

    // Session 3: lock file 02 down with SDM configured, on its own
    // session so this ChangeFileSettings never shares a CMAC chain with
    // the key rotation that preceded it.
    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, &new_keys.picc_master_key)?;
        session.change_file_settings(
            transport,
            file02_lockdown_params(SdmOffsets {
                uid_offset: ndef_msg.uid_offset,
                read_counter_offset: ndef_msg.read_counter_offset,
                mac_input_offset: ndef_msg.mac_input_offset,
                mac_offset: ndef_msg.mac_offset,
            }),
        )?;
    }

    Ok(())
}

fn file02_lockdown_params(offsets: SdmOffsets) -> ChangeFileSettingsParams {
    ChangeFileSettingsParams {
        file_no: NDEF_FILE_NO,
        file_option: commands::file_option(true, CommMode::Mac),
        access_rights: commands::access_rights(
            commands::ACCESS_NEVER,
            SLOT_PICC_MASTER,
            commands::ACCESS_FREE,
            commands::ACCESS_NEVER,
        ),
        sdm_options: commands::sdm_options(true, true, true),
        sdm_access_rights: commands::sdm_access_rights(
            commands::ACCESS_FREE,
            commands::ACCESS_FREE,
            SLOT_SDM_MAC,
        ),
        offsets,
    }
}

fn file02_factory_default_params() -> ChangeFileSettingsParams {
    ChangeFileSettingsParams {
        file_no: NDEF_FILE_NO,
        file_option: commands::file_option(false, CommMode::Plain),
        access_rights: commands::access_rights(
            commands::ACCESS_FREE,
            SLOT_PICC_MASTER,
            commands::ACCESS_FREE,
            commands::ACCESS_FREE,
        ),
        sdm_options: 0,
        sdm_access_rights: commands::sdm_access_rights(
            commands::ACCESS_NEVER,
            commands::ACCESS_NEVER,
            commands::ACCESS_NEVER,
        ),
        offsets: SdmOffsets {
            uid_offset: 0,
            read_counter_offset: 0,
            mac_input_offset: 0,
            mac_offset: 0,
        },
    }
}

/// Reset `uid` back to factory defaults: all three keys zeroed, file 02
/// unlocked again. The caller supplies the tag's *current* PICC master
/// key rather than having this function look it up in the store, since
/// a reset is precisely the tool for a tag whose store record and
/// on-tag state have diverged and can no longer be trusted to agree.
pub fn reset(
    transport: &mut dyn CardTransport,
    store: &mut KeyStore,
    uid: Uid,
    current_picc_master_key: [u8; 16],
) -> Result<()> {
    let prior = store.get(&uid);
    let old_app = prior.as_ref().map_or(FACTORY_KEY, |p| p.app_read_key);
    let old_sdm = prior.as_ref().map_or(FACTORY_KEY, |p| p.sdm_mac_key);

    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, &current_picc_master_key)?;
        session.change_key(
            transport,
            SLOT_PICC_MASTER,
            &FACTORY_KEY,
            &current_picc_master_key,
            CrcMode::NewKeyOnly,
        )?;
    }
    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, &FACTORY_KEY)?;
        session.change_key(transport, SLOT_APP_READ, &FACTORY_KEY, &old_app, CrcMode::NewKeyOnly)?;
        session.change_key(transport, SLOT_SDM_MAC, &FACTORY_KEY, &old_sdm, CrcMode::NewKeyOnly)?;
    }
    {
        let mut tag = Tag::new(transport);
        tag.iso_select_file(NDEF_FID)?;
        tag.iso_update_binary(0, &[0x00, 0x00])?;
    }
    {
        let mut session = auth::authenticate(transport, SLOT_PICC_MASTER, &FACTORY_KEY)?;
        session.change_file_settings(transport, file02_factory_default_params())?;
    }

    if prior.is_some() {
        store.put(TagKeys::factory(uid))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use tempfile::tempdir;

    fn rotate_left_one(input: &[u8; 16]) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..15].copy_from_slice(&input[1..]);
        out[15] = input[0];
        out
    }

    /// A minimal but crypto-accurate NTAG424 simulator: enough of the
    /// command set to drive the provisioning engine end-to-end with no
    /// hardware, verifying CMACs and key rotations instead of trusting
    /// canned responses.
    struct FakeNtag {
        uid: [u8; 7],
        keys: [[u8; 16]; 5],
        key_versions: [u8; 5],
        file02: Vec<u8>,
        file02_locked: bool,
        ti: [u8; 4],
        counter: u16,
        rndb: Option<[u8; 16]>,
        pending_slot: Option<u8>,
        session_enc: Option<[u8; 16]>,
        session_mac: Option<[u8; 16]>,
        fail_change_key_slot0: bool,
        seed: u8,
    }

    impl FakeNtag {
        fn factory(uid: [u8; 7]) -> Self {
            Self {
                uid,
                keys: [[0u8; 16]; 5],
                key_versions: [0u8; 5],
                file02: vec![0x00, 0x00],
                file02_locked: false,
                ti: [0; 4],
                counter: 0,
                rndb: None,
                pending_slot: None,
                session_enc: None,
                session_mac: None,
                fail_change_key_slot0: false,
                seed: 1,
            }
        }

        fn command_iv(&self, counter: u16) -> [u8; 16] {
            let mut block = [0u8; 16];
            block[0] = 0xA5;
            block[1] = 0x5A;
            block[2..6].copy_from_slice(&self.ti);
            block[6..8].copy_from_slice(&counter.to_le_bytes());
            crypto::aes128_ecb_encrypt(self.session_enc.as_ref().unwrap(), &block)
        }

        fn mac_input(&self, counter: u16, ins: u8, header: &[u8], payload: &[u8]) -> Vec<u8> {
            let mut msg = Vec::new();
            msg.push(ins);
            msg.extend_from_slice(&counter.to_le_bytes());
            msg.extend_from_slice(&self.ti);
            msg.extend_from_slice(header);
            msg.extend_from_slice(payload);
            msg
        }
    }

    impl CardTransport for FakeNtag {
        fn exchange(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, u16)> {
            let cla = apdu[0];
            let ins = apdu[1];
            let data: &[u8] = if apdu.len() > 5 { &apdu[5..apdu.len() - 1] } else { &[] };
            match (cla, ins) {
                (0x90, 0x60) => {
                    let mut body = Vec::with_capacity(28);
                    body.extend_from_slice(&[0u8; 7]);
                    body.extend_from_slice(&[0u8; 7]);
                    body.extend_from_slice(&self.uid);
                    body.extend_from_slice(&[0u8; 5]);
                    body.push(0);
                    body.push(0);
                    Ok((body, 0x9100))
                }
                (0x90, 0x64) => Ok((vec![self.key_versions[data[0] as usize]], 0x9100)),
                (0x90, 0xF5) => {
                    let file_option = if self.file02_locked { 0b0100_0001 } else { 0b0000_0000 };
                    Ok((vec![file_option, 0xE0, 0x00, 0x00, 0x01, 0x00], 0x9100))
                }
                (0x90, 0xAD) => Ok((self.file02.clone(), 0x9100)),
                (0x90, 0x71) => {
                    let slot = data[0];
                    let mut rndb = [0u8; 16];
                    for (i, b) in rndb.iter_mut().enumerate() {
                        *b = self.seed.wrapping_add(i as u8).wrapping_mul(7);
                    }
                    self.seed = self.seed.wrapping_add(1);
                    self.rndb = Some(rndb);
                    self.pending_slot = Some(slot);
                    let enc = crypto::aes128_cbc_encrypt(&self.keys[slot as usize], &[0u8; 16], &rndb);
                    Ok((enc, 0x91AF))
                }
                (0x90, 0xAF) => {
                    let slot = self.pending_slot.take().expect("pass1 must precede pass2") as usize;
                    let rndb = self.rndb.take().expect("pass1 must precede pass2");
                    let plain = crypto::aes128_cbc_decrypt(&self.keys[slot], &[0u8; 16], data);
                    let rnda: [u8; 16] = plain[0..16].try_into().unwrap();
                    let rndb_rot_received: [u8; 16] = plain[16..32].try_into().unwrap();
                    if rndb_rot_received != rotate_left_one(&rndb) {
                        return Ok((vec![], 0x91AE));
                    }
                    self.ti = [slot as u8, 0x00, self.seed, 0x01];
                    self.counter = 0;
                    let rnda_rot = rotate_left_one(&rnda);
                    let mut resp_plain = Vec::new();
                    resp_plain.extend_from_slice(&self.ti);
                    resp_plain.extend_from_slice(&rnda_rot);
                    resp_plain.extend_from_slice(&[0u8; 6]);
                    resp_plain.extend_from_slice(&[0u8; 6]);
                    let (enc_key, mac_key) = crate::session::derive_session_keys(&rnda, &rndb, &self.keys[slot]);
                    self.session_enc = Some(enc_key);
                    self.session_mac = Some(mac_key);
                    let resp_cipher = crypto::aes128_cbc_encrypt(&self.keys[slot], &[0u8; 16], &resp_plain);
                    Ok((resp_cipher, 0x9100))
                }
                (0x90, 0xC4) => {
                    let slot = data[0];
                    let ciphertext = &data[1..data.len() - 8];
                    let received_mac = &data[data.len() - 8..];
                    let expected_mac = crypto::aes_cmac_truncated(
                        self.session_mac.as_ref().unwrap(),
                        &self.mac_input(self.counter, 0xC4, &[slot], ciphertext),
                    );
                    if expected_mac != received_mac {
                        return Ok((vec![], 0x911E));
                    }
                    if slot == 0 && self.fail_change_key_slot0 {
                        return Ok((vec![], 0x919D));
                    }
                    let iv = self.command_iv(self.counter);
                    let padded = crypto::aes128_cbc_decrypt(self.session_enc.as_ref().unwrap(), &iv, ciphertext);
                    let plaintext = crypto::iso7816_unpad(&padded).expect("valid padding");
                    if slot == 0 {
                        self.keys[0] = plaintext[0..16].try_into().unwrap();
                    } else {
                        let xored: [u8; 16] = plaintext[0..16].try_into().unwrap();
                        let mut new_key = [0u8; 16];
                        for i in 0..16 {
                            new_key[i] = xored[i] ^ self.keys[slot as usize][i];
                        }
                        self.keys[slot as usize] = new_key;
                    }
                    self.key_versions[slot as usize] = 0x01;
                    self.counter += 1;
                    Ok((vec![], 0x9100))
                }
                (0x90, 0x5F) => {
                    let ciphertext = &data[..data.len() - 8];
                    let received_mac = &data[data.len() - 8..];
                    let expected_mac = crypto::aes_cmac_truncated(
                        self.session_mac.as_ref().unwrap(),
                        &self.mac_input(self.counter, 0x5F, &[], ciphertext),
                    );
                    if expected_mac != received_mac {
                        return Ok((vec![], 0x911E));
                    }
                    let iv = self.command_iv(self.counter);
                    let padded = crypto::aes128_cbc_decrypt(self.session_enc.as_ref().unwrap(), &iv, ciphertext);
                    crypto::iso7816_unpad(&padded).expect("valid padding");
                    self.file02_locked = true;
                    self.counter += 1;
                    Ok((vec![], 0x9100))
                }
                (0x00, 0xA4) => Ok((vec![], 0x9000)),
                (0x00, 0xD6) => {
                    let offset = u16::from_be_bytes([apdu[2], apdu[3]]) as usize;
                    let chunk = &apdu[5..];
                    if self.file02.len() < offset + chunk.len() {
                        self.file02.resize(offset + chunk.len(), 0);
                    }
                    self.file02[offset..offset + chunk.len()].copy_from_slice(chunk);
                    Ok((vec![], 0x9000))
                }
                _ => panic!("FakeNtag: unhandled apdu {apdu:02X?}"),
            }
        }
    }

    #[test]
    fn test_provision_fresh_factory_happy_path() {
        let dir = tempdir().unwrap();
        let mut store = KeyStore::open(dir.path().join("keys.csv")).unwrap();
        let mut fake = FakeNtag::factory([0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

        let record = provision(
            &mut fake,
            &mut store,
            "COIN_ALPHA",
            Outcome::Heads,
            "https://example.com/s/AK",
        )
        .unwrap();

        assert_eq!(record.status, Status::Provisioned);
        assert_eq!(record.coin_name, "COIN_ALPHA");
        assert_eq!(record.outcome, Outcome::Heads);
        assert_ne!(record.picc_master_key, FACTORY_KEY);
        assert_eq!(record.picc_master_key, fake.keys[0]);
        assert_eq!(record.app_read_key, fake.keys[1]);
        assert_eq!(record.sdm_mac_key, fake.keys[3]);
        assert!(fake.file02_locked);

        let reloaded = KeyStore::open(dir.path().join("keys.csv")).unwrap();
        assert_eq!(reloaded.get(&record.uid).unwrap(), record);
    }

    #[test]
    fn test_session1_change_key_failure_rolls_back_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.csv");
        let mut store = KeyStore::open(&path).unwrap();
        let mut fake = FakeNtag::factory([0x04, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        fake.fail_change_key_slot0 = true;

        let err = provision(&mut fake, &mut store, "COIN_BETA", Outcome::Tails, "https://example.com/x").unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));

        // The store must hold no leftover pending row for this tag.
        let uid = Uid::try_from(hex::encode_upper(fake.uid).as_str()).unwrap();
        let reloaded = KeyStore::open(&path).unwrap();
        assert!(reloaded.get(&uid).is_none());
        assert_eq!(fake.keys[0], FACTORY_KEY, "factory key must be untouched on failure");
    }

    #[test]
    fn test_reprovision_uses_stored_keys_as_old_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.csv");
        let mut store = KeyStore::open(&path).unwrap();
        let mut fake = FakeNtag::factory([0x04, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

        let first = provision(&mut fake, &mut store, "COIN_GAMMA", Outcome::Heads, "https://example.com/g").unwrap();

        let second = provision(&mut fake, &mut store, "COIN_DELTA", Outcome::Tails, "https://example.com/d").unwrap();

        assert_ne!(second.picc_master_key, first.picc_master_key);
        assert_eq!(second.coin_name, "COIN_DELTA");
        assert_eq!(second.picc_master_key, fake.keys[0]);
    }
}
