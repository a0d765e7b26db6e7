//! Purely observational: reads UID, key versions, file-02 settings, and
//! file-02 NDEF content, and classifies the tag without mutating it.

use crate::commands::{FileSettings, Tag};
use crate::error::Result;
use crate::keystore::{KeyStore, Status, TagKeys, Uid};

/// Coarse classification label. `pending` store records are
/// folded into [`Label::RegisteredFailed`] here — both mean "not
/// cleanly provisioned"; the provisioning engine distinguishes pending
/// from failed itself when deciding whether an operator must reset or
/// may resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    RegisteredProvisioned,
    RegisteredFailed,
    RegisteredFactory,
    UnregisteredFactory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagState {
    pub uid: Uid,
    /// Key versions for slots 0, 1, 3 in that order. `0x00` is
    /// inconclusive — never treated as ground truth.
    pub key_versions: [u8; 3],
    pub file_settings: FileSettings,
    pub ndef_present: bool,
    pub label: Label,
    /// True when the store's status disagrees with what is actually on
    /// the tag — e.g. store says `provisioned` but the NDEF content is
    /// empty or factory-shaped. The engine refuses to re-provision an
    /// inconsistent tag without an explicit reset instruction.
    pub inconsistent: bool,
    pub reason: &'static str,
    pub store_record: Option<TagKeys>,
}

/// Read-only classification of the currently-selected tag. Does not
/// authenticate or mutate anything.
pub fn classify(tag: &mut Tag<'_>, store: &KeyStore) -> Result<TagState> {
    let chip_version = tag.get_chip_version()?;
    let uid = Uid::try_from(hex::encode_upper(chip_version.uid).as_str())?;

    let key_versions = [
        tag.get_key_version(0)?,
        tag.get_key_version(1)?,
        tag.get_key_version(3)?,
    ];

    let file_settings = tag.get_file_settings(0x02)?;
    let ndef_bytes = tag
        .read_data_plain(0x02, 0, file_settings.file_size.min(256))
        .unwrap_or_default();
    let ndef_present = is_ndef_populated(&ndef_bytes);

    let store_record = store.get(&uid);
    let (label, inconsistent, reason) = match &store_record {
        None if !ndef_present => (
            Label::UnregisteredFactory,
            false,
            "no store record, NDEF empty or factory-shaped",
        ),
        None => (
            Label::UnregisteredFactory,
            true,
            "no store record, but NDEF already holds content — tag may be registered under a different store",
        ),
        Some(record) => match record.status {
            Status::Factory if !ndef_present => (Label::RegisteredFactory, false, "store and tag agree: factory"),
            Status::Factory => (
                Label::RegisteredFactory,
                true,
                "store says factory, but NDEF already holds content",
            ),
            Status::Provisioned if ndef_present => {
                (Label::RegisteredProvisioned, false, "store and tag agree: provisioned")
            }
            Status::Provisioned => (
                Label::RegisteredProvisioned,
                true,
                "store says provisioned, but NDEF is empty or factory-shaped",
            ),
            Status::Pending => (
                Label::RegisteredFailed,
                true,
                "provisioning attempt mid-flight, operator must reset or resume",
            ),
            Status::Failed => (
                Label::RegisteredFailed,
                true,
                "previous provisioning attempt failed, operator must reset or resume",
            ),
        },
    };

    Ok(TagState {
        uid,
        key_versions,
        file_settings,
        ndef_present,
        label,
        inconsistent,
        reason,
        store_record,
    })
}

/// `true` if `bytes` looks like a populated NDEF URI record rather than
/// an empty / factory-default file. We don't try to fully parse it here
/// (that's what SDM substitution cares about, not classification) — just
/// check the NLEN length prefix is nonzero and a record header is
/// present.
fn is_ndef_populated(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    let nlen = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    nlen > 0 && bytes.len() >= 2 + nlen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ndef_populated() {
        assert!(!is_ndef_populated(&[0x00, 0x00]));
        assert!(!is_ndef_populated(&[0x00, 0x00, 0x00, 0x00]));
        let mut populated = vec![0x00, 0x03];
        populated.extend_from_slice(&[0xD1, 0x01, 0x01, b'U']);
        assert!(is_ndef_populated(&populated));
    }
}
