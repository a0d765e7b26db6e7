//! Durable UID -> keys mapping with atomic two-phase commit and
//! backup-on-write.
//!
//! Single-process, single-writer. Stored as a CSV file with header row
//! `uid,picc_master_key,app_read_key,sdm_mac_key,outcome,coin_name,
//! provisioned_date,status,notes,last_used_date`; a sibling
//! `_backup.csv` holds the previous version, overwritten on every write
//! after the primary is durably replaced.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated 7-byte tag UID, externalized as 14 uppercase hex chars.
/// This is the store's primary key and the sole boundary type every
/// interface to the store accepts — refusing foreign types at
/// construction is what prevents duplicate-row / case-sensitivity bugs
/// from a UID being stored in two different textual forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Uid {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        if value.len() != 14 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::StoreError(format!(
                "UID must be 14 hex characters, got {value:?}"
            )));
        }
        Ok(Uid(value.to_ascii_uppercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Heads,
    Tails,
    Invalid,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Heads => "heads",
            Outcome::Tails => "tails",
            Outcome::Invalid => "invalid",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "heads" => Ok(Outcome::Heads),
            "tails" => Ok(Outcome::Tails),
            "invalid" | "" => Ok(Outcome::Invalid),
            other => Err(Error::StoreError(format!("unknown outcome {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Factory,
    Pending,
    Provisioned,
    Failed,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Factory => "factory",
            Status::Pending => "pending",
            Status::Provisioned => "provisioned",
            Status::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "factory" => Ok(Status::Factory),
            "pending" => Ok(Status::Pending),
            "provisioned" => Ok(Status::Provisioned),
            "failed" => Ok(Status::Failed),
            other => Err(Error::StoreError(format!("unknown status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagKeys {
    pub uid: Uid,
    pub picc_master_key: [u8; 16],
    pub app_read_key: [u8; 16],
    pub sdm_mac_key: [u8; 16],
    pub outcome: Outcome,
    pub coin_name: String,
    pub provisioned_date: String,
    pub last_used_date: String,
    pub status: Status,
    pub notes: String,
}

impl TagKeys {
    /// A never-provisioned record for `uid`: all three keys zero,
    /// status `factory`.
    pub fn factory(uid: Uid) -> Self {
        Self {
            uid,
            picc_master_key: [0u8; 16],
            app_read_key: [0u8; 16],
            sdm_mac_key: [0u8; 16],
            outcome: Outcome::Invalid,
            coin_name: String::new(),
            provisioned_date: String::new(),
            last_used_date: String::new(),
            status: Status::Factory,
            notes: String::new(),
        }
    }
}

/// On-disk CSV row shape, in header order. Intermediate type:
/// `TagKeys` is what the rest of the crate works with.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    uid: String,
    picc_master_key: String,
    app_read_key: String,
    sdm_mac_key: String,
    outcome: String,
    coin_name: String,
    provisioned_date: String,
    status: String,
    notes: String,
    last_used_date: String,
}

fn key_to_hex(key: &[u8; 16]) -> String {
    hex::encode_upper(key)
}

fn key_from_hex(s: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(s).map_err(|e| Error::StoreError(format!("bad key hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::StoreError("key field must be 32 hex chars".into()))
}

impl TryFrom<CsvRow> for TagKeys {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        Ok(TagKeys {
            uid: Uid::try_from(row.uid.as_str())?,
            picc_master_key: key_from_hex(&row.picc_master_key)?,
            app_read_key: key_from_hex(&row.app_read_key)?,
            sdm_mac_key: key_from_hex(&row.sdm_mac_key)?,
            outcome: Outcome::parse(&row.outcome)?,
            coin_name: row.coin_name,
            provisioned_date: row.provisioned_date,
            last_used_date: row.last_used_date,
            status: Status::parse(&row.status)?,
            notes: row.notes,
        })
    }
}

impl From<&TagKeys> for CsvRow {
    fn from(tk: &TagKeys) -> Self {
        CsvRow {
            uid: tk.uid.as_str().to_string(),
            picc_master_key: key_to_hex(&tk.picc_master_key),
            app_read_key: key_to_hex(&tk.app_read_key),
            sdm_mac_key: key_to_hex(&tk.sdm_mac_key),
            outcome: tk.outcome.as_str().to_string(),
            coin_name: tk.coin_name.clone(),
            provisioned_date: tk.provisioned_date.clone(),
            status: tk.status.as_str().to_string(),
            notes: tk.notes.clone(),
            last_used_date: tk.last_used_date.clone(),
        }
    }
}

/// Result of [`KeyStore::validate_coin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinStatus {
    pub heads: Option<Uid>,
    pub tails: Option<Uid>,
    pub complete: bool,
}

pub struct KeyStore {
    path: PathBuf,
    backup_path: PathBuf,
    records: HashMap<String, TagKeys>,
    in_flight: HashSet<String>,
}

impl KeyStore {
    /// Load `path` if it exists, or start an empty store backed by it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backup_path = backup_path_for(&path);
        let mut records = HashMap::new();
        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)
                .map_err(|e| Error::StoreError(format!("open {path:?}: {e}")))?;
            for result in reader.deserialize::<CsvRow>() {
                let row = result.map_err(|e| Error::StoreError(format!("read row: {e}")))?;
                let tag_keys = TagKeys::try_from(row)?;
                records.insert(tag_keys.uid.as_str().to_string(), tag_keys);
            }
        }
        Ok(Self {
            path,
            backup_path,
            records,
            in_flight: HashSet::new(),
        })
    }

    pub fn get(&self, uid: &Uid) -> Option<TagKeys> {
        self.records.get(uid.as_str()).cloned()
    }

    /// Replace-or-insert, then durably rewrite the CSV file, backing up
    /// the prior version first.
    pub fn put(&mut self, tag_keys: TagKeys) -> Result<()> {
        self.records
            .insert(tag_keys.uid.as_str().to_string(), tag_keys);
        self.write_with_backup()
    }

    fn write_with_backup(&self) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| Error::StoreError(format!("backup write failed: {e}")))?;
        }
        let tmp_path = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path)
                .map_err(|e| Error::StoreError(format!("open tmp file: {e}")))?;
            let mut uids: Vec<&String> = self.records.keys().collect();
            uids.sort();
            for uid in uids {
                let row = CsvRow::from(&self.records[uid]);
                writer
                    .serialize(row)
                    .map_err(|e| Error::StoreError(format!("write row: {e}")))?;
            }
            writer
                .flush()
                .map_err(|e| Error::StoreError(format!("flush: {e}")))?;
        }
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::StoreError(format!("commit rename: {e}")))?;
        Ok(())
    }

    /// Zero, one, or two UIDs bearing `coin_name`.
    pub fn list_coin(&self, coin_name: &str) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self
            .records
            .values()
            .filter(|tk| tk.coin_name == coin_name)
            .map(|tk| tk.uid.clone())
            .collect();
        uids.sort();
        uids
    }

    /// `heads`/`tails` presence for `coin_name`; `complete` iff both
    /// sides exist.
    pub fn validate_coin(&self, coin_name: &str) -> CoinStatus {
        let mut heads = None;
        let mut tails = None;
        for tk in self.records.values().filter(|tk| tk.coin_name == coin_name) {
            match tk.outcome {
                Outcome::Heads => heads = Some(tk.uid.clone()),
                Outcome::Tails => tails = Some(tk.uid.clone()),
                Outcome::Invalid => {}
            }
        }
        let complete = heads.is_some() && tails.is_some();
        CoinStatus {
            heads,
            tails,
            complete,
        }
    }

    /// Assign `coin_name`/`outcome` to an already-provisioned `uid`.
    /// Refuses assigning the same outcome twice under the same coin
    /// name.
    pub fn assign_coin(&mut self, uid: &Uid, coin_name: &str, outcome: Outcome) -> Result<()> {
        let existing = self.validate_coin(coin_name);
        let clash = match outcome {
            Outcome::Heads => existing.heads.as_ref().is_some_and(|h| h != uid),
            Outcome::Tails => existing.tails.as_ref().is_some_and(|t| t != uid),
            Outcome::Invalid => false,
        };
        if clash {
            return Err(Error::StoreError(format!(
                "coin {coin_name:?} already has a {outcome:?} assigned",
                outcome = outcome.as_str()
            )));
        }
        let mut tk = self
            .get(uid)
            .ok_or_else(|| Error::StoreError(format!("no record for {uid}")))?;
        tk.coin_name = coin_name.to_string();
        tk.outcome = outcome;
        self.put(tk)
    }

    /// Begin a scoped two-phase commit for `uid`. Returns the
    /// guard plus the freshly minted `TagKeys` the caller should attempt
    /// to write to the tag. Concurrent `provision_begin` on the same UID
    /// is refused as a programming error.
    pub fn provision_begin(
        &mut self,
        uid: Uid,
        mint_keys: impl FnOnce() -> ([u8; 16], [u8; 16], [u8; 16]),
    ) -> Result<ProvisionGuard<'_>> {
        if self.in_flight.contains(uid.as_str()) {
            return Err(Error::StateError(format!(
                "provision_begin already in flight for {uid}"
            )));
        }
        let prior = self.get(&uid);
        let (picc_master_key, app_read_key, sdm_mac_key) = mint_keys();
        let mut pending = prior.clone().unwrap_or_else(|| TagKeys::factory(uid.clone()));
        pending.picc_master_key = picc_master_key;
        pending.app_read_key = app_read_key;
        pending.sdm_mac_key = sdm_mac_key;
        pending.status = Status::Pending;
        self.in_flight.insert(uid.as_str().to_string());
        self.put(pending.clone())?;
        Ok(ProvisionGuard {
            store: self,
            uid,
            prior,
            pending,
            finished: false,
        })
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("keys");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    path.with_file_name(format!("{stem}_backup.{ext}"))
}

/// Scoped two-phase commit handle. Dropping it without calling
/// [`commit`](ProvisionGuard::commit) rolls back to the pre-scope
/// snapshot, which is exactly what makes the store safe against a
/// provisioning attempt that never reached the tag.
pub struct ProvisionGuard<'s> {
    store: &'s mut KeyStore,
    uid: Uid,
    prior: Option<TagKeys>,
    pending: TagKeys,
    finished: bool,
}

impl<'s> ProvisionGuard<'s> {
    /// Keys minted for this attempt — pass these to the provisioning
    /// engine's `ChangeKey` calls.
    pub fn new_keys(&self) -> &TagKeys {
        &self.pending
    }

    /// The keys in effect before this attempt started, or `None` if
    /// `uid` had no prior record (a never-seen tag). Used to derive the
    /// `old_key` operand for `ChangeKey`'s XOR construction.
    pub fn prior_keys(&self) -> Option<&TagKeys> {
        self.prior.as_ref()
    }

    /// Mark the attempt successful: `pending` -> `provisioned` with a
    /// fresh `provisioned_date`.
    pub fn commit(mut self) -> Result<()> {
        let mut final_record = self.pending.clone();
        final_record.status = Status::Provisioned;
        final_record.provisioned_date = Utc::now().to_rfc3339();
        self.store.put(final_record)?;
        self.store.in_flight.remove(self.uid.as_str());
        self.finished = true;
        Ok(())
    }

    /// Mark the attempt failed: restore the pre-scope snapshot (or
    /// remove the record if none existed).
    pub fn fail(mut self) -> Result<()> {
        self.rollback()?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        match self.prior.clone() {
            Some(prior) => self.store.put(prior)?,
            None => self.store.remove_record(&self.uid)?,
        }
        self.store.in_flight.remove(self.uid.as_str());
        Ok(())
    }
}

impl<'s> Drop for ProvisionGuard<'s> {
    fn drop(&mut self) {
        if !self.finished {
            // Abnormal scope exit (caller dropped the guard without
            // calling commit/fail, e.g. via `?` early return): treat as
            // failure and roll back — a canceled attempt must never
            // leave the store claiming untested keys.
            let _ = self.rollback();
        }
    }
}

impl KeyStore {
    fn remove_record(&mut self, uid: &Uid) -> Result<()> {
        self.records.remove(uid.as_str());
        self.write_with_backup()
    }
}
