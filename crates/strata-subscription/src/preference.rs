//! Durable subscription preferences.
//!
//! The user preference for each slot is persisted as a single string record
//! of six comma-separated fields:
//!
//! ```text
//! iccId,appType,appId,status,3gppAppIndex,3gpp2AppIndex
//! ```
//!
//! An absent index is written as `-1`, an absent string field as the empty
//! string. A missing or malformed record reads back as `status = INVALID`
//! and the store rewrites it with [`UserPreference::default`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AppType, SlotId, Subscription, SubscriptionStatus};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("malformed user preference record: {0}")]
    Malformed(String),
    #[error("preference file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("preference file parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("preference file encode: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("user preference {field} contains a field separator: {value:?}")]
    Unencodable { field: &'static str, value: String },
}

// ── User preference record ──────────────────────────────────────────

/// User-chosen application for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPreference {
    pub icc_id: Option<String>,
    pub app_type: AppType,
    pub app_id: Option<String>,
    pub status: SubscriptionStatus,
    pub app_index_3gpp: Option<usize>,
    pub app_index_3gpp2: Option<usize>,
}

impl Default for UserPreference {
    fn default() -> Self {
        Self {
            icc_id: None,
            app_type: AppType::Unknown,
            app_id: None,
            status: SubscriptionStatus::Invalid,
            app_index_3gpp: None,
            app_index_3gpp2: None,
        }
    }
}

impl UserPreference {
    /// Preference naming `sub`'s application, with the given status.
    pub fn from_subscription(sub: &Subscription, status: SubscriptionStatus) -> Self {
        let (app_index_3gpp, app_index_3gpp2) = if sub.app_type.is_3gpp2() {
            (None, sub.app_index)
        } else {
            (sub.app_index, None)
        };
        Self {
            icc_id: sub.icc_id.clone(),
            app_type: sub.app_type,
            app_id: sub.app_id.clone(),
            status,
            app_index_3gpp,
            app_index_3gpp2,
        }
    }

    /// Card index of the preferred application, picked by app family.
    pub fn preferred_app_index(&self) -> Option<usize> {
        if self.app_type.is_3gpp2() {
            self.app_index_3gpp2
        } else {
            self.app_index_3gpp
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status != SubscriptionStatus::Invalid
    }

    /// Encode for storage. Commas cannot be carried in a field, so a value
    /// containing one is refused instead of written as a broken record.
    pub fn encode(&self) -> Result<String, PreferenceError> {
        for (field, value) in [("icc_id", &self.icc_id), ("app_id", &self.app_id)] {
            if let Some(value) = value.as_deref().filter(|v| v.contains(',')) {
                return Err(PreferenceError::Unencodable {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(self.to_string())
    }

    /// Decode a stored record. Missing or malformed input yields the
    /// default record and `true` for "needs rewrite".
    pub fn decode_or_default(raw: Option<&str>) -> (Self, bool) {
        match raw.map(str::parse::<UserPreference>) {
            Some(Ok(pref)) => (pref, false),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "discarding malformed user preference");
                (Self::default(), true)
            }
            None => (Self::default(), true),
        }
    }
}

fn encode_index(index: Option<usize>) -> String {
    match index {
        Some(i) => i.to_string(),
        None => "-1".to_string(),
    }
}

fn decode_index(field: &str) -> Result<Option<usize>, PreferenceError> {
    let value: i64 = field
        .trim()
        .parse()
        .map_err(|_| PreferenceError::Malformed(format!("bad app index {field:?}")))?;
    match value {
        -1 => Ok(None),
        v if v >= 0 => Ok(Some(v as usize)),
        v => Err(PreferenceError::Malformed(format!("negative app index {v}"))),
    }
}

fn optional_field(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl fmt::Display for UserPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.icc_id.as_deref().unwrap_or(""),
            self.app_type,
            self.app_id.as_deref().unwrap_or(""),
            self.status,
            encode_index(self.app_index_3gpp),
            encode_index(self.app_index_3gpp2),
        )
    }
}

impl FromStr for UserPreference {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 6 {
            return Err(PreferenceError::Malformed(format!(
                "expected 6 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            icc_id: optional_field(fields[0]),
            app_type: fields[1].parse().map_err(PreferenceError::Malformed)?,
            app_id: optional_field(fields[2]),
            status: fields[3].parse().map_err(PreferenceError::Malformed)?,
            app_index_3gpp: decode_index(fields[4])?,
            app_index_3gpp2: decode_index(fields[5])?,
        })
    }
}

// ── Store trait ─────────────────────────────────────────────────────

/// Key/value persistence for subscription preferences.
///
/// Written only by the dispatch loop. Each field is independent; there is
/// no multi-field transaction.
pub trait PreferenceStore: Send {
    /// Read a slot's preference. Missing or malformed records are rewritten
    /// to the default before returning it.
    fn get_user_preference(&mut self, slot: SlotId) -> UserPreference;
    fn set_user_preference(
        &mut self,
        slot: SlotId,
        pref: &UserPreference,
    ) -> Result<(), PreferenceError>;

    fn get_default_subscription(&self) -> Option<SlotId>;
    fn set_default_subscription(&mut self, slot: SlotId) -> Result<(), PreferenceError>;
    fn get_voice_subscription(&self) -> Option<SlotId>;
    fn set_voice_subscription(&mut self, slot: SlotId) -> Result<(), PreferenceError>;
    fn get_sms_subscription(&self) -> Option<SlotId>;
    fn set_sms_subscription(&mut self, slot: SlotId) -> Result<(), PreferenceError>;
    fn get_data_subscription(&self) -> Option<SlotId>;
    fn set_data_subscription(&mut self, slot: SlotId) -> Result<(), PreferenceError>;
}

/// The persisted shape, shared by the memory and file stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceRecords {
    pub default_subscription: Option<SlotId>,
    pub voice_subscription: Option<SlotId>,
    pub sms_subscription: Option<SlotId>,
    pub data_subscription: Option<SlotId>,
    /// Encoded user preference per slot, keyed `slot<N>`.
    pub user_preferences: BTreeMap<String, String>,
}

fn slot_key(slot: SlotId) -> String {
    format!("slot{slot}")
}

impl PreferenceRecords {
    pub fn raw_user_preference(&self, slot: SlotId) -> Option<&str> {
        self.user_preferences.get(&slot_key(slot)).map(String::as_str)
    }

    pub fn put_raw_user_preference(&mut self, slot: SlotId, raw: impl Into<String>) {
        self.user_preferences.insert(slot_key(slot), raw.into());
    }

    /// Decode, rewriting in place when needed. Returns whether it rewrote.
    fn load_user_preference(&mut self, slot: SlotId) -> (UserPreference, bool) {
        let (pref, rewrite) = UserPreference::decode_or_default(self.raw_user_preference(slot));
        if rewrite {
            self.put_raw_user_preference(slot, pref.to_string());
        }
        (pref, rewrite)
    }
}

// ── In-memory store ─────────────────────────────────────────────────

/// Non-durable store, used by tests and by the daemon without a path.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    records: PreferenceRecords,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: PreferenceRecords) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &PreferenceRecords {
        &self.records
    }
}

macro_rules! selector_accessors {
    ($get:ident, $set:ident, $field:ident, $persist:expr) => {
        fn $get(&self) -> Option<SlotId> {
            self.records.$field
        }

        fn $set(&mut self, slot: SlotId) -> Result<(), PreferenceError> {
            self.records.$field = Some(slot);
            $persist(self)
        }
    };
}

fn no_flush(_: &mut MemoryPreferenceStore) -> Result<(), PreferenceError> {
    Ok(())
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_user_preference(&mut self, slot: SlotId) -> UserPreference {
        self.records.load_user_preference(slot).0
    }

    fn set_user_preference(
        &mut self,
        slot: SlotId,
        pref: &UserPreference,
    ) -> Result<(), PreferenceError> {
        let raw = pref.encode()?;
        self.records.put_raw_user_preference(slot, raw);
        Ok(())
    }

    selector_accessors!(get_default_subscription, set_default_subscription, default_subscription, no_flush);
    selector_accessors!(get_voice_subscription, set_voice_subscription, voice_subscription, no_flush);
    selector_accessors!(get_sms_subscription, set_sms_subscription, sms_subscription, no_flush);
    selector_accessors!(get_data_subscription, set_data_subscription, data_subscription, no_flush);
}

// ── TOML file store ─────────────────────────────────────────────────

/// Store persisted to a TOML file; every write rewrites the file atomically
/// (write to a sibling temp file, then rename).
#[derive(Debug)]
pub struct FilePreferenceStore {
    path: PathBuf,
    records: PreferenceRecords,
}

impl FilePreferenceStore {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PreferenceError> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => PreferenceRecords::default(),
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PreferenceRecords::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "preference store opened");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &PreferenceRecords {
        &self.records
    }

    fn flush(&mut self) -> Result<(), PreferenceError> {
        let text = toml::to_string_pretty(&self.records)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get_user_preference(&mut self, slot: SlotId) -> UserPreference {
        let (pref, rewritten) = self.records.load_user_preference(slot);
        if rewritten {
            if let Err(e) = self.flush() {
                tracing::warn!(slot, error = %e, "failed to rewrite default user preference");
            }
        }
        pref
    }

    fn set_user_preference(
        &mut self,
        slot: SlotId,
        pref: &UserPreference,
    ) -> Result<(), PreferenceError> {
        let raw = pref.encode()?;
        self.records.put_raw_user_preference(slot, raw);
        self.flush()
    }

    selector_accessors!(get_default_subscription, set_default_subscription, default_subscription, FilePreferenceStore::flush);
    selector_accessors!(get_voice_subscription, set_voice_subscription, voice_subscription, FilePreferenceStore::flush);
    selector_accessors!(get_sms_subscription, set_sms_subscription, sms_subscription, FilePreferenceStore::flush);
    selector_accessors!(get_data_subscription, set_data_subscription, data_subscription, FilePreferenceStore::flush);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usim_pref() -> UserPreference {
        UserPreference {
            icc_id: Some("8901260000000000001".into()),
            app_type: AppType::Usim,
            app_id: Some("A0000000871002".into()),
            status: SubscriptionStatus::Activated,
            app_index_3gpp: Some(1),
            app_index_3gpp2: None,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("strata-prefs-{}-{name}.toml", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn encodes_six_fields() {
        assert_eq!(
            usim_pref().to_string(),
            "8901260000000000001,USIM,A0000000871002,ACTIVATED,1,-1"
        );
        assert_eq!(UserPreference::default().to_string(), ",UNKNOWN,,INVALID,-1,-1");
    }

    #[test]
    fn decodes_stored_record() {
        let pref: UserPreference = "8901260000000000001,USIM,A0000000871002,ACTIVATED,1,-1"
            .parse()
            .unwrap();
        assert_eq!(pref, usim_pref());
    }

    #[test]
    fn malformed_records_are_rejected() {
        for raw in [
            "",
            "a,b,c",
            "icc,USIM,aid,ACTIVATED,1,-1,extra",
            "icc,BOGUS,aid,ACTIVATED,1,-1",
            "icc,USIM,aid,MAYBE,1,-1",
            "icc,USIM,aid,ACTIVATED,x,-1",
            "icc,USIM,aid,ACTIVATED,-5,-1",
        ] {
            assert!(raw.parse::<UserPreference>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn missing_or_malformed_yields_invalid_and_rewrite() {
        let (pref, rewrite) = UserPreference::decode_or_default(None);
        assert_eq!(pref.status, SubscriptionStatus::Invalid);
        assert!(rewrite);

        let (pref, rewrite) = UserPreference::decode_or_default(Some("garbage"));
        assert!(!pref.is_valid());
        assert!(rewrite);
    }

    #[test]
    fn comma_in_field_is_refused() {
        let mut pref = usim_pref();
        pref.icc_id = Some("8901,26".into());
        assert!(matches!(
            pref.encode(),
            Err(PreferenceError::Unencodable { field: "icc_id", .. })
        ));

        let mut store = MemoryPreferenceStore::new();
        store.set_user_preference(0, &usim_pref()).unwrap();
        let mut bad = usim_pref();
        bad.app_id = Some("A000,0087".into());
        assert!(store.set_user_preference(0, &bad).is_err());
        assert_eq!(store.get_user_preference(0), usim_pref());
    }

    #[test]
    fn preferred_index_follows_family() {
        let mut pref = usim_pref();
        assert_eq!(pref.preferred_app_index(), Some(1));
        pref.app_type = AppType::Csim;
        pref.app_index_3gpp2 = Some(0);
        assert_eq!(pref.preferred_app_index(), Some(0));
    }

    #[test]
    fn memory_store_rewrites_malformed_record() {
        let mut records = PreferenceRecords::default();
        records.put_raw_user_preference(0, "not,a,record");
        let mut store = MemoryPreferenceStore::with_records(records);

        let pref = store.get_user_preference(0);
        assert_eq!(pref, UserPreference::default());
        assert_eq!(
            store.records().raw_user_preference(0),
            Some(",UNKNOWN,,INVALID,-1,-1")
        );
    }

    #[test]
    fn memory_store_selectors() {
        let mut store = MemoryPreferenceStore::new();
        assert_eq!(store.get_data_subscription(), None);
        store.set_data_subscription(1).unwrap();
        store.set_voice_subscription(0).unwrap();
        assert_eq!(store.get_data_subscription(), Some(1));
        assert_eq!(store.get_voice_subscription(), Some(0));
        assert_eq!(store.get_sms_subscription(), None);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let path = temp_path("reopen");
        {
            let mut store = FilePreferenceStore::open(&path).unwrap();
            store.set_user_preference(0, &usim_pref()).unwrap();
            store.set_default_subscription(0).unwrap();
            store.set_data_subscription(0).unwrap();
        }
        let mut store = FilePreferenceStore::open(&path).unwrap();
        assert_eq!(store.get_user_preference(0), usim_pref());
        assert_eq!(store.get_default_subscription(), Some(0));
        assert_eq!(store.get_data_subscription(), Some(0));
        assert_eq!(store.get_sms_subscription(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_store_rewrites_missing_record_on_read() {
        let path = temp_path("rewrite");
        {
            let mut store = FilePreferenceStore::open(&path).unwrap();
            assert_eq!(store.get_user_preference(1).status, SubscriptionStatus::Invalid);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("slot1"), "default record not written: {text}");
        let _ = std::fs::remove_file(&path);
    }
}
