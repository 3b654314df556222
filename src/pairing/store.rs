//! Session store: one credential namespace per pairing session.
//!
//! Stored in {SESSION_DIR}/{session_id}/creds.json.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::pairing::session::SessionId;

const CREDS_FILE_NAME: &str = "creds.json";
const CREDS_FILE_VERSION: u8 = 1;
/// Credential field set once the remote service accepted the pairing.
pub const REGISTERED_FIELD: &str = "registered";

/// Credential state of one session, as a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialState(Map<String, Value>);

impl CredentialState {
    /// Whether these credentials are already linked to an account.
    pub fn registered(&self) -> bool {
        self.0
            .get(REGISTERED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite top-level fields with the ones carried by `delta`.
    pub fn merge(&mut self, delta: &CredentialDelta) {
        for (key, value) in &delta.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

/// Incremental credential update emitted by the protocol layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialDelta(Map<String, Value>);

impl CredentialDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn registered(registered: bool) -> Self {
        Self::new().with(REGISTERED_FIELD, registered)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Credentials loaded for one session, handed to the protocol adapter.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub session_id: SessionId,
    pub dir: PathBuf,
    pub state: CredentialState,
}

impl CredentialHandle {
    pub fn registered(&self) -> bool {
        self.state.registered()
    }
}

/// Durable per-session credential storage.
///
/// Saves for the same session must be serialized by the caller.
pub trait SessionStore: Send + Sync {
    /// Create the namespace if absent and load whatever it holds.
    fn open(&self, id: &SessionId) -> Result<CredentialHandle, StoreError>;

    /// Merge `delta` into the stored credentials. The namespace must exist.
    fn save(&self, id: &SessionId, delta: &CredentialDelta) -> Result<(), StoreError>;

    /// Irreversibly delete the namespace. Missing namespaces are not an error.
    fn purge(&self, id: &SessionId) -> Result<(), StoreError>;

    fn exists(&self, id: &SessionId) -> bool;

    /// All namespaces currently on storage, sorted.
    fn list(&self) -> Result<Vec<SessionId>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialsFile {
    version: u8,
    creds: CredentialState,
}

/// Directory-backed session store.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    base_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    fn read_state(path: &Path) -> Result<CredentialState, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialState::default());
            }
            Err(e) => return Err(e.into()),
        };
        let file: Option<CredentialsFile> = serde_json::from_str(&content).ok();
        Ok(file.map(|f| f.creds).unwrap_or_default())
    }

    fn write_state_locked(file: &mut fs::File, state: &CredentialState) -> Result<(), StoreError> {
        let contents = CredentialsFile {
            version: CREDS_FILE_VERSION,
            creds: state.clone(),
        };
        let json = serde_json::to_string_pretty(&contents)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn open(&self, id: &SessionId) -> Result<CredentialHandle, StoreError> {
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir)?;
        let state = Self::read_state(&dir.join(CREDS_FILE_NAME))?;
        Ok(CredentialHandle {
            session_id: id.clone(),
            dir,
            state,
        })
    }

    fn save(&self, id: &SessionId, delta: &CredentialDelta) -> Result<(), StoreError> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            // Never resurrect a purged namespace.
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("session namespace {} does not exist", id),
            )));
        }

        let path = dir.join(CREDS_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.lock_exclusive()?;

        let mut state = Self::read_state(&path)?;
        state.merge(delta);
        let result = Self::write_state_locked(&mut file, &state);

        fs4::FileExt::unlock(&file)?;
        result
    }

    fn purge(&self, id: &SessionId) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.session_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &SessionId) -> bool {
        self.session_dir(id).is_dir()
    }

    fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Ok(id) = SessionId::parse(name)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (FileSessionStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        (store, dir)
    }

    #[test]
    fn test_open_creates_namespace() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        assert!(!store.exists(&id));

        let handle = store.open(&id).unwrap();
        assert!(store.exists(&id));
        assert!(handle.dir.is_dir());
        assert!(handle.state.is_empty());
        assert!(!handle.registered());
    }

    #[test]
    fn test_save_then_open_loads_state() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        store.open(&id).unwrap();

        store
            .save(&id, &CredentialDelta::new().with("noiseKey", "abc"))
            .unwrap();
        store.save(&id, &CredentialDelta::registered(true)).unwrap();

        let handle = store.open(&id).unwrap();
        assert!(handle.registered());
        assert_eq!(handle.state.get("noiseKey"), Some(&Value::from("abc")));
        assert_eq!(handle.state.len(), 2);
    }

    #[test]
    fn test_save_overwrites_and_is_idempotent() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        store.open(&id).unwrap();

        let delta = CredentialDelta::new().with("me", "15551234567@s.whatsapp.net");
        store.save(&id, &delta).unwrap();
        store.save(&id, &delta).unwrap();
        store
            .save(&id, &CredentialDelta::new().with("me", "other"))
            .unwrap();

        let handle = store.open(&id).unwrap();
        assert_eq!(handle.state.len(), 1);
        assert_eq!(handle.state.get("me"), Some(&Value::from("other")));
    }

    #[test]
    fn test_save_without_namespace_fails() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        let err = store.save(&id, &CredentialDelta::registered(true)).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(!store.exists(&id));
    }

    #[test]
    fn test_purge_is_idempotent() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        store.open(&id).unwrap();
        store.save(&id, &CredentialDelta::registered(true)).unwrap();

        store.purge(&id).unwrap();
        assert!(!store.exists(&id));
        store.purge(&id).unwrap();

        let never_opened = SessionId::generate();
        store.purge(&never_opened).unwrap();
    }

    #[test]
    fn test_corrupt_creds_file_starts_empty() {
        let (store, _dir) = test_store();
        let id = SessionId::generate();
        let handle = store.open(&id).unwrap();
        fs::write(handle.dir.join(CREDS_FILE_NAME), "{not json").unwrap();

        let handle = store.open(&id).unwrap();
        assert!(handle.state.is_empty());

        store.save(&id, &CredentialDelta::registered(false)).unwrap();
        assert!(!store.open(&id).unwrap().registered());
    }

    #[test]
    fn test_list_skips_files_and_invalid_names() {
        let (store, dir) = test_store();
        let a = SessionId::parse("1700000000000-aaaaaa").unwrap();
        let b = SessionId::parse("1700000000001-bbbbbb").unwrap();
        store.open(&b).unwrap();
        store.open(&a).unwrap();
        fs::write(dir.path().join("stray.txt"), "x").unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();

        assert_eq!(store.list().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_list_missing_base_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("missing"));
        assert!(store.list().unwrap().is_empty());
    }
}
