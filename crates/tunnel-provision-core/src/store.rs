use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::types::{SetupState, SetupStatus, TokenRecord};

pub const TOKEN_FILE_NAME: &str = "google_token.json";
pub const SETUP_FILE_NAME: &str = "setup_state.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored record at {} is unreadable: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait CredentialStore {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError>;
    fn save(&mut self, record: &TokenRecord) -> Result<(), StoreError>;
}

pub trait ProgressStore {
    fn load(&self) -> Result<Option<SetupState>, StoreError>;
    fn save(&mut self, state: &SetupState) -> Result<(), StoreError>;

    fn load_or_default(&self) -> Result<SetupState, StoreError> {
        Ok(self.load()?.unwrap_or_default())
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for &mut S {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, record: &TokenRecord) -> Result<(), StoreError> {
        (**self).save(record)
    }
}

impl<S: ProgressStore + ?Sized> ProgressStore for &mut S {
    fn load(&self) -> Result<Option<SetupState>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, state: &SetupState) -> Result<(), StoreError> {
        (**self).save(state)
    }
}

/// Answers the status query from whatever the stores currently hold.
pub fn setup_status<C, P>(credentials: &C, progress: &P) -> Result<SetupStatus, StoreError>
where
    C: CredentialStore + ?Sized,
    P: ProgressStore + ?Sized,
{
    let token = credentials.load()?;
    let state = progress.load_or_default()?;
    Ok(SetupStatus::from_parts(token.as_ref(), &state))
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    record: Option<TokenRecord>,
}

impl InMemoryCredentialStore {
    pub fn with_record(record: TokenRecord) -> Self {
        Self {
            record: Some(record),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.record.clone())
    }

    fn save(&mut self, record: &TokenRecord) -> Result<(), StoreError> {
        self.record = Some(record.clone());
        Ok(())
    }
}

/// Keeps every saved snapshot so callers can inspect the order of
/// transitions, not just the final state.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    history: Vec<SetupState>,
}

impl InMemoryProgressStore {
    pub fn with_state(state: SetupState) -> Self {
        Self {
            history: vec![state],
        }
    }

    pub fn history(&self) -> &[SetupState] {
        &self.history
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn load(&self) -> Result<Option<SetupState>, StoreError> {
        Ok(self.history.last().cloned())
    }

    fn save(&mut self, state: &SetupState) -> Result<(), StoreError> {
        self.history.push(state.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(TOKEN_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<TokenRecord>, StoreError> {
        read_json(&self.path)
    }

    fn save(&mut self, record: &TokenRecord) -> Result<(), StoreError> {
        write_json_atomic(&self.path, record)
    }
}

#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(SETUP_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<Option<SetupState>, StoreError> {
        read_json(&self.path)
    }

    fn save(&mut self, state: &SetupState) -> Result<(), StoreError> {
        write_json_atomic(&self.path, state)
    }
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let record = serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(record))
}

/// Writes to a sibling temp file and renames it over `path`, so a reader
/// sees either the old record or the new one. `NamedTempFile` creates the
/// file owner-only, which the rename preserves.
fn write_json_atomic<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(io_error)?;

    let payload = serde_json::to_vec_pretty(record)?;
    let mut temp = NamedTempFile::new_in(parent).map_err(io_error)?;
    temp.write_all(&payload).map_err(io_error)?;
    temp.as_file().sync_all().map_err(io_error)?;
    temp.persist(path).map_err(|err| io_error(err.error))?;
    Ok(())
}
