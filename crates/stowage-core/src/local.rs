//! Filesystem-backed store.
//!
//! Each group is a map of key to payload string, held in memory once touched
//! and persisted as one JSON object at `<root>/<group>.save`. Slashes in a
//! group name become directories. Saves only change memory; `flush` writes
//! every resident group.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PersistError;

type Group = BTreeMap<String, String>;

/// Group maps keyed by group name, loaded lazily from disk.
pub struct LocalStore {
    root: PathBuf,
    groups: Mutex<HashMap<String, Group>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!(root = %root.display(), "Using local storage");
        Self {
            root,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Set `key` in `group`, overwriting any previous value.
    pub async fn save(&self, group: &str, key: &str, value: String) -> Result<(), PersistError> {
        let mut groups = self.groups.lock().await;
        let entries = self.ensure_loaded(&mut groups, group).await?;
        entries.insert(key.to_string(), value);
        debug!(group, key, "Saved locally");
        Ok(())
    }

    /// Fetch the payload stored under `key` in `group`.
    pub async fn load(&self, group: &str, key: &str) -> Result<String, PersistError> {
        let mut groups = self.groups.lock().await;
        let entries = self.ensure_loaded(&mut groups, group).await?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| PersistError::NotFound {
                group: group.to_string(),
                key: key.to_string(),
            })
    }

    /// Write every resident group to its backing file. Returns how many
    /// groups were written.
    pub async fn flush(&self) -> Result<usize, PersistError> {
        let groups = self.groups.lock().await;
        for (group, entries) in groups.iter() {
            let path = self.group_path(group);
            write_atomic(&path, entries).await?;
            debug!(group = %group, path = %path.display(), keys = entries.len(), "Flushed group");
        }
        info!(count = groups.len(), "Flushed local storage");
        Ok(groups.len())
    }

    /// Names of the groups currently held in memory, sorted.
    pub async fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.root.join(format!("{group}.save"))
    }

    async fn ensure_loaded<'a>(
        &self,
        groups: &'a mut HashMap<String, Group>,
        group: &str,
    ) -> Result<&'a mut Group, PersistError> {
        if !groups.contains_key(group) {
            validate_group(group)?;
            let entries = self.read_group(group).await?;
            groups.insert(group.to_string(), entries);
        }
        Ok(groups.entry(group.to_string()).or_default())
    }

    async fn read_group(&self, group: &str) -> Result<Group, PersistError> {
        let path = self.group_path(group);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(group, "No backing file, starting empty");
                return Ok(Group::new());
            }
            Err(source) => return Err(PersistError::Io { path, source }),
        };

        let entries: Group = serde_json::from_str(&contents).map_err(|e| {
            PersistError::Serialization(format!("corrupt save file {}: {e}", path.display()))
        })?;
        debug!(group, keys = entries.len(), "Loaded group from disk");
        Ok(entries)
    }
}

/// Reject group names that would not map to a file under the root.
pub fn validate_group(group: &str) -> Result<(), PersistError> {
    let invalid = || PersistError::InvalidGroup(group.to_string());
    if group.is_empty() || group.split('/').any(str::is_empty) {
        return Err(invalid());
    }
    for component in Path::new(group).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    if group.split('/').any(|segment| segment == ".") {
        return Err(invalid());
    }
    Ok(())
}

/// Replace `path` with the JSON rendering of `entries` via a sibling temp
/// file and a rename.
async fn write_atomic(path: &Path, entries: &Group) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_at(parent))?;
    }

    let serialized = serde_json::to_string(entries)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path).await.map_err(io_at(&tmp_path))?;
    file.write_all(serialized.as_bytes())
        .await
        .map_err(io_at(&tmp_path))?;
    file.sync_all().await.map_err(io_at(&tmp_path))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(io_at(path)(e));
    }
    Ok(())
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError {
    let path = path.to_path_buf();
    move |source| PersistError::Io { path, source }
}
