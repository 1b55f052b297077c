use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use termkeep_protocol::SessionId;

/// What the client remembers about one terminal tab between page loads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabIdentity {
    pub name: String,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_session_id: Option<SessionId>,
}

impl TabIdentity {
    pub fn new(name: impl Into<String>, order: u32) -> Self {
        Self {
            name: name.into(),
            order,
            server_session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.server_session_id = Some(session_id.into());
        self
    }
}

/// Durable per-workspace storage of tab identities.
pub trait TabStore {
    /// Tabs sorted by `order`. An empty store yields an empty list.
    fn load(&self) -> Result<Vec<TabIdentity>>;
    fn save(&self, tabs: &[TabIdentity]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTabStore {
    tabs: Mutex<Vec<TabIdentity>>,
}

impl MemoryTabStore {
    pub fn new(tabs: Vec<TabIdentity>) -> Self {
        Self {
            tabs: Mutex::new(tabs),
        }
    }
}

impl TabStore for MemoryTabStore {
    fn load(&self) -> Result<Vec<TabIdentity>> {
        let mut tabs = self.tabs.lock().unwrap_or_else(|p| p.into_inner()).clone();
        tabs.sort_by_key(|t| t.order);
        Ok(tabs)
    }

    fn save(&self, tabs: &[TabIdentity]) -> Result<()> {
        *self.tabs.lock().unwrap_or_else(|p| p.into_inner()) = tabs.to_vec();
        Ok(())
    }
}

/// Tab identities stored as `<dir>/<workspace>-<hash>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileTabStore {
    path: PathBuf,
}

impl JsonFileTabStore {
    pub fn new(dir: &Path, workspace_key: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", file_stem(workspace_key))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TabStore for JsonFileTabStore {
    fn load(&self) -> Result<Vec<TabIdentity>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut tabs: Vec<TabIdentity> = serde_json::from_str(&data)
            .with_context(|| format!("invalid tab store {}", self.path.display()))?;
        tabs.sort_by_key(|t| t.order);
        Ok(tabs)
    }

    fn save(&self, tabs: &[TabIdentity]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(tabs)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, data)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}

const KEY_HASH_BYTES: usize = 8;

/// Readable part of the key, with only filename-safe characters, plus a
/// digest of the full key so keys that sanitize alike stay apart.
fn file_stem(workspace_key: &str) -> String {
    let mut stem: String = workspace_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        stem.push_str("default");
    }
    stem.push('-');
    let digest = Sha256::digest(workspace_key.as_bytes());
    for byte in &digest[..KEY_HASH_BYTES] {
        let _ = write!(stem, "{byte:02x}");
    }
    stem
}
