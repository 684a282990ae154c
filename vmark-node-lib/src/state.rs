//! On-disk node state under `~/.vmark`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Locations of the node's persistent files.
#[derive(Debug, Clone)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    /// State directory in the invoking user's home, created if missing.
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| NodeError::Validation("cannot determine home directory".into()))?;
        Self::at(home.join(".vmark"))
    }

    pub fn at(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn register_file(&self) -> PathBuf {
        self.dir.join("register.json")
    }

    pub fn forwarding_table_file(&self) -> PathBuf {
        self.dir.join("forwarding_table.json")
    }
}

/// Registration state persisted in `register.json`.
///
/// `vmark_id` is assigned by the controller during the handshake and is the
/// sole authentication identifier on the API afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterState {
    pub auth_token: String,
    pub registered: bool,
    pub node_id: String,
    pub vmark_id: Option<String>,
    pub listen_ip: Option<String>,
    pub port: Option<u16>,
}

impl RegisterState {
    pub fn load(paths: &StatePaths) -> Result<Option<Self>> {
        let path = paths.register_file();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, paths: &StatePaths) -> Result<()> {
        write_json_atomic(&paths.register_file(), self)
    }

    pub fn is_registered(&self) -> bool {
        self.registered && self.vmark_id.is_some()
    }
}

/// Write indented JSON through a temp file in the same directory so a
/// concurrent load never observes a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `vmark-node-<hostname>`, the identity reported to the controller.
pub fn node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("vmark-node-{host}")
}

/// Seconds since the Unix epoch as a float, the timestamp format the
/// controller expects in API responses and result records.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::at(dir.path().to_path_buf()).unwrap();

        assert!(RegisterState::load(&paths).unwrap().is_none());

        let state = RegisterState {
            auth_token: "tok".into(),
            registered: true,
            node_id: "vmark-node-test".into(),
            vmark_id: Some("vm-1".into()),
            listen_ip: Some("127.0.0.1".into()),
            port: Some(8080),
        };
        state.save(&paths).unwrap();

        let loaded = RegisterState::load(&paths).unwrap().unwrap();
        assert!(loaded.is_registered());
        assert_eq!(loaded.vmark_id.as_deref(), Some("vm-1"));
    }

    #[test]
    fn test_unregistered_without_vmark_id() {
        let state = RegisterState {
            auth_token: "tok".into(),
            registered: true,
            node_id: "n".into(),
            vmark_id: None,
            listen_ip: None,
            port: None,
        };
        assert!(!state.is_registered());
    }
}
