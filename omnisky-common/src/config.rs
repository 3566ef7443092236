//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the root folder
pub const ROOT_ENV_VAR: &str = "OMNISKY_ROOT";

/// Environment variable pointing at an explicit TOML config file
pub const CONFIG_ENV_VAR: &str = "OMNISKY_CONFIG";

/// Config file name searched in the platform config directories
pub const CONFIG_FILE_NAME: &str = "omnisky.toml";

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_root: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_root {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Locate the TOML config file
///
/// Explicit path (CLI) → `OMNISKY_CONFIG` → `~/.config/omnisky/omnisky.toml`
/// → `/etc/omnisky/omnisky.toml`. Returns `None` when nothing exists; running
/// on defaults is allowed.
pub fn locate_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("omnisky").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/omnisky").join(CONFIG_FILE_NAME);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("omnisky"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\omnisky"))
    } else if cfg!(any(target_os = "linux", target_os = "macos")) {
        dirs::data_local_dir()
            .map(|d| d.join("omnisky"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/omnisky"))
    } else {
        PathBuf::from("./omnisky_data")
    }
}

/// Load a TOML config file into `T`
///
/// A missing file yields `T::default()`; a malformed file is an error.
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Write a TOML config atomically (temp file + rename)
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// On-disk layout below the resolved root folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.root.join("omnisky.db")
    }

    /// Temporary download directory; one file per in-flight artifact
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp_cache")
    }

    /// Observability directory (status snapshot, event log, control file)
    pub fn obs_dir(&self) -> PathBuf {
        self.root.join("obs")
    }

    /// Raw files whose result could not be persisted
    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn status_file(&self) -> PathBuf {
        self.obs_dir().join("status.json")
    }

    pub fn event_log_file(&self) -> PathBuf {
        self.obs_dir().join("event_log.jsonl")
    }

    pub fn control_file(&self) -> PathBuf {
        self.obs_dir().join("control.json")
    }

    /// Create every directory of the layout if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.temp_dir(),
            self.obs_dir(),
            self.quarantine_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        root_folder: Option<PathBuf>,
        level: String,
    }

    #[test]
    #[serial]
    fn test_cli_argument_wins() {
        std::env::set_var(ROOT_ENV_VAR, "/from/env");
        let resolved = resolve_root_folder(
            Some(Path::new("/from/cli")),
            ROOT_ENV_VAR,
            Some(Path::new("/from/toml")),
        );
        std::env::remove_var(ROOT_ENV_VAR);
        assert_eq!(resolved, PathBuf::from("/from/cli"));
    }

    #[test]
    #[serial]
    fn test_env_beats_toml() {
        std::env::set_var(ROOT_ENV_VAR, "/from/env");
        let resolved = resolve_root_folder(None, ROOT_ENV_VAR, Some(Path::new("/from/toml")));
        std::env::remove_var(ROOT_ENV_VAR);
        assert_eq!(resolved, PathBuf::from("/from/env"));
    }

    #[test]
    #[serial]
    fn test_toml_then_default() {
        std::env::remove_var(ROOT_ENV_VAR);
        let resolved = resolve_root_folder(None, ROOT_ENV_VAR, Some(Path::new("/from/toml")));
        assert_eq!(resolved, PathBuf::from("/from/toml"));

        let fallback = resolve_root_folder(None, ROOT_ENV_VAR, None);
        assert!(fallback.ends_with("omnisky") || fallback.ends_with("omnisky_data"));
    }

    #[test]
    fn test_missing_config_yields_default() {
        let dir = TempDir::new().unwrap();
        let loaded: Sample = load_toml_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let config = Sample {
            root_folder: Some(PathBuf::from("/data/omnisky")),
            level: "debug".to_string(),
        };

        write_toml_config(&config, &path).unwrap();
        let loaded: Sample = load_toml_config(&path).unwrap();

        assert_eq!(loaded, config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "level = [unterminated").unwrap();

        let result: Result<Sample> = load_toml_config(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_layout_creates_directories() {
        let dir = TempDir::new().unwrap();
        let layout = RootLayout::new(dir.path().join("root"));
        layout.ensure_directories().unwrap();

        assert!(layout.temp_dir().is_dir());
        assert!(layout.obs_dir().is_dir());
        assert!(layout.quarantine_dir().is_dir());
        assert_eq!(layout.status_file().parent(), Some(layout.obs_dir().as_path()));
    }
}
