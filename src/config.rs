//! User settings stored under the platform config directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// OpenFOAM environment script sourced before every command.
    pub openfoam_bashrc: Option<PathBuf>,
    /// Directory holding the OpenFOAM executables.
    pub tool_dir: Option<PathBuf>,
    /// Directory `wmake` installs the solvers into.
    pub user_app_dir: Option<PathBuf>,
    /// Directory with one template tree per module, used by `create`.
    pub templates_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub grace_timeout: Duration,
    pub output_buffer_lines: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openfoam_bashrc: None,
            tool_dir: None,
            user_app_dir: None,
            templates_dir: None,
            grace_timeout: battery_foam::solver::DEFAULT_GRACE,
            output_buffer_lines: battery_foam::process::DEFAULT_CAPACITY,
        }
    }
}

/// `<config dir>/battery-foam/settings.json`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("battery-foam").join("settings.json"))
}

/// Load settings from `path`, or from the default location when `None`.
/// A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_path() {
            Some(p) => p,
            None => return Ok(Settings::default()),
        },
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&text).with_context(|| format!("invalid settings in {}", path.display()))
}
