use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{liveness::LivenessPolicy, router::TriggerTimings, tools::ToolCommands};

pub const DEFAULT_DEVICE_ID: &str = "openaps://apstwo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Nightscout base URL, e.g. `https://my.nightscout.example`.
    pub host: Option<String>,
    pub api_secret: Option<String>,
    pub device_id: String,
    /// The rig's working directory: tools run here and artifacts land here.
    pub workdir: PathBuf,
    pub history_hours: u32,
    pub liveness: LivenessPolicy,
    pub triggers: TriggerTimings,
    pub tools: ToolCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: None,
            api_secret: None,
            device_id: DEFAULT_DEVICE_ID.into(),
            workdir: PathBuf::from("."),
            history_hours: 24,
            liveness: LivenessPolicy::default(),
            triggers: TriggerTimings::default(),
            tools: ToolCommands::default(),
        }
    }
}

impl Settings {
    /// Host and secret; both are required to open a session.
    pub fn connection(&self) -> Result<(&str, &str)> {
        let Some(host) = self.host.as_deref().filter(|host| !host.is_empty()) else {
            bail!("no Nightscout host configured (NIGHTSCOUT_HOST or --host)");
        };
        let Some(secret) = self.api_secret.as_deref().filter(|secret| !secret.is_empty()) else {
            bail!("no API secret configured (API_SECRET or --api-secret)");
        };
        Ok((host, secret))
    }
}

/// Values supplied on the command line or through the environment. Each one
/// that is set wins over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub api_secret: Option<String>,
    pub device_id: Option<String>,
    pub workdir: Option<PathBuf>,
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Reads `path` if given. A missing file means defaults; a file that
    /// does not parse is an error.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let data = match &path {
            Some(path) if path.exists() => read_settings(path)?,
            Some(path) => {
                log::info!("{} not found, using default settings", path.display());
                Settings::default()
            }
            None => Settings::default(),
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn settings(&self) -> Settings {
        self.read().clone()
    }

    pub fn apply(&self, overrides: Overrides) {
        let mut guard = self.write();
        if let Some(host) = overrides.host {
            guard.host = Some(host);
        }
        if let Some(secret) = overrides.api_secret {
            guard.api_secret = Some(secret);
        }
        if let Some(device_id) = overrides.device_id {
            guard.device_id = device_id;
        }
        if let Some(workdir) = overrides.workdir {
            guard.workdir = workdir;
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_without_a_file() {
        let store = SettingsStore::open(None).unwrap();
        let settings = store.settings();

        assert_eq!(settings.device_id, "openaps://apstwo");
        assert_eq!(settings.history_hours, 24);
        assert_eq!(settings.liveness.hard_deadline(), Duration::from_secs(120));
        assert_eq!(settings.liveness.soft_poll(), Duration::from_secs(60));
        assert_eq!(settings.liveness.threshold, 7);
        assert_eq!(settings.triggers.meal_throttle_secs, 15);
        assert_eq!(settings.tools.openaps, "openaps");
        assert!(settings.connection().is_err());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsbridge.json");
        fs::write(
            &path,
            r#"{"device_id": "openaps://rig2", "liveness": {"threshold": 3}, "tools": {"ns_status": "ns-status"}}"#,
        )
        .unwrap();

        let settings = SettingsStore::open(Some(path)).unwrap().settings();

        assert_eq!(settings.device_id, "openaps://rig2");
        assert_eq!(settings.liveness.threshold, 3);
        assert_eq!(settings.liveness.trip_step, 8);
        assert_eq!(settings.tools.ns_status, "ns-status");
        assert_eq!(settings.tools.format_treatments, "mm-format-ns-treatments");
        assert_eq!(settings.triggers.status_debounce_secs, 10);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsbridge.json");
        fs::write(&path, "{not json").unwrap();

        assert!(SettingsStore::open(Some(path)).is_err());
    }

    #[test]
    fn overrides_win_over_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsbridge.json");
        fs::write(&path, r#"{"host": "https://file.example", "api_secret": "from-file"}"#).unwrap();
        let store = SettingsStore::open(Some(path)).unwrap();

        store.apply(Overrides {
            host: Some("https://cli.example".into()),
            workdir: Some(PathBuf::from("/root/myopenaps")),
            ..Overrides::default()
        });
        let settings = store.settings();
        assert_eq!(
            settings.connection().unwrap(),
            ("https://cli.example", "from-file")
        );
        assert_eq!(settings.workdir, PathBuf::from("/root/myopenaps"));
        assert_eq!(settings.device_id, DEFAULT_DEVICE_ID);
    }
}
