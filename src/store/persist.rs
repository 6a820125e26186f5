use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use filetime::FileTime;

/// Files the bridge writes for the rest of the rig to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Glucose,
    TempTargets,
    MealCarbs,
}

impl Artifact {
    pub fn relative_path(&self) -> &'static str {
        match self {
            Artifact::Glucose => "monitor/glucose.json",
            Artifact::TempTargets => "settings/temptargets.json",
            Artifact::MealCarbs => "monitor/carbhistory.json",
        }
    }
}

/// Destination for persisted views. `newest_ms` becomes the file's
/// modification time so consumers can judge staleness from metadata alone.
pub trait ArtifactSink: Send + Sync {
    fn write(&self, artifact: Artifact, body: &[u8], newest_ms: i64) -> Result<()>;
}

/// Writes artifacts under the rig's working directory.
pub struct FsArtifacts {
    root: PathBuf,
}

impl FsArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, artifact: Artifact) -> PathBuf {
        self.root.join(artifact.relative_path())
    }
}

impl ArtifactSink for FsArtifacts {
    fn write(&self, artifact: Artifact, body: &[u8], newest_ms: i64) -> Result<()> {
        let path = self.path_of(artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        stamp_mtime(&path, newest_ms)?;

        log::info!(
            "{} updated with timestamp {}",
            artifact.relative_path(),
            chrono::DateTime::from_timestamp_millis(newest_ms)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| newest_ms.to_string())
        );
        Ok(())
    }
}

fn stamp_mtime(path: &Path, newest_ms: i64) -> Result<()> {
    let secs = newest_ms.div_euclid(1000);
    let nanos = (newest_ms.rem_euclid(1000) * 1_000_000) as u32;
    let stamp = FileTime::from_unix_time(secs, nanos);
    filetime::set_file_times(path, stamp, stamp)
        .with_context(|| format!("Failed to set times on {}", path.display()))
}
