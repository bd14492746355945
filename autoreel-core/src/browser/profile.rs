use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::{BrowserError, BrowserResult};

const MARKER: &str = ".autoreel_last_used";

/// Persistent user-data directories, kept across runs so logins survive.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates the profile directory if needed and stamps it as used.
    pub async fn prepare(&self, profile: &Path) -> BrowserResult<PathBuf> {
        let path = if profile.is_absolute() {
            profile.to_path_buf()
        } else {
            self.base_dir.join(profile)
        };
        fs::create_dir_all(&path)
            .await
            .map_err(|err| BrowserError::Profile(format!("failed to create profile dir: {err}")))?;
        let mut file = fs::File::create(path.join(MARKER)).await.map_err(|err| {
            BrowserError::Profile(format!("failed to write profile marker: {err}"))
        })?;
        file.write_all(Utc::now().to_rfc3339().as_bytes())
            .await
            .map_err(|err| BrowserError::Profile(format!("failed to update profile marker: {err}")))?;
        Ok(path)
    }

    pub async fn last_used(&self, profile: &Path) -> Option<DateTime<Utc>> {
        let path = if profile.is_absolute() {
            profile.to_path_buf()
        } else {
            self.base_dir.join(profile)
        };
        let raw = fs::read_to_string(path.join(MARKER)).await.ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
