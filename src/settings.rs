use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use pickledb::PickleDb;
use pickledb::PickleDbDumpPolicy;
use pickledb::SerializationMethod;
use tracing::info;

pub const SAVE_FOLDER_KEY: &str = "SaveFolder";

const APP_DIR: &str = "teams-recordings-downloader";

/// Settings persisted between runs.
pub struct Settings {
    db: PickleDb,
}

impl Settings {
    /// `<config dir>/teams-recordings-downloader/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("settings.json"))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let db = if path.exists() {
            PickleDb::load(path, PickleDbDumpPolicy::AutoDump, SerializationMethod::Json)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?
        } else {
            PickleDb::new(path, PickleDbDumpPolicy::AutoDump, SerializationMethod::Json)
        };
        Ok(Self { db })
    }

    /// Returns the configured output directory, persisting the platform
    /// downloads directory on first use.
    pub fn save_folder(&mut self) -> anyhow::Result<PathBuf> {
        match self.db.get::<String>(SAVE_FOLDER_KEY) {
            Some(folder) if !folder.trim().is_empty() => absolute(PathBuf::from(folder)),
            _ => {
                let folder = absolute(default_save_folder())?;
                info!(path = %folder.display(), "Using default save folder");
                self.set_save_folder(&folder)?;
                Ok(folder)
            }
        }
    }

    pub fn set_save_folder<P: AsRef<Path>>(&mut self, folder: P) -> anyhow::Result<()> {
        let folder = absolute(folder.as_ref().to_path_buf())?;
        self.db
            .set(SAVE_FOLDER_KEY, &folder.to_string_lossy().into_owned())?;
        Ok(())
    }
}

fn default_save_folder() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

pub(crate) fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
