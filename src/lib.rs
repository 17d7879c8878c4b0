use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use filetime::FileTime;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub mod auth;
pub mod browser;
pub mod graph;
pub mod settings;

use crate::graph::DriveItem;
use crate::graph::EntryKind;
use crate::graph::GraphClient;
use crate::graph::Team;
use crate::graph::GRAPH_BASE_URL;

/// Marks the drive root inside `parentReference.path`, e.g.
/// `/drives/b!xyz/root:/Recordings`.
const ROOT_MARKER: &str = "root:";

const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DownloadOutcome {
    Downloaded(PathBuf),
    AlreadyExists(PathBuf),
    Failed(PathBuf),
}

pub struct Downloader {
    /// Destination directory to mirror recordings into.
    dest: PathBuf,

    /// Number of worker threads, which bounds in-flight Graph requests.
    jobs: usize,

    graph: GraphClient,
}

impl Downloader {
    pub fn builder() -> DownloaderBuilder {
        DownloaderBuilder::default()
    }

    /// Scans every joined team and downloads recordings missing locally.
    /// Failures below the team listing are logged, not returned.
    pub fn download_all(&self) -> anyhow::Result<Vec<DownloadOutcome>> {
        let pool = ThreadPoolBuilder::new().num_threads(self.jobs).build()?;
        let teams = self.graph.joined_teams()?;
        info!(count = teams.len(), "Found joined teams");

        Ok(pool.install(|| {
            teams
                .par_iter()
                .flat_map_iter(|team| self.download_team(team))
                .collect()
        }))
    }

    fn download_team(&self, team: &Team) -> Vec<DownloadOutcome> {
        let name = team.name();
        match self.graph.drive_root(&team.id) {
            Ok(Some(root)) => {
                info!(team = name, "Scanning team files");
                self.scan_folder(&root.item_id, &root.drive_id, name)
            }
            Ok(None) => {
                info!(team = name, "Team has no files");
                Vec::new()
            }
            Err(err) => {
                error!(team = name, error = %err, "Failed to resolve the team's drive");
                Vec::new()
            }
        }
    }

    /// Walks `folder_id` and everything below it, downloading videos on the
    /// way. Returns once the whole subtree is done.
    pub fn scan_folder(
        &self,
        folder_id: &str,
        drive_id: &str,
        team_name: &str,
    ) -> Vec<DownloadOutcome> {
        let children = match self.graph.list_children(drive_id, folder_id) {
            Ok(children) => children,
            Err(err) => {
                error!(
                    team = team_name,
                    folder = folder_id,
                    error = %err,
                    "Failed to list folder"
                );
                return Vec::new();
            }
        };

        children
            .par_iter()
            .flat_map_iter(|item| -> Vec<DownloadOutcome> {
                match item.kind() {
                    EntryKind::Video => self
                        .download_recording(item, drive_id, team_name)
                        .into_iter()
                        .collect(),
                    EntryKind::Folder if !item.id.is_empty() => {
                        self.scan_folder(&item.id, drive_id, team_name)
                    }
                    _ => Vec::new(),
                }
            })
            .collect()
    }

    /// Downloads `item` unless it is already on disk. `None` means the item
    /// is not a download candidate (no name, or not under the drive root).
    pub fn download_recording(
        &self,
        item: &DriveItem,
        drive_id: &str,
        team_name: &str,
    ) -> Option<DownloadOutcome> {
        let Some(dest) = self.destination(item, team_name) else {
            debug!(id = item.id.as_str(), path = item.parent_path(), "Skipping entry");
            return None;
        };

        if dest.exists() {
            info!(path = %dest.display(), "Already exists");
            return Some(DownloadOutcome::AlreadyExists(dest));
        }

        if let Some(dir) = dest.parent() {
            if let Err(err) = fs::create_dir_all(dir) {
                error!(path = %dir.display(), error = %err, "Failed to create directory");
                return Some(DownloadOutcome::Failed(dest));
            }
        }

        info!(path = %dest.display(), "Downloading");
        match self.download(item, drive_id, &dest) {
            Ok(()) => {
                info!(path = %dest.display(), "Downloaded");
                Some(DownloadOutcome::Downloaded(dest))
            }
            Err(err) => {
                error!(
                    url = item.web_url.as_deref().unwrap_or_default(),
                    path = %dest.display(),
                    error = format!("{err:#}"),
                    "Failed to download"
                );
                Some(DownloadOutcome::Failed(dest))
            }
        }
    }

    fn destination(&self, item: &DriveItem, team_name: &str) -> Option<PathBuf> {
        let name = item.name.as_deref().filter(|name| !name.is_empty())?;
        let (_, relative) = item.parent_path()?.split_once(ROOT_MARKER)?;
        let relative = enclosed_path(relative)?;

        Some(
            self.dest
                .join(sanitize(team_name))
                .join(relative)
                .join(sanitize(name)),
        )
    }

    fn download(&self, item: &DriveItem, drive_id: &str, dest: &Path) -> anyhow::Result<()> {
        let dir = dest.parent().context("Destination has no parent directory")?;

        // Only a complete download is renamed onto the destination.
        let mut part = NamedTempFile::new_in(dir)?;
        self.graph.fetch_content(drive_id, &item.id, &mut part)?;
        part.persist(dest).map_err(|err| err.error)?;

        if let Some(modified) = item.last_modified() {
            let time = FileTime::from_unix_time(
                modified.timestamp(),
                modified.timestamp_subsec_nanos(),
            );
            if let Err(err) = filetime::set_file_times(dest, time, time) {
                warn!(path = %dest.display(), error = %err, "Failed to set file times");
            }
        }
        Ok(())
    }
}

/// Turns the part of a drive path after the root marker into a relative
/// local path. Rejects paths that would climb out of the destination.
fn enclosed_path(relative: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for segment in relative.split('/') {
        let segment = urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment));
        match segment.as_ref() {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\0') => return None,
            s => path.push(sanitize(s)),
        }
    }
    Some(path)
}

/// Makes a single path component valid on the host file system. Only
/// characters the host rejects are rewritten.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if is_reserved(c) { '_' } else { c })
        .collect();

    // Windows silently drops trailing dots and spaces.
    let cleaned = if cfg!(windows) {
        cleaned.trim_end_matches(|c| c == '.' || c == ' ').to_string()
    } else {
        cleaned
    };

    match cleaned.as_str() {
        "" | "." | ".." => String::from("_"),
        _ => cleaned,
    }
}

#[cfg(windows)]
fn is_reserved(c: char) -> bool {
    matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

#[cfg(not(windows))]
fn is_reserved(c: char) -> bool {
    c == '/' || c == '\0'
}

#[derive(Debug)]
pub struct DownloaderBuilder {
    dest: PathBuf,
    base_url: String,
    token: String,
    jobs: usize,
}

impl DownloaderBuilder {
    pub fn dest<P: Into<PathBuf>>(mut self, dest: P) -> Self {
        self.dest = dest.into();
        self
    }

    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = token.into();
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn build(self) -> anyhow::Result<Downloader> {
        Ok(Downloader {
            dest: settings::absolute(self.dest)?,
            jobs: self.jobs,
            graph: GraphClient::new(self.base_url, &self.token)?,
        })
    }
}

impl Default for DownloaderBuilder {
    fn default() -> Self {
        Self {
            dest: PathBuf::from("recordings"),
            base_url: String::from(GRAPH_BASE_URL),
            token: String::new(),
            jobs: DEFAULT_JOBS,
        }
    }
}
