//! Corpus resolution: which image files a match runs against.
//!
//! Event layout, relative to an event's root directory:
//!
//! ```text
//! photos/            legacy unfoldered photos (the "default" folder)
//! folders/<name>/    named folders
//! ```

use crate::types::{is_permitted_image, FolderTag};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LEGACY_PHOTOS_DIR: &str = "photos";
pub const FOLDERS_DIR: &str = "folders";

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry {path}: {reason}")]
    Registry { path: String, reason: String },
}

/// Which folders of an event to search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderSelector {
    All,
    Only(FolderTag),
}

impl FolderSelector {
    /// Parse a user-supplied folder filter. Empty or `all` selects everything.
    pub fn parse(raw: &str) -> Self {
        let folder = raw.trim();
        if folder.is_empty() || folder.eq_ignore_ascii_case("all") {
            FolderSelector::All
        } else {
            FolderSelector::Only(FolderTag::from_name(folder))
        }
    }
}

impl FolderTag {
    /// Tag for a user-supplied folder name, lowercased. Unsafe or empty names
    /// fall back to the default folder.
    pub fn from_name(name: &str) -> Self {
        let clean = sanitize_folder_name(name).to_lowercase();
        if clean == Self::DEFAULT_NAME {
            FolderTag::Legacy
        } else {
            FolderTag::Named(clean)
        }
    }
}

/// Keep only alphanumerics, `-` and `_`; empty results become `"default"`.
pub fn sanitize_folder_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        FolderTag::DEFAULT_NAME.to_string()
    } else {
        cleaned
    }
}

/// The set of images a match operation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusScope {
    Event {
        event_id: String,
        folder: FolderSelector,
    },
    /// The flat global database directory.
    Database,
}

/// One candidate image, tagged with the folder it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub folder: FolderTag,
    pub path: PathBuf,
}

impl CorpusEntry {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Lists the images in a scope, in enumeration order.
pub trait CorpusResolver: Send + Sync {
    fn resolve(&self, scope: &CorpusScope) -> Result<Vec<CorpusEntry>, CorpusError>;
}

impl<F> CorpusResolver for F
where
    F: Fn(&CorpusScope) -> Result<Vec<CorpusEntry>, CorpusError> + Send + Sync,
{
    fn resolve(&self, scope: &CorpusScope) -> Result<Vec<CorpusEntry>, CorpusError> {
        self(scope)
    }
}

fn sort_case_insensitive(names: &mut [String]) {
    names.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
}

/// Permitted image files directly inside `dir`, sorted case-insensitively.
///
/// A missing directory is empty; an unreadable one is logged and skipped.
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable corpus directory");
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| is_permitted_image(name))
        .collect();
    sort_case_insensitive(&mut names);
    names.into_iter().map(|name| dir.join(name)).collect()
}

/// Names of the named-folder directories under an event, sorted case-insensitively.
pub fn list_event_folders(event_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(event_root.join(FOLDERS_DIR)) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    sort_case_insensitive(&mut names);
    names
}

/// Resolve an event's corpus: the legacy area first, then named folders.
///
/// A named directory called `default` is only searched when the default
/// folder is requested explicitly.
pub fn list_event_corpus(event_root: &Path, selector: &FolderSelector) -> Vec<CorpusEntry> {
    let mut dirs: Vec<(FolderTag, PathBuf)> = Vec::new();

    let wants_default = matches!(selector, FolderSelector::Only(FolderTag::Legacy));
    if matches!(selector, FolderSelector::All) || wants_default {
        dirs.push((FolderTag::Legacy, event_root.join(LEGACY_PHOTOS_DIR)));
    }

    for name in list_event_folders(event_root) {
        let keep = if name.eq_ignore_ascii_case(FolderTag::DEFAULT_NAME) {
            wants_default
        } else {
            match selector {
                FolderSelector::All => true,
                FolderSelector::Only(FolderTag::Named(wanted)) => name.to_lowercase() == wanted.to_lowercase(),
                FolderSelector::Only(FolderTag::Legacy) => false,
            }
        };
        if keep {
            let path = event_root.join(FOLDERS_DIR).join(&name);
            dirs.push((FolderTag::Named(name), path));
        }
    }

    dirs.into_iter()
        .flat_map(|(folder, dir)| {
            list_images(&dir)
                .into_iter()
                .map(move |path| CorpusEntry {
                    folder: folder.clone(),
                    path,
                })
        })
        .collect()
}

/// Every permitted image in a flat directory, tagged as unfoldered.
pub fn list_flat_corpus(dir: &Path) -> Vec<CorpusEntry> {
    list_images(dir)
        .into_iter()
        .map(|path| CorpusEntry {
            folder: FolderTag::Legacy,
            path,
        })
        .collect()
}
