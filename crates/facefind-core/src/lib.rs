//! facefind-core: face matching and result caching for event photo corpora.
//!
//! A Haar cascade finds faces, each face becomes a normalised 100x100
//! grayscale patch, and corpus images are ranked by their closest face to the
//! query. Ranked lists are held in a short-lived, token-addressed cache.

pub mod access;
pub mod cache;
pub mod corpus;
pub mod detector;
pub mod encoder;
pub mod events;
pub mod matcher;
pub mod types;

pub use access::AccessControl;
pub use cache::{CacheError, CachedMatches, MatchCache, MATCH_CACHE_TTL};
pub use corpus::{CorpusEntry, CorpusError, CorpusResolver, CorpusScope, FolderSelector};
pub use detector::{CascadeError, FaceRect, HaarCascade};
pub use encoder::{FaceEncoder, HaarEncoder};
pub use events::EventDirectory;
pub use matcher::{CorpusMatcher, MatchError, MatchOutcome};
pub use types::{CandidateError, FaceEncoding, FolderTag, MatchCandidate, MatchView, RankedMatchList};

use std::path::PathBuf;

/// Default data root: `$XDG_DATA_HOME/facefind`, else `~/.local/share/facefind`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind")
}

/// Cascade file looked up under the data root when none is configured.
pub const DEFAULT_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
