//! Read-only view of the photographer/event storage layout.
//!
//! ```text
//! <events>/photographers.json            [{ "id": ... }]
//! <events>/<photographer>/events.json    [{ "id": ..., "code": ... }]
//! <events>/<photographer>/<event>/       event root (see `corpus`)
//! ```

use crate::access::{constant_time_eq, AccessControl};
use crate::corpus::{list_event_corpus, list_flat_corpus, CorpusEntry, CorpusError, CorpusResolver, CorpusScope};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const PHOTOGRAPHERS_FILE: &str = "photographers.json";
pub const EVENTS_FILE: &str = "events.json";

#[derive(Debug, Deserialize)]
struct PhotographerRecord {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    id: String,
    code: String,
}

/// A registered event and where its photos live.
#[derive(Clone)]
pub struct EventLocation {
    pub event_id: String,
    pub photographer_id: String,
    pub root: PathBuf,
    code: String,
}

/// Resolves scopes and access codes against the on-disk event registry.
#[derive(Debug, Clone)]
pub struct EventDirectory {
    events_dir: PathBuf,
    database_dir: PathBuf,
}

impl EventDirectory {
    pub fn new(events_dir: impl Into<PathBuf>, database_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_dir: events_dir.into(),
            database_dir: database_dir.into(),
        }
    }

    /// Look up an event by id across all photographers.
    pub fn find_event(&self, event_id: &str) -> Result<Option<EventLocation>, CorpusError> {
        let photographers: Vec<PhotographerRecord> =
            read_registry(&self.events_dir.join(PHOTOGRAPHERS_FILE))?;

        for photographer in photographers {
            let photographer_dir = self.events_dir.join(&photographer.id);
            let events: Vec<EventRecord> = read_registry(&photographer_dir.join(EVENTS_FILE))?;
            if let Some(event) = events.into_iter().find(|e| e.id == event_id) {
                return Ok(Some(EventLocation {
                    root: photographer_dir.join(&event.id),
                    event_id: event.id,
                    photographer_id: photographer.id,
                    code: event.code,
                }));
            }
        }

        Ok(None)
    }
}

/// A missing registry file is an empty registry.
fn read_registry<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CorpusError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw).map_err(|e| CorpusError::Registry {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

impl AccessControl for EventDirectory {
    fn check(&self, event_id: &str, code: &str) -> bool {
        match self.find_event(event_id) {
            Ok(Some(event)) => constant_time_eq(&event.code, code),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "event registry unreadable; denying access");
                false
            }
        }
    }
}

impl CorpusResolver for EventDirectory {
    fn resolve(&self, scope: &CorpusScope) -> Result<Vec<CorpusEntry>, CorpusError> {
        match scope {
            CorpusScope::Event { event_id, folder } => {
                let event = self
                    .find_event(event_id)?
                    .ok_or_else(|| CorpusError::EventNotFound(event_id.clone()))?;
                tracing::debug!(
                    event_id = %event.event_id,
                    photographer = %event.photographer_id,
                    "resolving event corpus"
                );
                Ok(list_event_corpus(&event.root, folder))
            }
            CorpusScope::Database => Ok(list_flat_corpus(&self.database_dir)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::FolderSelector;
    use tempfile::TempDir;

    fn registry() -> (TempDir, EventDirectory) {
        let dir = TempDir::new().unwrap();
        let events = dir.path().join("events");
        std::fs::create_dir_all(events.join("p1/ev1/photos")).unwrap();
        std::fs::create_dir_all(events.join("p2/ev2/folders/day1")).unwrap();
        std::fs::create_dir_all(dir.path().join("database")).unwrap();
        std::fs::write(
            events.join(PHOTOGRAPHERS_FILE),
            r#"[{"id": "p1", "username": "ana"}, {"id": "p2", "username": "bo"}]"#,
        )
        .unwrap();
        std::fs::write(
            events.join("p1").join(EVENTS_FILE),
            r#"[{"id": "ev1", "code": "111111", "name": "Wedding"}]"#,
        )
        .unwrap();
        std::fs::write(
            events.join("p2").join(EVENTS_FILE),
            r#"[{"id": "ev2", "code": "222222"}]"#,
        )
        .unwrap();
        std::fs::write(events.join("p1/ev1/photos/a.jpg"), b"").unwrap();
        std::fs::write(events.join("p2/ev2/folders/day1/b.png"), b"").unwrap();
        std::fs::write(dir.path().join("database/x.jpeg"), b"").unwrap();

        let directory = EventDirectory::new(events, dir.path().join("database"));
        (dir, directory)
    }

    #[test]
    fn test_find_event_across_photographers() {
        let (_dir, events) = registry();
        let ev2 = events.find_event("ev2").unwrap().unwrap();
        assert_eq!(ev2.photographer_id, "p2");
        assert!(ev2.root.ends_with("p2/ev2"));
        // Extra registry fields such as "name" are ignored.
        assert_eq!(events.find_event("ev1").unwrap().unwrap().event_id, "ev1");
        assert!(events.find_event("nope").unwrap().is_none());
    }

    #[test]
    fn test_access_check() {
        let (_dir, events) = registry();
        assert!(events.check("ev1", "111111"));
        assert!(!events.check("ev1", "222222"));
        assert!(!events.check("ev1", ""));
        assert!(!events.check("missing", "111111"));
    }

    #[test]
    fn test_resolve_scopes() {
        let (_dir, events) = registry();
        let ev2 = events
            .resolve(&CorpusScope::Event {
                event_id: "ev2".into(),
                folder: FolderSelector::All,
            })
            .unwrap();
        assert_eq!(ev2.len(), 1);
        assert_eq!(ev2[0].filename(), "b.png");
        assert_eq!(ev2[0].folder.as_str(), "day1");

        let db = events.resolve(&CorpusScope::Database).unwrap();
        assert_eq!(db.len(), 1);
        assert!(db[0].folder.is_legacy());

        let missing = events.resolve(&CorpusScope::Event {
            event_id: "ghost".into(),
            folder: FolderSelector::All,
        });
        assert!(matches!(missing, Err(CorpusError::EventNotFound(id)) if id == "ghost"));
    }

    #[test]
    fn test_empty_and_corrupt_registry() {
        let dir = TempDir::new().unwrap();
        let events = EventDirectory::new(dir.path(), dir.path().join("db"));
        assert!(events.find_event("any").unwrap().is_none());

        std::fs::write(dir.path().join(PHOTOGRAPHERS_FILE), "{not json").unwrap();
        assert!(matches!(
            events.find_event("any"),
            Err(CorpusError::Registry { .. })
        ));
        assert!(!events.check("any", "000000"));
    }
}
