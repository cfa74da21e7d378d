use crate::engine::{EngineError, EngineHandle};
use facefind_core::types::is_permitted_image;
use facefind_core::{
    AccessControl, CacheError, CachedMatches, CorpusError, CorpusScope, FolderSelector, MatchCache,
    MatchError, MatchOutcome, MatchView,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.facefind.Matcher1";
pub const OBJECT_PATH: &str = "/org/facefind/Matcher1";

/// D-Bus interface for the facefind matching daemon.
///
/// Bus name: org.facefind.Matcher1
/// Object path: /org/facefind/Matcher1
pub struct MatcherService {
    engine: EngineHandle,
    cache: Arc<MatchCache>,
    access: Arc<dyn AccessControl>,
    cascade_path: PathBuf,
}

impl MatcherService {
    pub fn new(
        engine: EngineHandle,
        cache: Arc<MatchCache>,
        access: Arc<dyn AccessControl>,
        cascade_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            cache,
            access,
            cascade_path,
        }
    }

    fn authorize(&self, event_id: &str, code: &str) -> fdo::Result<()> {
        if self.access.check(event_id, code) {
            Ok(())
        } else {
            tracing::info!(event_id, "access code rejected");
            Err(fdo::Error::AccessDenied("invalid event id or access code".into()))
        }
    }
}

#[interface(name = "org.facefind.Matcher1")]
impl MatcherService {
    /// Match a selfie against an event (optionally one folder) and cache the ranking.
    async fn match_event(
        &self,
        event_id: &str,
        folder: &str,
        code: &str,
        selfie_path: &str,
    ) -> fdo::Result<String> {
        let selfie = selfie(selfie_path)?;
        self.authorize(event_id, code)?;

        let scope = CorpusScope::Event {
            event_id: event_id.to_string(),
            folder: FolderSelector::parse(folder),
        };
        tracing::info!(event_id, folder, "match_event requested");

        let outcome = self
            .engine
            .match_scope(selfie, scope.clone())
            .await
            .map_err(to_fdo)?;

        let mut response = best_json(&outcome);
        response["matches"] = matches_json(&outcome.matches.views());
        let token = self.cache.store(scope, code, outcome.matches);
        response["match_token"] = Value::String(token);
        Ok(response.to_string())
    }

    /// Find the single closest image in the global database. Not cached.
    async fn match_database(&self, selfie_path: &str) -> fdo::Result<String> {
        let selfie = selfie(selfie_path)?;
        tracing::info!("match_database requested");

        let outcome = self
            .engine
            .match_scope(selfie, CorpusScope::Database)
            .await
            .map_err(to_fdo)?;

        let view = MatchView::from(&outcome.best);
        Ok(json!({
            "best_match": view.filename,
            "confidence": view.confidence,
        })
        .to_string())
    }

    /// Read back a cached ranking by token.
    async fn get_matches(
        &self,
        event_id: &str,
        folder: &str,
        token: &str,
        code: &str,
    ) -> fdo::Result<String> {
        self.authorize(event_id, code)?;

        let scope = CorpusScope::Event {
            event_id: event_id.to_string(),
            folder: FolderSelector::parse(folder),
        };
        let cached = self
            .cache
            .retrieve(&scope, code, token)
            .map_err(cache_to_fdo)?;

        Ok(cached_json(&cached).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "cascade": self.cascade_path.display().to_string(),
            "cached_match_lists": self.cache.len(),
            "scan_threads": rayon::current_num_threads(),
        })
        .to_string())
    }
}

fn selfie(selfie_path: &str) -> fdo::Result<PathBuf> {
    let path = Path::new(selfie_path);
    if !is_permitted_image(path) {
        return Err(fdo::Error::InvalidArgs(
            "selfie must be a .jpg, .jpeg or .png file".into(),
        ));
    }
    Ok(path.to_path_buf())
}

fn best_json(outcome: &MatchOutcome) -> Value {
    let best = MatchView::from(&outcome.best);
    json!({
        "best_match": best.filename,
        "best_folder": best.folder,
        "best_legacy": best.legacy,
        "confidence": best.confidence,
    })
}

fn matches_json(views: &[MatchView<'_>]) -> Value {
    serde_json::to_value(views).unwrap_or_else(|_| Value::Array(Vec::new()))
}

fn cached_json(cached: &CachedMatches) -> Value {
    json!({
        "matches": matches_json(&cached.matches.views()),
        "created_at": cached.created_at.to_rfc3339(),
    })
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Match(MatchError::NoFaceDetected) => {
            fdo::Error::InvalidArgs("no face detected in selfie".into())
        }
        EngineError::Match(MatchError::EmptyCorpus) => {
            fdo::Error::Failed("no faces found in the searched photos".into())
        }
        EngineError::Match(MatchError::Corpus(CorpusError::EventNotFound(_))) => {
            fdo::Error::FileNotFound("event not found".into())
        }
        EngineError::Match(MatchError::Corpus(e)) => {
            tracing::warn!(error = %e, "corpus unavailable");
            fdo::Error::IOError(e.to_string())
        }
        EngineError::ChannelClosed => fdo::Error::Failed("matching engine unavailable".into()),
    }
}

fn cache_to_fdo(err: CacheError) -> fdo::Error {
    match err {
        CacheError::NotFound => fdo::Error::FileNotFound("match results not found or expired".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{ev1, test_engine};
    use facefind_core::EventDirectory;

    struct FixedCodes;

    impl AccessControl for FixedCodes {
        fn check(&self, event_id: &str, code: &str) -> bool {
            event_id == "ev1" && code == "424242"
        }
    }

    fn service() -> MatcherService {
        MatcherService::new(
            test_engine(),
            Arc::new(MatchCache::new()),
            Arc::new(FixedCodes),
            PathBuf::from("/opt/cascade.xml"),
        )
    }

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_match_event_then_read_back() {
        let service = service();
        let response = parse(
            &service
                .match_event("ev1", "", "424242", "/uploads/selfie.jpg")
                .await
                .unwrap(),
        );

        assert_eq!(response["best_match"], "near.jpg");
        assert_eq!(response["best_folder"], "default");
        assert_eq!(response["best_legacy"], true);
        assert_eq!(response["confidence"], 0.9091);
        assert_eq!(response["matches"][1]["filename"], "far.jpg");
        assert_eq!(response["matches"][1]["folder"], "day1");
        assert_eq!(response["matches"][1]["legacy"], false);
        assert_eq!(response["matches"][1]["confidence"], 0.7692);

        let token = response["match_token"].as_str().unwrap();
        let cached = parse(&service.get_matches("ev1", "all", token, "424242").await.unwrap());
        assert_eq!(cached["matches"], response["matches"]);
        assert!(cached["created_at"].as_str().is_some());
        assert_eq!(service.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_read_back_rejections() {
        let service = service();
        let token = service.cache.store(ev1(), "424242", Default::default());

        assert!(matches!(
            service.get_matches("ev1", "", &token, "000000").await,
            Err(fdo::Error::AccessDenied(_))
        ));
        assert!(matches!(
            service.get_matches("ev1", "", "0123456789abcdef", "424242").await,
            Err(fdo::Error::FileNotFound(_))
        ));
        assert!(matches!(
            service.get_matches("ev1", "day1", &token, "424242").await,
            Err(fdo::Error::FileNotFound(_))
        ));
        assert!(service.get_matches("ev1", "", &token, "424242").await.is_ok());
    }

    #[tokio::test]
    async fn test_match_event_rejections() {
        let service = service();
        assert!(matches!(
            service.match_event("ev1", "", "424242", "/uploads/selfie.gif").await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            service.match_event("ev1", "", "111111", "/uploads/selfie.jpg").await,
            Err(fdo::Error::AccessDenied(_))
        ));
        assert!(matches!(
            service.match_event("ev1", "", "424242", "/uploads/blank.jpg").await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert!(service.cache.is_empty());
    }

    #[tokio::test]
    async fn test_match_database_is_not_cached() {
        let service = service();
        assert!(matches!(
            service.match_database("/uploads/selfie.png").await,
            Err(fdo::Error::Failed(_))
        ));
        assert!(service.cache.is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let status = parse(&service().status().await.unwrap());
        assert_eq!(status["cascade"], "/opt/cascade.xml");
        assert_eq!(status["cached_match_lists"], 0);
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_event_directory_gates_access() {
        let dir = tempfile::TempDir::new().unwrap();
        let events = dir.path().join("events");
        std::fs::create_dir_all(events.join("p1/ev1/photos")).unwrap();
        std::fs::write(events.join("photographers.json"), r#"[{"id": "p1"}]"#).unwrap();
        std::fs::write(
            events.join("p1/events.json"),
            r#"[{"id": "ev1", "code": "424242"}]"#,
        )
        .unwrap();
        let directory = Arc::new(EventDirectory::new(events, dir.path().join("database")));

        let service = MatcherService::new(
            test_engine(),
            Arc::new(MatchCache::new()),
            directory,
            PathBuf::from("/opt/cascade.xml"),
        );
        assert!(service
            .match_event("ev1", "", "424242", "/uploads/selfie.jpg")
            .await
            .is_ok());
        assert!(matches!(
            service.match_event("ev1", "", "999999", "/uploads/selfie.jpg").await,
            Err(fdo::Error::AccessDenied(_))
        ));
        assert!(matches!(
            service.match_event("ev2", "", "424242", "/uploads/selfie.jpg").await,
            Err(fdo::Error::AccessDenied(_))
        ));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(EngineError::Match(MatchError::Corpus(CorpusError::EventNotFound(
                "ev".into()
            )))),
            fdo::Error::FileNotFound(_)
        ));
        assert!(matches!(to_fdo(EngineError::ChannelClosed), fdo::Error::Failed(_)));
    }
}
