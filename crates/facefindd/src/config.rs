use std::path::PathBuf;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug)]
pub struct Config {
    /// Root of the photographer/event tree.
    pub events_dir: PathBuf,
    /// Flat directory searched by `MatchDatabase`.
    pub database_dir: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    /// Rayon pool size for corpus scans; `None` keeps rayon's default.
    pub workers: Option<usize>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `FACEFIND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("FACEFIND_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facefind_core::default_data_dir);

        let events_dir = var("FACEFIND_EVENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("events"));

        let database_dir = var("FACEFIND_DATABASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("database"));

        let cascade_path = var("FACEFIND_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(facefind_core::DEFAULT_CASCADE_FILE));

        Self {
            events_dir,
            database_dir,
            cascade_path,
            workers: parse_var(&var, "FACEFIND_WORKERS").filter(|&n: &usize| n > 0),
            bus: match var("FACEFIND_BUS").as_deref().map(str::trim) {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}
