use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facefind_core::corpus::list_flat_corpus;
use facefind_core::{
    CorpusEntry, CorpusError, CorpusMatcher, CorpusScope, FaceEncoder, HaarEncoder,
    MatchOutcome, DEFAULT_CASCADE_FILE,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facefind", about = "Find event photos by selfie")]
struct Cli {
    /// Haar cascade XML for local commands
    /// (default: $FACEFIND_CASCADE_PATH, else the data directory)
    #[arg(long, global = true)]
    cascade: Option<PathBuf>,

    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the face rectangles found in an image (local)
    Detect { image: PathBuf },
    /// Rank every image in a directory against a selfie (local)
    Scan { selfie: PathBuf, dir: PathBuf },
    /// Match a selfie against an event's photos
    Match {
        #[arg(short, long)]
        event: String,
        /// Event access code
        #[arg(short, long)]
        code: String,
        /// Folder to search ("all" or empty for every folder)
        #[arg(short, long, default_value = "")]
        folder: String,
        selfie: PathBuf,
    },
    /// Read back a cached match list by token
    Matches {
        #[arg(short, long)]
        event: String,
        #[arg(short, long)]
        code: String,
        #[arg(short, long, default_value = "")]
        folder: String,
        token: String,
    },
    /// Find the closest image in the global database
    Search { selfie: PathBuf },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.facefind.Matcher1",
    default_service = "org.facefind.Matcher1",
    default_path = "/org/facefind/Matcher1"
)]
trait Matcher {
    async fn match_event(
        &self,
        event_id: &str,
        folder: &str,
        code: &str,
        selfie_path: &str,
    ) -> zbus::Result<String>;
    async fn match_database(&self, selfie_path: &str) -> zbus::Result<String>;
    async fn get_matches(
        &self,
        event_id: &str,
        folder: &str,
        token: &str,
        code: &str,
    ) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect { image } => {
            let encoder = load_encoder(cli.cascade)?;
            let faces = encoder
                .detect_faces(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            tracing::debug!(image = %image.display(), faces = faces.len(), "detection finished");
            print_json(&serde_json::to_value(&faces)?)?;
        }
        Commands::Scan { selfie, dir } => {
            let matcher = CorpusMatcher::new(load_encoder(cli.cascade)?);
            let outcome = scan_dir(&matcher, &selfie, &dir)?;
            print_json(&serde_json::json!({ "matches": outcome.matches.views() }))?;
        }
        Commands::Match {
            event,
            code,
            folder,
            selfie,
        } => {
            let proxy = connect(cli.system).await?;
            let selfie = absolute(&selfie)?;
            let reply = proxy.match_event(&event, &folder, &code, &selfie).await?;
            print_reply(&reply)?;
        }
        Commands::Matches {
            event,
            code,
            folder,
            token,
        } => {
            let proxy = connect(cli.system).await?;
            let reply = proxy.get_matches(&event, &folder, &token, &code).await?;
            print_reply(&reply)?;
        }
        Commands::Search { selfie } => {
            let proxy = connect(cli.system).await?;
            let selfie = absolute(&selfie)?;
            let reply = proxy.match_database(&selfie).await?;
            print_reply(&reply)?;
        }
        Commands::Status => match connect(cli.system).await {
            Ok(proxy) => print_reply(&proxy.status().await?)?,
            Err(e) => println!("facefindd: not connected ({e})"),
        },
    }

    Ok(())
}

/// Rank the images directly inside `dir` against the first face in `selfie`.
fn scan_dir<E: FaceEncoder>(
    matcher: &CorpusMatcher<E>,
    selfie: &Path,
    dir: &Path,
) -> Result<MatchOutcome> {
    tracing::info!(selfie = %selfie.display(), dir = %dir.display(), "local scan started");
    let started = std::time::Instant::now();
    let resolver = |_: &CorpusScope| -> Result<Vec<CorpusEntry>, CorpusError> {
        Ok(list_flat_corpus(dir))
    };
    let outcome = matcher.match_one_image(selfie, &resolver, &CorpusScope::Database)?;
    tracing::info!(
        ranked = outcome.matches.len(),
        best = outcome.best.filename(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "local scan finished"
    );
    Ok(outcome)
}

fn cascade_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("FACEFIND_CASCADE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| facefind_core::default_data_dir().join(DEFAULT_CASCADE_FILE))
}

fn load_encoder(flag: Option<PathBuf>) -> Result<HaarEncoder> {
    let path = cascade_path(flag);
    HaarEncoder::load(&path).with_context(|| format!("failed to load cascade {}", path.display()))
}

async fn connect(system: bool) -> Result<MatcherProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    Ok(MatcherProxy::new(&conn).await?)
}

/// The daemon resolves paths from its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("cannot access {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_reply(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    print_json(&value)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
