use facefind_core::{
    CascadeError, CorpusMatcher, CorpusResolver, CorpusScope, FaceEncoder, HaarEncoder, MatchError,
    MatchOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Matcher = CorpusMatcher<Arc<dyn FaceEncoder>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Match {
        selfie: PathBuf,
        scope: CorpusScope,
        reply: oneshot::Sender<Result<MatchOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Match the selfie's first face against every image in `scope`.
    pub async fn match_scope(
        &self,
        selfie: PathBuf,
        scope: CorpusScope,
    ) -> Result<MatchOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Match {
                selfie,
                scope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the cascade and spawn the engine.
///
/// Fails fast at startup if the cascade is missing or malformed.
pub fn spawn_engine(
    cascade_path: &Path,
    resolver: Arc<dyn CorpusResolver>,
) -> Result<EngineHandle, CascadeError> {
    let encoder = HaarEncoder::load(cascade_path)?;
    Ok(spawn_engine_with(Arc::new(encoder), resolver))
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread only receives requests; each match runs on the rayon pool, so
/// independent requests proceed concurrently and a slow scan never blocks
/// the queue.
pub fn spawn_engine_with(
    encoder: Arc<dyn FaceEncoder>,
    resolver: Arc<dyn CorpusResolver>,
) -> EngineHandle {
    let matcher: Arc<Matcher> = Arc::new(CorpusMatcher::new(encoder));
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facefind-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Match {
                        selfie,
                        scope,
                        reply,
                    } => {
                        let matcher = Arc::clone(&matcher);
                        let resolver = Arc::clone(&resolver);
                        rayon::spawn(move || {
                            let result = run_match(&matcher, resolver.as_ref(), &selfie, &scope);
                            let _ = reply.send(result);
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

fn run_match(
    matcher: &Matcher,
    resolver: &dyn CorpusResolver,
    selfie: &Path,
    scope: &CorpusScope,
) -> Result<MatchOutcome, EngineError> {
    let started = std::time::Instant::now();
    let outcome = matcher.match_one_image(selfie, resolver, scope)?;
    tracing::info!(
        scope = ?scope,
        ranked = outcome.matches.len(),
        best = outcome.best.filename(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "match complete"
    );
    Ok(outcome)
}
