//! Corpus matching: score every corpus image against a query face and rank.

use crate::corpus::{CorpusEntry, CorpusError, CorpusResolver, CorpusScope};
use crate::encoder::FaceEncoder;
use crate::types::{best_distance, FaceEncoding, MatchCandidate, RankedMatchList};
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no face found in the query image")]
    NoFaceDetected,
    #[error("no faces found in corpus images")]
    EmptyCorpus,
    #[error(transparent)]
    Corpus(#[from] CorpusError),
}

/// Ranked result of one match operation.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// First element of `matches`.
    pub best: MatchCandidate,
    pub matches: RankedMatchList,
}

/// Scores corpora with a [`FaceEncoder`].
pub struct CorpusMatcher<E> {
    encoder: E,
}

impl<E: FaceEncoder> CorpusMatcher<E> {
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Score every corpus image by its closest face and rank the results.
    ///
    /// Images run through the encoder in parallel. Images without faces
    /// (including unreadable ones) are left out of the ranking.
    pub fn match_against_corpus(
        &self,
        query: &FaceEncoding,
        corpus: &[CorpusEntry],
    ) -> Result<MatchOutcome, MatchError> {
        let scored: Vec<(usize, MatchCandidate)> = corpus
            .par_iter()
            .enumerate()
            .filter_map(|(ordinal, entry)| {
                let encodings = self.encoder.detect(&entry.path);
                let distance = best_distance(query, &encodings)?;
                match MatchCandidate::new(entry.folder.clone(), entry.filename(), distance) {
                    Ok(candidate) => Some((ordinal, candidate)),
                    Err(e) => {
                        tracing::debug!(path = %entry.path.display(), "skipping candidate: {}", e);
                        None
                    }
                }
            })
            .collect();

        let matches = RankedMatchList::rank(scored);
        let best = matches.best().cloned().ok_or(MatchError::EmptyCorpus)?;

        tracing::debug!(
            corpus = corpus.len(),
            ranked = matches.len(),
            best = best.filename(),
            distance = best.distance(),
            "corpus scored"
        );

        Ok(MatchOutcome { best, matches })
    }

    /// Match the first face in `query_path` against the corpus for `scope`.
    ///
    /// A faceless query fails before the corpus is resolved or scanned.
    pub fn match_one_image(
        &self,
        query_path: &Path,
        resolver: &dyn CorpusResolver,
        scope: &CorpusScope,
    ) -> Result<MatchOutcome, MatchError> {
        let query = self
            .encoder
            .detect(query_path)
            .into_iter()
            .next()
            .ok_or(MatchError::NoFaceDetected)?;

        let corpus = resolver.resolve(scope)?;
        tracing::info!(scope = ?scope, corpus = corpus.len(), "matching query against corpus");

        self.match_against_corpus(&query, &corpus)
    }
}
