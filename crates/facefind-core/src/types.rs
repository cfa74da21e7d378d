use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Side length of the square face canvas every detection is resized to.
pub const FACE_CANVAS_SIZE: usize = 100;

/// Dimensionality of every [`FaceEncoding`] in the system.
pub const ENCODING_DIM: usize = FACE_CANVAS_SIZE * FACE_CANVAS_SIZE;

/// Image extensions accepted by the encoder and the corpus resolver (lowercase, no dot).
pub const PERMITTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Case-insensitive check against [`PERMITTED_EXTENSIONS`].
pub fn is_permitted_image(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            PERMITTED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

#[derive(Error, Debug, PartialEq)]
pub enum EncodingError {
    #[error("encoding must have {expected} components, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("encoding component {index} = {value} is outside [0, 1]")]
    OutOfRange { index: usize, value: f32 },
}

/// A flattened, intensity-normalised 100x100 grayscale face patch.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding {
    values: Vec<f32>,
}

impl FaceEncoding {
    /// Validate and wrap a raw vector.
    pub fn new(values: Vec<f32>) -> Result<Self, EncodingError> {
        if values.len() != ENCODING_DIM {
            return Err(EncodingError::DimensionMismatch {
                expected: ENCODING_DIM,
                actual: values.len(),
            });
        }
        if let Some((index, &value)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(EncodingError::OutOfRange { index, value });
        }
        Ok(Self { values })
    }

    /// Build an encoding from a 100x100 u8 patch, mapping [0, 255] onto [0, 1].
    pub fn from_patch(patch: &[u8]) -> Result<Self, EncodingError> {
        Self::new(patch.iter().map(|&p| p as f32 / 255.0).collect())
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to another encoding.
    ///
    /// Accumulates in f64. Both encodings come from the same encoder
    /// configuration, so a length mismatch is a bug and panics.
    pub fn distance(&self, other: &FaceEncoding) -> f64 {
        distance(&self.values, &other.values)
    }
}

/// L2 norm of the elementwise difference of two equal-length vectors.
pub fn distance(a: &[f32], b: &[f32]) -> f64 {
    assert_eq!(a.len(), b.len(), "encoding dimensionality mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Minimum distance from `query` to any candidate, or `None` for an empty slice.
pub fn best_distance(query: &FaceEncoding, candidates: &[FaceEncoding]) -> Option<f64> {
    candidates
        .iter()
        .map(|c| query.distance(c))
        .min_by(|a, b| a.total_cmp(b))
}

/// Display confidence for a distance: `1 / (1 + distance)`, in (0, 1].
pub fn confidence(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Encodings found in one image, in detector order. Empty is a normal outcome.
pub type DetectionResult = Vec<FaceEncoding>;

/// Folder identity within an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FolderTag {
    /// The pre-folder storage area, shown to users as "default".
    Legacy,
    /// A named folder (already sanitised).
    Named(String),
}

impl FolderTag {
    pub const DEFAULT_NAME: &'static str = "default";

    pub fn is_legacy(&self) -> bool {
        matches!(self, FolderTag::Legacy)
    }

    pub fn as_str(&self) -> &str {
        match self {
            FolderTag::Legacy => Self::DEFAULT_NAME,
            FolderTag::Named(name) => name,
        }
    }
}

impl fmt::Display for FolderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FolderTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum CandidateError {
    #[error("{0:?} is not a permitted image file")]
    UnsupportedFile(String),
    #[error("distance {0} must be finite and non-negative")]
    InvalidDistance(f64),
}

/// One corpus image scored against the query.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    folder: FolderTag,
    filename: String,
    distance: f64,
}

impl MatchCandidate {
    /// Validate and build a candidate. `distance` is the minimum over the
    /// image's own encodings.
    pub fn new(
        folder: FolderTag,
        filename: impl Into<String>,
        distance: f64,
    ) -> Result<Self, CandidateError> {
        let filename = filename.into();
        if !is_permitted_image(&filename) {
            return Err(CandidateError::UnsupportedFile(filename));
        }
        if !distance.is_finite() || distance < 0.0 {
            return Err(CandidateError::InvalidDistance(distance));
        }
        Ok(Self {
            folder,
            filename,
            distance,
        })
    }

    pub fn folder(&self) -> &FolderTag {
        &self.folder
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn confidence(&self) -> f64 {
        confidence(self.distance)
    }

    pub fn is_legacy(&self) -> bool {
        self.folder.is_legacy()
    }
}

/// Wire shape of a candidate: what export and UI consumers see.
#[derive(Debug, Clone, Serialize)]
pub struct MatchView<'a> {
    pub filename: &'a str,
    pub folder: &'a FolderTag,
    pub legacy: bool,
    /// Rounded to four decimals for display.
    pub confidence: f64,
}

impl<'a> From<&'a MatchCandidate> for MatchView<'a> {
    fn from(c: &'a MatchCandidate) -> Self {
        Self {
            filename: &c.filename,
            folder: &c.folder,
            legacy: c.is_legacy(),
            confidence: round4(c.confidence()),
        }
    }
}

/// Round to four decimals from the exact binary value, so halfway-looking
/// inputs like 0.00035 (stored just below the half) round down.
fn round4(v: f64) -> f64 {
    format!("{v:.4}").parse().unwrap_or(v)
}

/// Candidates sorted ascending by distance, ties in corpus enumeration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedMatchList {
    candidates: Vec<MatchCandidate>,
}

impl RankedMatchList {
    /// Rank `(ordinal, candidate)` pairs. The ordinal is the corpus
    /// enumeration position and breaks distance ties.
    pub fn rank(mut scored: Vec<(usize, MatchCandidate)>) -> Self {
        scored.sort_by(|(ia, a), (ib, b)| a.distance.total_cmp(&b.distance).then(ia.cmp(ib)));
        Self {
            candidates: scored.into_iter().map(|(_, c)| c).collect(),
        }
    }

    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MatchCandidate> {
        self.candidates.iter()
    }

    pub fn as_slice(&self) -> &[MatchCandidate] {
        &self.candidates
    }

    pub fn views(&self) -> Vec<MatchView<'_>> {
        self.candidates.iter().map(MatchView::from).collect()
    }
}

impl<'a> IntoIterator for &'a RankedMatchList {
    type Item = &'a MatchCandidate;
    type IntoIter = std::slice::Iter<'a, MatchCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(v: f32) -> FaceEncoding {
        FaceEncoding::new(vec![v; ENCODING_DIM]).unwrap()
    }

    fn with_first(base: f32, first: f32) -> FaceEncoding {
        let mut values = vec![base; ENCODING_DIM];
        values[0] = first;
        FaceEncoding::new(values).unwrap()
    }

    fn candidate(name: &str, distance: f64) -> MatchCandidate {
        MatchCandidate::new(FolderTag::Legacy, format!("{name}.jpg"), distance).unwrap()
    }

    #[test]
    fn test_encoding_rejects_wrong_dimension() {
        let err = FaceEncoding::new(vec![0.5; 3]).unwrap_err();
        assert_eq!(
            err,
            EncodingError::DimensionMismatch { expected: ENCODING_DIM, actual: 3 }
        );
    }

    #[test]
    fn test_encoding_rejects_out_of_range() {
        let mut values = vec![0.5; ENCODING_DIM];
        values[7] = 1.5;
        assert!(matches!(
            FaceEncoding::new(values),
            Err(EncodingError::OutOfRange { index: 7, .. })
        ));
    }

    #[test]
    fn test_from_patch_normalizes() {
        let mut patch = vec![0u8; ENCODING_DIM];
        patch[1] = 255;
        patch[2] = 51;
        let enc = FaceEncoding::from_patch(&patch).unwrap();
        assert_eq!(enc.values()[0], 0.0);
        assert_eq!(enc.values()[1], 1.0);
        assert!((enc.values()[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = filled(0.25);
        assert_eq!(a.distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = with_first(0.1, 0.9);
        let b = filled(0.3);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_single_component() {
        let a = with_first(0.5, 0.5);
        let b = with_first(0.5, 1.0);
        assert!((a.distance(&b) - 0.5).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "dimensionality mismatch")]
    fn test_distance_mismatch_panics() {
        distance(&[0.0, 1.0], &[0.0]);
    }

    #[test]
    fn test_best_distance_picks_minimum() {
        let q = filled(0.5);
        let far = with_first(0.5, 0.0);
        let near = with_first(0.5, 0.4);
        let best = best_distance(&q, &[far, near]).unwrap();
        assert!((best - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_best_distance_empty_is_none() {
        assert_eq!(best_distance(&filled(0.5), &[]), None);
    }

    #[test]
    fn test_confidence_mapping() {
        assert_eq!(confidence(0.0), 1.0);
        assert_eq!(confidence(1.0), 0.5);
        let mut last = 1.0f64;
        for d in [0.1, 0.5, 2.0, 10.0, 1e6] {
            let c = confidence(d);
            assert!(c > 0.0 && c <= 1.0);
            assert!(c < last);
            assert_eq!(c, 1.0 / (1.0 + d));
            last = c;
        }
    }

    #[test]
    fn test_rank_sorts_ascending_and_keeps_ties_stable() {
        let ranked = RankedMatchList::rank(vec![
            (2, candidate("c", 0.2)),
            (0, candidate("a", 0.2)),
            (1, candidate("b", 0.1)),
            (3, candidate("d", 0.2)),
        ]);
        let names: Vec<&str> = ranked.iter().map(|c| c.filename()).collect();
        assert_eq!(names, ["b.jpg", "a.jpg", "c.jpg", "d.jpg"]);
        assert_eq!(ranked.best().unwrap().filename(), "b.jpg");
    }

    #[test]
    fn test_permitted_extensions_case_insensitive() {
        assert!(is_permitted_image("a.JPG"));
        assert!(is_permitted_image("dir/b.jpeg"));
        assert!(is_permitted_image("c.Png"));
        assert!(!is_permitted_image("d.gif"));
        assert!(!is_permitted_image("noext"));
        assert!(!is_permitted_image(".png.txt"));
    }

    #[test]
    fn test_match_view_shape() {
        let c = MatchCandidate::new(FolderTag::Named("ceremony".into()), "x.jpg", 1.0 / 3.0).unwrap();
        let json = serde_json::to_value(MatchView::from(&c)).unwrap();
        assert_eq!(json["folder"], "ceremony");
        assert_eq!(json["legacy"], false);
        assert_eq!(json["confidence"], 0.75);

        let legacy = MatchCandidate::new(FolderTag::Legacy, "y.png", 0.0).unwrap();
        let json = serde_json::to_value(MatchView::from(&legacy)).unwrap();
        assert_eq!(json["folder"], "default");
        assert_eq!(json["legacy"], true);
    }

    #[test]
    fn test_candidate_rejects_unsupported_file() {
        assert_eq!(
            MatchCandidate::new(FolderTag::Legacy, "notes.txt", 0.2),
            Err(CandidateError::UnsupportedFile("notes.txt".into()))
        );
        assert!(MatchCandidate::new(FolderTag::Legacy, "noext", 0.2).is_err());
        assert!(MatchCandidate::new(FolderTag::Legacy, "IMG_01.JPEG", 0.2).is_ok());
    }

    #[test]
    fn test_candidate_rejects_invalid_distance() {
        assert_eq!(
            MatchCandidate::new(FolderTag::Legacy, "a.jpg", -3.0),
            Err(CandidateError::InvalidDistance(-3.0))
        );
        assert!(matches!(
            MatchCandidate::new(FolderTag::Legacy, "a.jpg", f64::NAN),
            Err(CandidateError::InvalidDistance(d)) if d.is_nan()
        ));
        assert!(MatchCandidate::new(FolderTag::Legacy, "a.jpg", f64::INFINITY).is_err());
        for d in [0.0, 0.5, 1e9] {
            let c = MatchCandidate::new(FolderTag::Legacy, "a.jpg", d).unwrap();
            assert!(c.confidence() > 0.0 && c.confidence() <= 1.0);
        }
    }

    #[test]
    fn test_round4_uses_exact_binary_value() {
        // 0.00035 is stored as 0.000349999..., so it rounds down.
        assert_eq!(round4(0.00035), 0.0003);
        assert_eq!(round4(0.12345), 0.1235);
        assert_eq!(round4(1.0 / 1.1), 0.9091);
        assert_eq!(round4(1.0), 1.0);
    }
}
