//! Haar cascade face detector.
//!
//! Loads boosted Haar cascades in the OpenCV XML format and scans a grayscale
//! image pyramid with them, then clusters raw window hits into face rectangles.

use roxmltree::Node;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Fixed detector parameters ---
const SCALE_FACTOR: f64 = 1.1;
const MIN_NEIGHBORS: usize = 5;
const MIN_FACE_SIZE: usize = 60;
const GROUP_EPS: f64 = 0.2;
/// Subtracted from every stage threshold on load.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;
const MAX_FEATURE_RECTS: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// Detected face region in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Internal tree node. Child indices > 0 point at nodes, <= 0 at leaf `-idx`.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

enum Verdict {
    Face,
    RejectedAt(usize),
}

/// A boosted cascade of Haar-feature trees.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: usize,
    window_height: usize,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade XML file (e.g. `haarcascade_frontalface_default.xml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::parse(&xml)?;

        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from its XML text.
    pub fn parse(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| {
                CascadeError::Unsupported(
                    "no <cascade> element (old-style cascades must be converted first)".into(),
                )
            })?;

        let stage_type = text(child(root, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = text(child(root, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: usize = scalar(child(root, "width")?)?;
        let window_height: usize = scalar(child(root, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let stages = items(child(root, "stages")?)
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        let features = items(child(root, "features")?)
            .map(parse_feature)
            .collect::<Result<Vec<_>, _>>()?;

        let cascade = Self {
            window_width,
            window_height,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    fn validate(&self) -> Result<(), CascadeError> {
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }
        for (fi, feature) in self.features.iter().enumerate() {
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(CascadeError::Invalid(format!(
                        "feature {fi} rectangle exceeds the detection window"
                    )));
                }
            }
        }
        for (si, stage) in self.stages.iter().enumerate() {
            for classifier in &stage.classifiers {
                for (ni, node) in classifier.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::Invalid(format!(
                            "stage {si} references feature {} of {}",
                            node.feature,
                            self.features.len()
                        )));
                    }
                    // Internal children only point forward, so every walk ends at a leaf.
                    for child in [node.left, node.right] {
                        if child > 0 && (child as usize) <= ni {
                            return Err(CascadeError::Invalid(format!(
                                "stage {si} node {ni} points back at node {child}"
                            )));
                        }
                        let ok = if child > 0 {
                            (child as usize) < classifier.nodes.len()
                        } else {
                            (child.unsigned_abs() as usize) < classifier.leaves.len()
                        };
                        if !ok {
                            return Err(CascadeError::Invalid(format!(
                                "stage {si} has a dangling tree reference {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Detect faces in a row-major grayscale buffer of `width` x `height` bytes.
    ///
    /// Rectangles come back in cluster order, which is the order encodings
    /// are produced in.
    pub fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceRect> {
        let (width, height) = (width as usize, height as usize);
        if width == 0 || height == 0 || gray.len() < width * height {
            return Vec::new();
        }

        let hits = self.scan(gray, width, height);
        let faces = group_rectangles(&hits, MIN_NEIGHBORS, GROUP_EPS);
        tracing::debug!(raw = hits.len(), faces = faces.len(), "cascade scan complete");
        faces
    }

    /// Slide the detection window over every pyramid level whose window
    /// maps to at least `MIN_FACE_SIZE` source pixels.
    fn scan(&self, gray: &[u8], width: usize, height: usize) -> Vec<FaceRect> {
        let (ww, wh) = (self.window_width, self.window_height);
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (ww as f64 * factor).round() as usize;
            let win_h = (wh as f64 * factor).round() as usize;
            let scaled_w = (width as f64 / factor).round() as usize;
            let scaled_h = (height as f64 / factor).round() as usize;

            if scaled_w <= ww || scaled_h <= wh || win_w > width || win_h > height {
                break;
            }

            if win_w >= MIN_FACE_SIZE && win_h >= MIN_FACE_SIZE {
                let scaled = resize_bilinear(gray, width, height, scaled_w, scaled_h);
                let integral = IntegralImage::new(&scaled, scaled_w, scaled_h);
                let step = if factor > 2.0 { 1 } else { 2 };

                for y in (0..scaled_h - wh).step_by(step) {
                    let mut x = 0;
                    while x < scaled_w - ww {
                        match self.evaluate(&integral, x, y) {
                            Verdict::Face => hits.push(FaceRect {
                                x: (x as f64 * factor).round() as i32,
                                y: (y as f64 * factor).round() as i32,
                                width: win_w as i32,
                                height: win_h as i32,
                            }),
                            Verdict::RejectedAt(0) => x += step,
                            Verdict::RejectedAt(_) => {}
                        }
                        x += step;
                    }
                }
            }

            factor *= SCALE_FACTOR;
        }

        hits
    }

    fn evaluate(&self, ii: &IntegralImage, x: usize, y: usize) -> Verdict {
        let (ww, wh) = (self.window_width, self.window_height);
        let area = ((ww - 2) * (wh - 2)) as f64;
        let sum = ii.rect_sum(x + 1, y + 1, ww - 2, wh - 2) as f64;
        let sq_sum = ii.rect_sq_sum(x + 1, y + 1, ww - 2, wh - 2) as f64;
        let nf = area * sq_sum - sum * sum;
        let inv_norm = if nf > 0.0 { 1.0 / nf.sqrt() } else { 1.0 };

        for (si, stage) in self.stages.iter().enumerate() {
            let mut stage_sum = 0.0f64;
            for classifier in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &classifier.nodes[idx as usize];
                    let value = self.feature_value(node.feature, ii, x, y) * inv_norm;
                    idx = if value < node.threshold as f64 {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                stage_sum += classifier.leaves[idx.unsigned_abs() as usize] as f64;
            }
            if stage_sum < stage.threshold as f64 {
                return Verdict::RejectedAt(si);
            }
        }

        Verdict::Face
    }

    fn feature_value(&self, feature: usize, ii: &IntegralImage, x: usize, y: usize) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight as f64 * ii.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

// --- XML helpers ---

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
    node.children()
        .find(|c| c.has_tag_name(name))
        .ok_or_else(|| CascadeError::Invalid(format!("missing <{name}>")))
}

/// OpenCV stores sequence elements as `<_>` children.
fn items<'a, 'i: 'a>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|c| c.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_token<T: FromStr>(token: &str) -> Result<T, CascadeError> {
    token
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("bad number {token:?}")))
}

fn scalar<T: FromStr>(node: Node<'_, '_>) -> Result<T, CascadeError> {
    parse_token(text(node))
}

fn parse_stage(node: Node<'_, '_>) -> Result<Stage, CascadeError> {
    let threshold: f32 = scalar(child(node, "stageThreshold")?)?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(parse_weak_classifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        classifiers,
    })
}

fn parse_weak_classifier(node: Node<'_, '_>) -> Result<WeakClassifier, CascadeError> {
    let raw: Vec<&str> = text(child(node, "internalNodes")?).split_whitespace().collect();
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(CascadeError::Invalid(format!(
            "internalNodes needs groups of 4 values, got {}",
            raw.len()
        )));
    }
    let nodes = raw
        .chunks(4)
        .map(|n| -> Result<TreeNode, CascadeError> {
            Ok(TreeNode {
                left: parse_token(n[0])?,
                right: parse_token(n[1])?,
                feature: parse_token(n[2])?,
                threshold: parse_token(n[3])?,
            })
        })
        .collect::<Result<Vec<_>, CascadeError>>()?;
    let leaves = text(child(node, "leafValues")?)
        .split_whitespace()
        .map(parse_token)
        .collect::<Result<Vec<f32>, _>>()?;
    Ok(WeakClassifier { nodes, leaves })
}

fn parse_feature(node: Node<'_, '_>) -> Result<HaarFeature, CascadeError> {
    if let Ok(tilted) = child(node, "tilted") {
        if text(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let v: Vec<&str> = text(r).split_whitespace().collect();
            if v.len() != 5 {
                return Err(CascadeError::Invalid(format!(
                    "feature rect needs 5 values, got {}",
                    v.len()
                )));
            }
            Ok(WeightedRect {
                x: parse_token(v[0])?,
                y: parse_token(v[1])?,
                width: parse_token(v[2])?,
                height: parse_token(v[3])?,
                weight: parse_token(v[4])?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() || rects.len() > MAX_FEATURE_RECTS {
        return Err(CascadeError::Invalid(format!(
            "feature has {} rectangles",
            rects.len()
        )));
    }
    Ok(HaarFeature { rects })
}

// --- Image helpers ---

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(pixels: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0u64; stride * (height + 1)];
        let mut sq_sum = vec![0u64; stride * (height + 1)];

        for y in 0..height {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..width {
                let p = pixels[y * width + x] as u64;
                row += p;
                row_sq += p * p;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row;
                sq_sum[i] = sq_sum[i - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    fn rect_sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::lookup(&self.sq_sum, self.stride, x, y, w, h)
    }

    fn lookup(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let tl = y * stride + x;
        let tr = tl + w;
        let bl = tl + h * stride;
        let br = bl + w;
        (table[br] + table[tl]) - (table[tr] + table[bl])
    }
}

/// Bilinear resize with half-pixel centre alignment.
fn resize_bilinear(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
    let scale_x = sw as f32 / dw as f32;
    let scale_y = sh as f32 / dh as f32;
    let mut out = vec![0u8; dw * dh];

    for y in 0..dh {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, sh as i32 - 1) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dw {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, sw as i32 - 1) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * sw + x0] as f32;
            let tr = src[y0 * sw + x1] as f32;
            let bl = src[y1 * sw + x0] as f32;
            let br = src[y1 * sw + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out[y * dw + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

// --- Hit clustering ---

fn similar_rects(a: &FaceRect, b: &FaceRect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

/// Split `items` into equivalence classes of the transitive closure of `same`.
///
/// Returns per-item labels and the class count. Classes are numbered in
/// order of their first member.
fn partition<T>(items: &[T], same: impl Fn(&T, &T) -> bool) -> (Vec<usize>, usize) {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let n = items.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if same(&items[i], &items[j]) {
                let a = find(&mut parent, i);
                let b = find(&mut parent, j);
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut classes = 0;
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Cluster raw hits, drop weak clusters, average the rest and remove
/// clusters nested inside a stronger neighbour.
fn group_rectangles(rects: &[FaceRect], group_threshold: usize, eps: f64) -> Vec<FaceRect> {
    if rects.is_empty() {
        return Vec::new();
    }

    let (labels, classes) = partition(rects, |a, b| similar_rects(a, b, eps));

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0usize; classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x as i64;
        s[1] += r.y as i64;
        s[2] += r.width as i64;
        s[3] += r.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<FaceRect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f32;
            let avg = |v: i64| (v as f32 * inv).round_ties_even() as i32;
            FaceRect {
                x: avg(s[0]),
                y: avg(s[1]),
                width: avg(s[2]),
                height: avg(s[3]),
            }
        })
        .collect();

    let mut out = Vec::new();
    for i in 0..classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = averaged[i];

        let nested = (0..classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            out.push(r1);
        }
    }

    out
}

/// Single-stage 24x24 cascade whose only tree returns `leaf` on both
/// branches. `leaf >= threshold` accepts every window.
#[cfg(test)]
pub(crate) fn stub_cascade_xml(stage_threshold: f32, leaf: f32) -> String {
    format!(
        r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>{stage_threshold}</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0e-02</internalNodes>
          <leafValues>
            {leaf} {leaf}</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          6 4 12 9 -1.</_>
        <_>
          6 7 12 3 3.</_></rects></_></features></cascade>
</opencv_storage>
"#
    )
}
