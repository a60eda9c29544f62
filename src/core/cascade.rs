//! Boosted Haar cascade evaluation for OpenCV `opencv-cascade-classifier` XML files.
//!
//! Only upright HAAR features are supported. Detection follows OpenCV's
//! `detectMultiScale`: an image pyramid evaluated with a fixed-size window,
//! variance-normalised feature responses and neighbour grouping of the hits.

use crate::common::{AttendanceError, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::rect::Rect;
use std::path::Path;

const GROUP_EPS: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct Feature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<Tree>,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
    pub scale_factor: f64,
    pub min_neighbors: u32,
    pub min_size: (u32, u32),
}

impl Default for DetectParams {
    fn default() -> Self {
        Self { scale_factor: 1.1, min_neighbors: 3, min_size: (0, 0) }
    }
}

#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<Feature>,
}

impl HaarCascade {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AttendanceError::Detector(format!("Cannot read cascade {}: {}", path.display(), e)))?;
        let cascade = Self::from_xml(&text)?;
        tracing::info!(
            "Loaded cascade {} ({}x{}, {} stages, {} features)",
            path.display(), cascade.window_width, cascade.window_height,
            cascade.stages.len(), cascade.features.len()
        );
        Ok(cascade)
    }

    pub fn from_xml(text: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| AttendanceError::Detector(format!("Cascade XML parse error: {}", e)))?;

        let root = doc.descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| invalid("missing <cascade> element (legacy cascade formats are not supported)"))?;

        if let Some(kind) = child(root, "featureType").and_then(|n| n.text()) {
            if kind.trim() != "HAAR" {
                return Err(invalid(&format!("unsupported feature type {}", kind.trim())));
            }
        }

        let window_width = parse_number::<u32>(child_text(root, "width")?)?;
        let window_height = parse_number::<u32>(child_text(root, "height")?)?;
        if window_width < 3 || window_height < 3 {
            return Err(invalid("window must be at least 3x3"));
        }

        let features = child(root, "features")
            .ok_or_else(|| invalid("missing <features>"))?
            .children()
            .filter(|n| n.is_element())
            .map(|n| parse_feature(n, window_width, window_height))
            .collect::<Result<Vec<_>>>()?;

        let stages = child(root, "stages")
            .ok_or_else(|| invalid("missing <stages>"))?
            .children()
            .filter(|n| n.is_element())
            .map(|n| parse_stage(n, features.len()))
            .collect::<Result<Vec<_>>>()?;

        if stages.is_empty() {
            return Err(invalid("cascade has no stages"));
        }

        Ok(Self { window_width, window_height, stages, features })
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn detect_multi_scale(&self, gray: &GrayImage, params: &DetectParams) -> Vec<Rect> {
        let (img_w, img_h) = gray.dimensions();
        let mut candidates = Vec::new();
        let mut factor = 1.0_f64;

        loop {
            let win_w = (self.window_width as f64 * factor).round() as u32;
            let win_h = (self.window_height as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < self.window_width || scaled_h < self.window_height {
                break;
            }

            if win_w >= params.min_size.0 && win_h >= params.min_size.1 {
                let scaled = if factor == 1.0 {
                    gray.clone()
                } else {
                    imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle)
                };
                let step = if factor > 2.0 { 1 } else { 2 };
                self.scan_layer(&scaled, factor, step, &mut candidates);
            }

            factor *= params.scale_factor;
        }

        group_rectangles(candidates, params.min_neighbors, GROUP_EPS)
    }

    fn scan_layer(&self, image: &GrayImage, factor: f64, step: usize, out: &mut Vec<Rect>) {
        let sum = integral_image::<_, u64>(image);
        let sqsum = integral_squared_image::<_, u64>(image);
        let layer = Layer {
            stride: image.width() as usize + 1,
            sum: sum.as_raw(),
            sqsum: sqsum.as_raw(),
        };

        let max_x = (image.width() - self.window_width) as usize;
        let max_y = (image.height() - self.window_height) as usize;

        for y in (0..=max_y).step_by(step) {
            for x in (0..=max_x).step_by(step) {
                if self.evaluate_window(&layer, x, y) {
                    out.push(
                        Rect::at((x as f64 * factor).round() as i32, (y as f64 * factor).round() as i32)
                            .of_size(
                                (self.window_width as f64 * factor).round() as u32,
                                (self.window_height as f64 * factor).round() as u32,
                            ),
                    );
                }
            }
        }
    }

    fn evaluate_window(&self, layer: &Layer<'_>, x: usize, y: usize) -> bool {
        // Normalise over the window inset by one pixel.
        let nw = self.window_width as usize - 2;
        let nh = self.window_height as usize - 2;
        let area = (nw * nh) as f64;
        let s = layer.rect_sum(layer.sum, x + 1, y + 1, nw, nh) as f64;
        let sq = layer.rect_sum(layer.sqsum, x + 1, y + 1, nw, nh) as f64;

        // A perfectly flat window normalises by 1 rather than being skipped.
        let nf = area * sq - s * s;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        let inv_nf = 1.0 / nf;

        for stage in &self.stages {
            let mut stage_sum = 0.0;
            for tree in &stage.trees {
                let mut idx: i32 = 0;
                loop {
                    let node = &tree.nodes[idx as usize];
                    let value = self.feature_value(layer, node.feature, x, y) * inv_nf;
                    idx = if value < node.threshold { node.left } else { node.right };
                    if idx <= 0 {
                        break;
                    }
                }
                stage_sum += tree.leaves[(-idx) as usize];
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, layer: &Layer<'_>, feature: usize, x: usize, y: usize) -> f64 {
        self.features[feature].rects.iter()
            .map(|r| {
                let s = layer.rect_sum(
                    layer.sum,
                    x + r.x as usize,
                    y + r.y as usize,
                    r.width as usize,
                    r.height as usize,
                );
                r.weight * s as f64
            })
            .sum()
    }
}

struct Layer<'a> {
    stride: usize,
    sum: &'a [u64],
    sqsum: &'a [u64],
}

impl Layer<'_> {
    fn rect_sum(&self, table: &[u64], x: usize, y: usize, w: usize, h: usize) -> u64 {
        let top = y * self.stride;
        let bottom = (y + h) * self.stride;
        table[bottom + x + w] + table[top + x] - table[top + x + w] - table[bottom + x]
    }
}

fn invalid(msg: &str) -> AttendanceError {
    AttendanceError::Detector(format!("Invalid cascade: {}", msg))
}

fn child<'a, 'i>(node: roxmltree::Node<'a, 'i>, name: &str) -> Option<roxmltree::Node<'a, 'i>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Result<&'a str> {
    child(node, name)
        .and_then(|n| n.text())
        .ok_or_else(|| invalid(&format!("missing <{}>", name)))
}

fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T> {
    text.trim().parse::<T>().map_err(|_| invalid(&format!("bad number {:?}", text.trim())))
}

fn parse_numbers(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace().map(parse_number::<f64>).collect()
}

fn parse_feature(node: roxmltree::Node<'_, '_>, win_w: u32, win_h: u32) -> Result<Feature> {
    if let Some(tilted) = child(node, "tilted").and_then(|n| n.text()) {
        if tilted.trim() != "0" {
            return Err(invalid("tilted features are not supported"));
        }
    }

    let rects = child(node, "rects")
        .ok_or_else(|| invalid("feature without <rects>"))?
        .children()
        .filter(|n| n.is_element())
        .map(|r| {
            let values = parse_numbers(r.text().unwrap_or(""))?;
            if values.len() != 5 {
                return Err(invalid("feature rect must have 5 values"));
            }
            let rect = WeightedRect {
                x: values[0] as u32,
                y: values[1] as u32,
                width: values[2] as u32,
                height: values[3] as u32,
                weight: values[4],
            };
            if values[..4].iter().any(|v| *v < 0.0) || rect.x + rect.width > win_w || rect.y + rect.height > win_h {
                return Err(invalid("feature rect outside the detection window"));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>>>()?;

    if rects.is_empty() {
        return Err(invalid("feature without rects"));
    }
    Ok(Feature { rects })
}

fn parse_stage(node: roxmltree::Node<'_, '_>, feature_count: usize) -> Result<Stage> {
    let threshold = parse_number::<f64>(child_text(node, "stageThreshold")?)?;
    let trees = child(node, "weakClassifiers")
        .ok_or_else(|| invalid("stage without <weakClassifiers>"))?
        .children()
        .filter(|n| n.is_element())
        .map(|n| parse_tree(n, feature_count))
        .collect::<Result<Vec<_>>>()?;

    Ok(Stage { threshold, trees })
}

fn parse_tree(node: roxmltree::Node<'_, '_>, feature_count: usize) -> Result<Tree> {
    let raw_nodes = parse_numbers(child_text(node, "internalNodes")?)?;
    let leaves = parse_numbers(child_text(node, "leafValues")?)?;

    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(invalid("internalNodes must hold groups of 4 values"));
    }

    let nodes: Vec<Node> = raw_nodes
        .chunks_exact(4)
        .map(|c| Node { left: c[0] as i32, right: c[1] as i32, feature: c[2] as usize, threshold: c[3] })
        .collect();

    for n in &nodes {
        if n.feature >= feature_count {
            return Err(invalid("node references an unknown feature"));
        }
        for link in [n.left, n.right] {
            let ok = if link > 0 {
                (link as usize) < nodes.len()
            } else {
                ((-link) as usize) < leaves.len()
            };
            if !ok {
                return Err(invalid("node links outside its tree"));
            }
        }
    }

    Ok(Tree { nodes, leaves })
}

/// Clusters overlapping hits and keeps clusters with more than `group_threshold` members.
///
/// A zero threshold returns the raw hits unchanged.
pub fn group_rectangles(rects: Vec<Rect>, group_threshold: u32, eps: f64) -> Vec<Rect> {
    if group_threshold == 0 || rects.is_empty() {
        return rects;
    }

    let labels = partition(&rects, eps);
    let classes = labels.iter().copied().max().map_or(0, |m| m + 1);

    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.left() as i64;
        s[1] += r.top() as i64;
        s[2] += r.width() as i64;
        s[3] += r.height() as i64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums.iter().zip(&counts)
        .map(|(s, &n)| {
            let n = n as f64;
            Rect::at((s[0] as f64 / n).round() as i32, (s[1] as f64 / n).round() as i32)
                .of_size(((s[2] as f64 / n).round() as u32).max(1), ((s[3] as f64 / n).round() as u32).max(1))
        })
        .collect();

    let mut grouped = Vec::new();
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
            let dx = (r2.width() as f64 * eps).round() as i32;
            let dy = (r2.height() as f64 * eps).round() as i32;

            r1.left() >= r2.left() - dx
                && r1.top() >= r2.top() - dy
                && r1.right() <= r2.right() + dx
                && r1.bottom() <= r2.bottom() + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            grouped.push(r1);
        }
    }
    grouped
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width().min(b.width()) + a.height().min(b.height())) as f64 * 0.5;
    let close = |p: i32, q: i32| ((p - q).abs() as f64) <= delta;
    close(a.left(), b.left())
        && close(a.top(), b.top())
        && close(a.left() + a.width() as i32, b.left() + b.width() as i32)
        && close(a.top() + a.height() as i32, b.top() + b.height() as i32)
}

/// Equivalence classes under `similar`, labelled 0..n in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut labels = vec![usize::MAX; rects.len()];
    let mut roots: Vec<usize> = Vec::new();
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        let label = match roots.iter().position(|&r| r == root) {
            Some(pos) => pos,
            None => {
                roots.push(root);
                roots.len() - 1
            }
        };
        labels[i] = label;
    }
    labels
}

/// Mean and standard deviation of a greyscale image.
pub fn intensity_stats(gray: &GrayImage) -> (f64, f64) {
    let n = (gray.width() as u64 * gray.height() as u64) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sq) = gray.pixels().fold((0u64, 0u64), |(s, q), Luma([v])| {
        (s + *v as u64, q + (*v as u64) * (*v as u64))
    });
    let mean = sum as f64 / n;
    let variance = (sq as f64 / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 8x8 window, one stump on a "dark above bright" edge feature.
    pub(crate) fn edge_cascade_xml() -> String {
        r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>8</height>
  <width>8</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 5.0000000000000000e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 8 4 -1.</_>
        <_>
          0 4 8 4 1.</_></rects></_></features></cascade>
</opencv_storage>
"#
        .to_string()
    }

    pub(crate) fn horizontal_edge(width: u32, height: u32, edge_row: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| if y < edge_row { Luma([0]) } else { Luma([255]) })
    }

    fn raw_params() -> DetectParams {
        DetectParams { scale_factor: 1.1, min_neighbors: 0, min_size: (0, 0) }
    }

    #[test]
    fn parses_stage_and_feature_tables() {
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        assert_eq!(cascade.window_size(), (8, 8));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.features[0].rects.len(), 2);
    }

    #[test]
    fn rejects_tilted_and_non_haar_cascades() {
        let tilted = edge_cascade_xml().replace("<rects>", "<tilted>1</tilted><rects>");
        assert!(HaarCascade::from_xml(&tilted).is_err());

        let lbp = edge_cascade_xml().replace("<featureType>HAAR", "<featureType>LBP");
        assert!(HaarCascade::from_xml(&lbp).is_err());

        let dangling = edge_cascade_xml().replace("0 -1 0 5.0", "0 -1 3 5.0");
        assert!(HaarCascade::from_xml(&dangling).is_err());

        assert!(HaarCascade::from_xml("<opencv_storage/>").is_err());
        assert!(HaarCascade::from_xml("not xml").is_err());
    }

    #[test]
    fn fires_only_on_windows_spanning_the_edge() {
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        let hits = cascade.detect_multi_scale(&horizontal_edge(48, 48, 24), &raw_params());

        assert!(!hits.is_empty());
        for r in &hits {
            // Pyramid layers blur and round the edge by a few pixels.
            assert!(r.top() <= 26 && r.bottom() >= 20, "hit {:?} does not span the edge", r);
        }
    }

    #[test]
    fn flat_and_vertical_edge_frames_produce_nothing() {
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        let flat = GrayImage::from_pixel(48, 48, Luma([128]));
        assert!(cascade.detect_multi_scale(&flat, &raw_params()).is_empty());

        let vertical = GrayImage::from_fn(48, 48, |x, _| if x < 24 { Luma([0]) } else { Luma([255]) });
        assert!(cascade.detect_multi_scale(&vertical, &raw_params()).is_empty());
    }

    #[test]
    fn frame_exactly_one_window_in_size_is_scanned() {
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        let hits = cascade.detect_multi_scale(&horizontal_edge(8, 8, 4), &raw_params());
        assert_eq!(hits, vec![Rect::at(0, 0).of_size(8, 8)]);
    }

    #[test]
    fn last_window_position_is_scanned() {
        // Only the bottom-most window (y = 2) sees the bright rows.
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        let hits = cascade.detect_multi_scale(&horizontal_edge(8, 10, 8), &raw_params());
        assert_eq!(hits, vec![Rect::at(0, 2).of_size(8, 8)]);
    }

    #[test]
    fn dim_low_contrast_edge_still_fires() {
        let cascade = HaarCascade::from_xml(&edge_cascade_xml()).unwrap();
        let dim = GrayImage::from_fn(8, 8, |_, y| if y < 4 { Luma([20]) } else { Luma([24]) });
        assert_eq!(cascade.detect_multi_scale(&dim, &raw_params()).len(), 1);
    }

    #[test]
    fn grouping_keeps_dense_clusters_and_drops_strays() {
        let mut rects: Vec<Rect> = (0..5).map(|i| Rect::at(100 + i, 100).of_size(40, 40)).collect();
        rects.push(Rect::at(300, 10).of_size(40, 40));

        let grouped = group_rectangles(rects, 3, GROUP_EPS);
        assert_eq!(grouped, vec![Rect::at(102, 100).of_size(40, 40)]);
    }

    #[test]
    fn grouping_removes_small_clusters_nested_in_stronger_ones() {
        let mut rects: Vec<Rect> = (0..8).map(|i| Rect::at(50 + (i % 2), 50).of_size(100, 100)).collect();
        rects.extend((0..4).map(|_| Rect::at(70, 70).of_size(30, 30)));

        let grouped = group_rectangles(rects, 3, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width(), 100);
    }

    #[test]
    fn intensity_stats_of_two_tone_image() {
        let img = horizontal_edge(10, 10, 5);
        let (mean, std) = intensity_stats(&img);
        assert!((mean - 127.5).abs() < 1e-9);
        assert!((std - 127.5).abs() < 1e-9);
    }
}
