//! Render-ready geometry built from decoded tiles

use crate::style::{EvaluatedPaint, LayerKind, PropertyEvaluationParameters, StyleLayer};
use crate::tile::data::{Feature, GeometryTileData, GeometryType};
use std::sync::Arc;

/// One vertex in tile coordinates. `normal` is the extrusion the renderer
/// applies in pixels (line half width, circle radius); zero for fills.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: [f32; 2],
    pub normal: [f32; 2],
    pub color: [u8; 4],
}

/// Triangles for one style layer of one tile. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub layer_id: String,
    pub kind: LayerKind,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub feature_count: usize,
}

impl Bucket {
    fn new(layer_id: &str, kind: LayerKind) -> Self {
        Self {
            layer_id: layer_id.to_owned(),
            kind,
            vertices: Vec::new(),
            indices: Vec::new(),
            feature_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn push_quad(&mut self, corners: [Vertex; 4]) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&corners);
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    fn add_fill(&mut self, feature: &Feature, color: [u8; 4]) {
        let Some(exterior) = feature.geometry.first() else {
            return;
        };
        let ring = open_ring(exterior);
        let triangles = triangulate(ring);
        if triangles.is_empty() {
            return;
        }
        let base = self.vertices.len() as u32;
        self.vertices.extend(ring.iter().map(|&position| Vertex {
            position,
            normal: [0.0, 0.0],
            color,
        }));
        for [a, b, c] in triangles {
            self.indices
                .extend_from_slice(&[base + a as u32, base + b as u32, base + c as u32]);
        }
    }

    fn add_line(&mut self, line: &[[f32; 2]], half_width: f32, color: [u8; 4]) {
        for segment in line.windows(2) {
            let (p0, p1) = (segment[0], segment[1]);
            let (dx, dy) = (p1[0] - p0[0], p1[1] - p0[1]);
            let length = (dx * dx + dy * dy).sqrt();
            if length == 0.0 {
                continue;
            }
            let normal = [-dy / length * half_width, dx / length * half_width];
            let flipped = [-normal[0], -normal[1]];
            let vertex = |position, normal| Vertex {
                position,
                normal,
                color,
            };
            self.push_quad([
                vertex(p0, normal),
                vertex(p1, normal),
                vertex(p1, flipped),
                vertex(p0, flipped),
            ]);
        }
    }

    fn add_circle(&mut self, center: [f32; 2], radius: f32, color: [u8; 4]) {
        let corner = |sx: f32, sy: f32| Vertex {
            position: center,
            normal: [sx * radius, sy * radius],
            color,
        };
        self.push_quad([
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, 1.0),
        ]);
    }
}

/// Drops the closing point of a closed ring
fn open_ring(ring: &[[f32; 2]]) -> &[[f32; 2]] {
    match ring {
        [first, .., last] if ring.len() > 3 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

fn cross(a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn signed_area(ring: &[[f32; 2]]) -> f32 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (p, q) = (ring[i], ring[(i + 1) % n]);
            p[0] * q[1] - q[0] * p[1]
        })
        .sum::<f32>()
        / 2.0
}

fn in_triangle(p: [f32; 2], a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> bool {
    let d1 = cross(a, b, p);
    let d2 = cross(b, c, p);
    let d3 = cross(c, a, p);
    let has_negative = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_positive = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_negative && has_positive)
}

/// Ear-clipping triangulation of a simple polygon ring. Holes are not cut
/// out. Degenerate rings that stop yielding ears are finished as a fan.
pub fn triangulate(ring: &[[f32; 2]]) -> Vec<[usize; 3]> {
    if ring.len() < 3 {
        return Vec::new();
    }
    let counter_clockwise = signed_area(ring) > 0.0;
    let is_convex = |a, b, c| {
        let turn = cross(ring[a], ring[b], ring[c]);
        if counter_clockwise {
            turn > 0.0
        } else {
            turn < 0.0
        }
    };

    let mut remaining: Vec<usize> = (0..ring.len()).collect();
    let mut triangles = Vec::with_capacity(ring.len() - 2);
    while remaining.len() > 3 {
        let m = remaining.len();
        let ear = (0..m).find(|&i| {
            let (a, b, c) = (remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]);
            is_convex(a, b, c)
                && !remaining.iter().any(|&j| {
                    j != a && j != b && j != c && in_triangle(ring[j], ring[a], ring[b], ring[c])
                })
        });
        match ear {
            Some(i) => {
                triangles.push([remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]]);
                remaining.remove(i);
            }
            None => {
                for k in 1..m - 1 {
                    triangles.push([remaining[0], remaining[k], remaining[k + 1]]);
                }
                return triangles;
            }
        }
    }
    triangles.push([remaining[0], remaining[1], remaining[2]]);
    triangles
}

/// Builds one bucket per visible layer that has matching features.
/// Raster and background layers have no tile geometry.
pub fn build_buckets(
    data: &GeometryTileData,
    layers: &[StyleLayer],
    params: &PropertyEvaluationParameters,
) -> Vec<Arc<Bucket>> {
    let mut buckets = Vec::new();
    for layer in layers {
        if !layer.is_visible(params.zoom) {
            continue;
        }
        let kind = layer.kind();
        if matches!(kind, LayerKind::Raster | LayerKind::Background) {
            continue;
        }
        let source_layer = layer.source_layer.as_deref().and_then(|name| data.layer(name));
        let Some(source_layer) = source_layer else {
            continue;
        };

        let mut bucket = Bucket::new(&layer.id, kind);
        for feature in source_layer.features.iter().filter(|f| layer.filter.matches(f)) {
            let before = bucket.indices.len();
            match (layer.evaluate(params, Some(&feature.properties)), feature.geometry_type) {
                (EvaluatedPaint::Fill { color, opacity, .. }, GeometryType::Polygon) => {
                    bucket.add_fill(feature, color.to_rgba8(opacity));
                }
                (
                    EvaluatedPaint::Line { color, width, opacity },
                    GeometryType::LineString | GeometryType::Polygon,
                ) => {
                    for line in &feature.geometry {
                        bucket.add_line(line, width / 2.0, color.to_rgba8(opacity));
                    }
                }
                (EvaluatedPaint::Circle { color, radius, opacity }, _) => {
                    for point in feature.geometry.iter().flatten() {
                        bucket.add_circle(*point, radius, color.to_rgba8(opacity));
                    }
                }
                _ => {}
            }
            if bucket.indices.len() > before {
                bucket.feature_count += 1;
            }
        }
        if !bucket.is_empty() {
            buckets.push(Arc::new(bucket));
        }
    }
    buckets
}
