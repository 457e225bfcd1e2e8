//! Planar geometry for fence containment.
//!
//! Coordinates are image pixels: x grows to the right, y grows downwards.
//! `Polygon` is the only place a fence's shape is validated; a polygon with
//! fewer than three vertices cannot be constructed.

use serde::{Deserialize, Serialize};

use crate::fence::FenceError;

/// Overlap threshold at or above which only the primary anchor is consulted.
pub const FUZZY_THRESHOLD_CUTOFF: f32 = 0.5;

const EDGE_EPSILON: f32 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box `[x1, y1, x2, y2]` as emitted by the detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Ground-contact anchor: the middle of the bottom edge.
    ///
    /// Box coordinates are truncated to whole pixels first, matching what
    /// the detector reports for integer pixel boxes.
    pub fn bottom_center(&self) -> Point {
        let (x1, _, x2, y2) = self.pixels();
        Point::new(((x1 + x2) / 2.0).floor(), y2)
    }

    pub fn center(&self) -> Point {
        let (x1, y1, x2, y2) = self.pixels();
        Point::new(((x1 + x2) / 2.0).floor(), ((y1 + y2) / 2.0).floor())
    }

    /// Top-left, top-right, bottom-left, bottom-right.
    pub fn corners(&self) -> [Point; 4] {
        let (x1, y1, x2, y2) = self.pixels();
        [
            Point::new(x1, y1),
            Point::new(x2, y1),
            Point::new(x1, y2),
            Point::new(x2, y2),
        ]
    }

    fn pixels(&self) -> (f32, f32, f32, f32) {
        (
            self.x1.trunc(),
            self.y1.trunc(),
            self.x2.trunc(),
            self.y2.trunc(),
        )
    }
}

impl From<[f32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Closed polygon ring. The closing edge from the last vertex back to the
/// first is implied.
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Result<Self, FenceError> {
        if vertices.len() < 3 {
            return Err(FenceError::TooFewVertices(vertices.len()));
        }
        if vertices.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(FenceError::NonFiniteVertex);
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Point-in-polygon test. Points on an edge or vertex count as inside.
    pub fn contains(&self, p: Point) -> bool {
        if self.edges().any(|(a, b)| on_segment(p, a, b)) {
            return true;
        }

        // Crossing number: count edges straddling the horizontal ray to +x.
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Decide whether a bounding box is inside the zone.
    ///
    /// The bottom-center anchor decides on its own. When `threshold` is below
    /// [`FUZZY_THRESHOLD_CUTOFF`], a box whose anchor is outside can still
    /// count as inside if at least `threshold` of its four corners and center
    /// fall within the polygon.
    pub fn contains_bbox(&self, bbox: &BBox, threshold: f32) -> bool {
        if self.contains(bbox.bottom_center()) {
            return true;
        }
        if threshold >= FUZZY_THRESHOLD_CUTOFF {
            return false;
        }

        let corners = bbox.corners();
        let probes = corners.iter().copied().chain(std::iter::once(bbox.center()));
        let inside = probes.filter(|p| self.contains(*p)).count();
        (inside as f32 / 5.0) >= threshold
    }
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EDGE_EPSILON * (1.0 + (b.x - a.x).abs() + (b.y - a.y).abs()) {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}
