//! Geometry primitives: rectangles and regions.
//!
//! A [`Region`] is a set of pairwise-disjoint rectangles. Regions are used
//! for dirty/damage tracking, visible-area computation, and copy-back
//! bookkeeping, so the set operations here are exact: adding, subtracting
//! and intersecting never over- or under-approximate the covered area.

use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle with integer coordinates.
///
/// A rectangle with non-positive width or height is considered empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    /// The intersection of two rectangles; empty when they do not overlap.
    pub fn intersection(&self, other: &Self) -> Self {
        if !self.intersects(other) {
            return Self::default();
        }
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// The smallest rectangle containing both inputs.
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = self.right().max(other.right());
        let y2 = self.bottom().max(other.bottom());
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains_rect(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    pub fn contains_point(&self, px: i32, py: i32) -> bool {
        !self.is_empty() && px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Splits `self - other` into at most four disjoint rectangles.
    fn subtract_into(&self, other: &Self, out: &mut Vec<Rect>) {
        if !self.intersects(other) {
            if !self.is_empty() {
                out.push(*self);
            }
            return;
        }
        if other.contains_rect(self) {
            return;
        }

        // Top band
        if self.y < other.y {
            out.push(Rect::new(self.x, self.y, self.width, other.y - self.y));
        }
        // Bottom band
        if self.bottom() > other.bottom() {
            out.push(Rect::new(
                self.x,
                other.bottom(),
                self.width,
                self.bottom() - other.bottom(),
            ));
        }
        // Left and right bands within the vertical overlap
        let y1 = self.y.max(other.y);
        let y2 = self.bottom().min(other.bottom());
        if y1 < y2 {
            if self.x < other.x {
                out.push(Rect::new(self.x, y1, other.x - self.x, y2 - y1));
            }
            if self.right() > other.right() {
                out.push(Rect::new(other.right(), y1, self.right() - other.right(), y2 - y1));
            }
        }
    }
}

/// A set of pairwise-disjoint rectangles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Region {
    rectangles: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self { rectangles: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.set(rect);
        region
    }

    /// Replaces the region's contents with a single rectangle.
    pub fn set(&mut self, rect: Rect) {
        self.rectangles.clear();
        if !rect.is_empty() {
            self.rectangles.push(rect);
        }
    }

    pub fn clear(&mut self) {
        self.rectangles.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rectangles.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rectangles
    }

    /// Number of rectangles currently stored.
    pub fn rect_count(&self) -> usize {
        self.rectangles.len()
    }

    /// Total covered area. Exact, since the rectangles are disjoint.
    pub fn area(&self) -> i64 {
        self.rectangles.iter().map(Rect::area).sum()
    }

    /// The bounding rectangle of the region; empty for an empty region.
    pub fn bounds(&self) -> Rect {
        self.rectangles
            .iter()
            .fold(Rect::default(), |acc, r| acc.union(r))
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rectangles.iter().any(|r| r.contains_point(x, y))
    }

    /// Adds a rectangle to the region.
    ///
    /// Only the parts of `rect` not already covered are inserted, so the
    /// rectangles stay disjoint and the area stays exact.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pending = vec![rect];
        for existing in &self.rectangles {
            let mut next = Vec::new();
            for piece in &pending {
                piece.subtract_into(existing, &mut next);
            }
            pending = next;
            if pending.is_empty() {
                return;
            }
        }
        self.rectangles.extend(pending);
    }

    /// Removes a rectangle from the region, fragmenting as needed.
    pub fn subtract_rect(&mut self, rect: Rect) {
        if rect.is_empty() || self.rectangles.is_empty() {
            return;
        }
        let mut result = Vec::new();
        for existing in &self.rectangles {
            existing.subtract_into(&rect, &mut result);
        }
        self.rectangles = result;
    }

    /// Removes every rectangle of `other` from this region.
    pub fn subtract(&mut self, other: &Region) {
        for rect in other.rects() {
            self.subtract_rect(*rect);
        }
    }

    /// Intersects the region with a rectangle in place.
    pub fn intersect_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            self.rectangles.clear();
            return;
        }
        self.rectangles = self
            .rectangles
            .iter()
            .map(|r| r.intersection(&rect))
            .filter(|r| !r.is_empty())
            .collect();
    }

    /// Unions another region into this one.
    pub fn union_with(&mut self, other: &Region) {
        for rect in other.rects() {
            self.add_rect(*rect);
        }
    }

    /// Returns `self - other` without mutating either region.
    pub fn difference(&self, other: &Region) -> Region {
        let mut result = self.clone();
        result.subtract(other);
        result
    }

    /// Collapses the region to its bounding rectangle once it holds more
    /// than `max_rects` fragments. Damage consumers use this to bound
    /// bookkeeping cost; the result over-approximates, which is safe for
    /// damage.
    pub fn collapse_if_complex(&mut self, max_rects: usize) {
        if self.rectangles.len() > max_rects {
            let bounds = self.bounds();
            self.set(bounds);
        }
    }
}

impl PartialEq for Region {
    /// Two regions are equal when they cover the same points, regardless of
    /// how the coverage is fragmented.
    fn eq(&self, other: &Self) -> bool {
        self.difference(other).is_empty() && other.difference(self).is_empty()
    }
}

impl Eq for Region {}
