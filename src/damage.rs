//! Dirty region tracking
//!
//! Accumulates rectangles the producer marked changed since the last grab.
//! Coverage is never lost: when the set grows past its limit it collapses
//! into the bounding rectangle of everything marked so far.

/// Half-open rectangle `[x1, x2) x [y1, y2)` in framebuffer pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        )
    }
}

/// Bounding rectangle of a list, `None` when the list is empty
pub fn bounding(rects: &[Rect]) -> Option<Rect> {
    rects.iter().copied().reduce(|acc, r| acc.union(&r))
}

/// Collapse `rects` to a single bounding rectangle if longer than `max`
pub fn limit(rects: Vec<Rect>, max: usize) -> Vec<Rect> {
    if rects.len() <= max.max(1) {
        return rects;
    }
    bounding(&rects).into_iter().collect()
}

#[derive(Debug, Clone)]
pub struct DirtyRegionSet {
    rects: Vec<Rect>,
    bounds: Rect,
    limit: usize,
}

impl DirtyRegionSet {
    pub fn new(bounds: Rect, limit: usize) -> Self {
        Self {
            rects: Vec::new(),
            bounds,
            limit: limit.max(1),
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    /// Forget everything and adopt new frame bounds
    pub fn reset(&mut self, bounds: Rect) {
        self.bounds = bounds;
        self.rects.clear();
    }

    pub fn mark(&mut self, rect: Rect) {
        let rect = rect.intersect(&self.bounds);
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|r| r.contains(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains(r));
        self.rects.push(rect);

        if self.rects.len() > self.limit {
            if let Some(all) = bounding(&self.rects) {
                self.rects.clear();
                self.rects.push(all);
            }
        }
    }

    pub fn mark_full(&mut self) {
        self.rects.clear();
        if !self.bounds.is_empty() {
            self.rects.push(self.bounds);
        }
    }

    /// Read-and-clear
    pub fn drain(&mut self) -> Vec<Rect> {
        std::mem::take(&mut self.rects)
    }
}
