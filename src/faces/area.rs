//! Pixel areas of detected faces and facial landmarks.

use serde::{Deserialize, Serialize};

/// Square region centered at (`row`, `col`) with side length `scale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub name: String,
    pub row: i32,
    pub col: i32,
    pub scale: i32,
}

impl Area {
    pub fn new(name: impl Into<String>, row: i32, col: i32, scale: i32) -> Self {
        Self {
            name: name.into(),
            row,
            col,
            scale,
        }
    }

    pub fn top(&self) -> i32 {
        self.row - self.scale / 2
    }

    pub fn left(&self) -> i32 {
        self.col - self.scale / 2
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            x: self.left(),
            y: self.top(),
            width: self.scale,
            height: self.scale,
        }
    }

    /// Same center, side length multiplied by `factor`.
    pub fn padded(&self, factor: f32) -> Area {
        Area {
            name: self.name.clone(),
            row: self.row,
            col: self.col,
            scale: (self.scale as f32 * factor).round() as i32,
        }
    }

    /// Intersection as a percentage of the smaller of the two areas.
    pub fn overlap_percent(&self, other: &Area) -> f64 {
        let a = self.bounds();
        let b = other.bounds();
        let smaller = a.area().min(b.area());
        if smaller <= 0 {
            return 0.0;
        }
        a.intersection(&b) as f64 / smaller as f64 * 100.0
    }

    /// Position and size as fractions of an image with `rows` x `cols` pixels.
    pub fn relative(&self, rows: u32, cols: u32) -> RelativeArea {
        if rows == 0 || cols == 0 {
            return RelativeArea::default();
        }

        let rows = rows as f32;
        let cols = cols as f32;
        let x = (self.left() as f32 / cols).clamp(0.0, 1.0);
        let y = (self.top() as f32 / rows).clamp(0.0, 1.0);

        RelativeArea {
            x,
            y,
            w: (self.scale as f32 / cols).min(1.0 - x),
            h: (self.scale as f32 / rows).min(1.0 - y),
        }
    }
}

pub type Areas = Vec<Area>;

/// Area relative to the image dimensions, all values in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RelativeArea {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    pub fn intersection(&self, other: &BoundingBox) -> i64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        (x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection(other) as f32;
        let union = (self.area() + other.area()) as f32 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Clip to an image of `width` x `height`, keeping at least one pixel.
    pub fn clip(&self, width: u32, height: u32) -> BoundingBox {
        let max_x = width.saturating_sub(1) as i32;
        let max_y = height.saturating_sub(1) as i32;
        let x = self.x.clamp(0, max_x);
        let y = self.y.clamp(0, max_y);
        let right = (self.x + self.width).clamp(x + 1, width as i32);
        let bottom = (self.y + self.height).clamp(y + 1, height as i32);

        BoundingBox {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}
