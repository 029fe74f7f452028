use serde::{Deserialize, Serialize};

/// A detected face: bounding box in frame pixels plus detector confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub position: (f64, f64),
    pub size: (f64, f64),
    pub confidence: f64,
}

impl Region {
    /// Build a region from normalized corner coordinates as emitted by an SSD-style detector.
    pub fn from_corners(xmin: f64, ymin: f64, xmax: f64, ymax: f64, confidence: f64) -> Self {
        Self {
            position: (xmin, ymin),
            size: (xmax - xmin, ymax - ymin),
            confidence,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.position.0 + self.size.0 * 0.5,
            self.position.1 + self.size.1 * 0.5,
        )
    }

    /// Scale normalized [0, 1] coordinates into pixel coordinates.
    pub fn resize(&mut self, frame_width: f64, frame_height: f64) {
        self.position.0 *= frame_width;
        self.position.1 *= frame_height;
        self.size.0 *= frame_width;
        self.size.1 *= frame_height;
    }

    /// Grow (or shrink) the box by `factor` about its own center.
    pub fn rescale(&mut self, factor: f64) {
        self.position.0 -= self.size.0 * 0.5 * (factor - 1.0);
        self.position.1 -= self.size.1 * 0.5 * (factor - 1.0);
        self.size.0 *= factor;
        self.size.1 *= factor;
    }

    /// Clamp the box so that both corners lie inside `[0, width] x [0, height]`.
    pub fn clip(&mut self, width: f64, height: f64) {
        let x1 = (self.position.0 + self.size.0).clamp(0.0, width);
        let y1 = (self.position.1 + self.size.1).clamp(0.0, height);
        self.position.0 = self.position.0.clamp(0.0, width);
        self.position.1 = self.position.1.clamp(0.0, height);
        self.size.0 = (x1 - self.position.0).max(0.0);
        self.size.1 = (y1 - self.position.1).max(0.0);
    }
}

/// Left and right eye geometry for one face.
///
/// `size` is the distance between the two eye centers on both axes, so each
/// eye crop (`position[i]`, `size`) is square and centred on `center[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarksResult {
    /// Eye centers: `[left, right]`.
    pub center: [(f64, f64); 2],
    pub size: (f64, f64),
    /// Top-left corner of each eye crop: `[left, right]`.
    pub position: [(f64, f64); 2],
}

impl LandmarksResult {
    pub fn from_centers(left: (f64, f64), right: (f64, f64)) -> Self {
        let mut result = Self {
            center: [left, right],
            size: (0.0, 0.0),
            position: [(0.0, 0.0); 2],
        };
        result.update_extent();
        result
    }

    /// Derive centers from eye-corner points.
    ///
    /// `corners` holds two points for the right eye followed by two points for
    /// the left eye; each center is the midpoint of its pair.
    pub fn from_corners(corners: [(f64, f64); 4]) -> Self {
        let midpoint = |a: (f64, f64), b: (f64, f64)| ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0);
        let right = midpoint(corners[0], corners[1]);
        let left = midpoint(corners[2], corners[3]);
        Self::from_centers(left, right)
    }

    /// Distance between the two eye centers.
    pub fn eye_distance(&self) -> f64 {
        let dx = self.center[0].0 - self.center[1].0;
        let dy = self.center[0].1 - self.center[1].1;
        (dx * dx + dy * dy).sqrt()
    }

    /// Map centers from the unit square of a face crop onto a `width x height`
    /// box. The crop side is recomputed in the new space so it stays square.
    pub fn resize(&mut self, width: f64, height: f64) {
        for c in &mut self.center {
            c.0 *= width;
            c.1 *= height;
        }
        self.update_extent();
    }

    pub fn shift(&mut self, dx: f64, dy: f64) {
        for p in self.center.iter_mut().chain(self.position.iter_mut()) {
            p.0 += dx;
            p.1 += dy;
        }
    }

    pub fn clip(&mut self, width: f64, height: f64) {
        for p in self.center.iter_mut().chain(self.position.iter_mut()) {
            p.0 = p.0.clamp(0.0, width);
            p.1 = p.1.clamp(0.0, height);
        }
        self.size.0 = self.size.0.clamp(0.0, width);
        self.size.1 = self.size.1.clamp(0.0, height);
    }

    fn update_extent(&mut self) {
        let side = self.eye_distance();
        self.size = (side, side);
        for (pos, c) in self.position.iter_mut().zip(self.center.iter()) {
            *pos = (c.0 - side / 2.0, c.1 - side / 2.0);
        }
    }
}

/// Head orientation in the engine's native angle units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl HeadPose {
    pub fn to_array(self) -> [f64; 3] {
        [self.yaw, self.pitch, self.roll]
    }
}

/// Gaze direction in model space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazeVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl GazeVector {
    /// 2D direction for drawing on an image, where the vertical axis points down.
    pub fn display_direction(&self) -> (f64, f64) {
        (self.x, -self.y)
    }
}

/// Per-eye open probability in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeState {
    pub left_open: f64,
    pub right_open: f64,
}

impl EyeState {
    pub fn both_open(&self, threshold: f64) -> bool {
        self.left_open >= threshold && self.right_open >= threshold
    }
}
