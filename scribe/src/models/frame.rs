use image::DynamicImage;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ArtifactId, BoundingBox};

/// One raster frame pulled from an artifact. Lives only in memory.
#[derive(Debug, Clone)]
pub struct Frame {
    pub artifact_id: ArtifactId,
    /// 0 for still images, sequential over sampled frames otherwise.
    pub index: u32,
    /// Offset from the start of the media; `None` for still images.
    pub timestamp_ms: Option<u64>,
    pub image: DynamicImage,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessStage {
    Resize,
    Grayscale,
    Denoise,
    Binarize,
    Deskew,
    Contrast,
}

/// A transformation the preprocessor actually applied, in application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Transformation {
    Resize {
        from_width: u32,
        from_height: u32,
        to_width: u32,
        to_height: u32,
    },
    Grayscale,
    Denoise { radius: u32 },
    Binarize { window: u32, k: f32 },
    Deskew { angle_degrees: f32, confidence: f32 },
    Contrast { low: u8, high: u8, gamma: f32 },
}

impl Transformation {
    pub fn stage(&self) -> PreprocessStage {
        match self {
            Self::Resize { .. } => PreprocessStage::Resize,
            Self::Grayscale => PreprocessStage::Grayscale,
            Self::Denoise { .. } => PreprocessStage::Denoise,
            Self::Binarize { .. } => PreprocessStage::Binarize,
            Self::Deskew { .. } => PreprocessStage::Deskew,
            Self::Contrast { .. } => PreprocessStage::Contrast,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SkippedStage {
    pub stage: PreprocessStage,
    pub reason: String,
}

/// How a preprocessed image relates to the frame it came from: a uniform
/// downscale followed by a rotation about the centre onto an expanded canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGeometry {
    pub source_width: u32,
    pub source_height: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub rotation_degrees: f32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl FrameGeometry {
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            source_width: width,
            source_height: height,
            scaled_width: width,
            scaled_height: height,
            rotation_degrees: 0.0,
            canvas_width: width,
            canvas_height: height,
        }
    }

    fn is_identity(&self) -> bool {
        *self == Self::identity(self.source_width, self.source_height)
    }

    /// Map a box on the preprocessed image back onto the source frame.
    ///
    /// Rotated boxes become the axis-aligned box around their corners,
    /// clipped to the frame.
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        if self.is_identity() || self.scaled_width == 0 || self.scaled_height == 0 {
            return *bbox;
        }

        let (s, c) = (self.rotation_degrees as f64).to_radians().sin_cos();
        let (cx_in, cy_in) = (self.scaled_width as f64 / 2.0, self.scaled_height as f64 / 2.0);
        let (cx_out, cy_out) = (self.canvas_width as f64 / 2.0, self.canvas_height as f64 / 2.0);
        let scale_x = self.source_width as f64 / self.scaled_width as f64;
        let scale_y = self.source_height as f64 / self.scaled_height as f64;

        let (x0, y0) = (bbox.x as f64, bbox.y as f64);
        let (x1, y1) = (x0 + bbox.width as f64, y0 + bbox.height as f64);

        let mut min = (f64::MAX, f64::MAX);
        let mut max = (f64::MIN, f64::MIN);
        for (x, y) in [(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
            let qx = x - cx_out;
            let qy = y - cy_out;
            let px = (c * qx + s * qy + cx_in) * scale_x;
            let py = (-s * qx + c * qy + cy_in) * scale_y;
            min = (min.0.min(px), min.1.min(py));
            max = (max.0.max(px), max.1.max(py));
        }

        // Trig noise must not grow a box by a whole pixel.
        let snap = |v: f64| if (v - v.round()).abs() < 1e-6 { v.round() } else { v };
        let clip = |v: f64, limit: u32| v.clamp(0.0, limit as f64);
        let left = clip(snap(min.0).floor(), self.source_width);
        let top = clip(snap(min.1).floor(), self.source_height);
        let right = clip(snap(max.0).ceil(), self.source_width);
        let bottom = clip(snap(max.1).ceil(), self.source_height);

        BoundingBox {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreprocessedFrame {
    pub artifact_id: ArtifactId,
    pub index: u32,
    pub timestamp_ms: Option<u64>,
    pub image: DynamicImage,
    pub transformations: Vec<Transformation>,
    pub skipped: Vec<SkippedStage>,
    pub geometry: FrameGeometry,
}

impl PreprocessedFrame {
    pub fn applied(&self, stage: PreprocessStage) -> bool {
        self.transformations.iter().any(|t| t.stage() == stage)
    }
}
