use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, ImageFormat, Luma, Pixel};
use tracing::trace;

use crate::config::PreprocessConfig;
use crate::error::{Result, ScribeError};
use crate::models::{
    Frame, FrameGeometry, PreprocessStage, PreprocessedFrame, SkippedStage, Transformation,
};

/// Sauvola dynamic range for 8-bit images.
const SAUVOLA_R: f64 = 128.0;

/// Windows flatter than this fall back to the global Otsu threshold.
const FLAT_WINDOW_STD: f64 = 8.0;

/// Images flatter than this are not binarised at all.
const FLAT_IMAGE_STD: f64 = 2.0;

const INK_THRESHOLD: u8 = 128;
const MIN_INK_PIXELS: usize = 64;
const MAX_SKEW_SAMPLES: usize = 20_000;
const MAX_SKEW_DEGREES: i32 = 45;

/// Normalises decoded frames for the recognition engine.
///
/// Stages always run in the same order: resize, grayscale, denoise,
/// binarise, deskew, contrast. A stage that is disabled or cannot help is
/// recorded as skipped and the frame moves on unchanged.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

/// Estimated text-line tilt in degrees, positive when lines descend to the right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewEstimate {
    pub angle: f32,
    pub confidence: f32,
}

struct Run {
    transformations: Vec<Transformation>,
    skipped: Vec<SkippedStage>,
    rotation: f32,
}

impl Run {
    fn skip(&mut self, stage: PreprocessStage, reason: impl Into<String>) {
        self.skipped.push(SkippedStage {
            stage,
            reason: reason.into(),
        });
    }
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    pub fn process(&self, frame: Frame) -> PreprocessedFrame {
        let mut run = Run {
            transformations: Vec::new(),
            skipped: Vec::new(),
            rotation: 0.0,
        };
        let cfg = &self.config;

        // 0. resize
        let (width, height) = frame.image.dimensions();
        let image = if cfg.max_dimension > 0 {
            let resized = resize_if_needed(frame.image, cfg.max_dimension);
            let (to_width, to_height) = resized.dimensions();
            if (to_width, to_height) != (width, height) {
                run.transformations.push(Transformation::Resize {
                    from_width: width,
                    from_height: height,
                    to_width,
                    to_height,
                });
            }
            resized
        } else {
            frame.image
        };

        let (scaled_width, scaled_height) = image.dimensions();

        // 1. grayscale
        let image = remove_alpha(image);
        let output = if cfg.grayscale {
            run.transformations.push(Transformation::Grayscale);
            DynamicImage::ImageLuma8(self.process_gray(image.to_luma8(), &mut run))
        } else {
            run.skip(PreprocessStage::Grayscale, "disabled");
            DynamicImage::ImageRgb8(self.process_color(image.to_rgb8(), &mut run))
        };

        trace!(
            artifact_id = %frame.artifact_id,
            frame_index = frame.index,
            applied = run.transformations.len(),
            skipped = run.skipped.len(),
            "Frame preprocessed"
        );

        let geometry = FrameGeometry {
            source_width: width,
            source_height: height,
            scaled_width,
            scaled_height,
            rotation_degrees: run.rotation,
            canvas_width: output.width(),
            canvas_height: output.height(),
        };

        PreprocessedFrame {
            artifact_id: frame.artifact_id,
            index: frame.index,
            timestamp_ms: frame.timestamp_ms,
            image: output,
            transformations: run.transformations,
            skipped: run.skipped,
            geometry,
        }
    }

    fn process_color(&self, rgb: image::RgbImage, run: &mut Run) -> image::RgbImage {
        let rgb = self.denoise(rgb, run);
        for stage in [
            PreprocessStage::Binarize,
            PreprocessStage::Deskew,
            PreprocessStage::Contrast,
        ] {
            run.skip(stage, "requires grayscale input");
        }
        rgb
    }

    fn process_gray(&self, gray: GrayImage, run: &mut Run) -> GrayImage {
        let cfg = &self.config;

        // 2. denoise, always ahead of binarisation
        let gray = self.denoise(gray, run);

        // 3. binarise
        let mut binarized = false;
        let gray = if !cfg.binarize {
            run.skip(PreprocessStage::Binarize, "disabled");
            gray
        } else if std_dev(&gray) < FLAT_IMAGE_STD {
            run.skip(PreprocessStage::Binarize, "flat histogram");
            gray
        } else {
            let window = cfg.binarize_window.max(3) | 1;
            run.transformations.push(Transformation::Binarize {
                window,
                k: cfg.binarize_k,
            });
            binarized = true;
            sauvola(&gray, window, cfg.binarize_k)
        };

        // 4. deskew
        let gray = if !cfg.deskew {
            run.skip(PreprocessStage::Deskew, "disabled");
            gray
        } else {
            match estimate_skew(&gray) {
                None => {
                    run.skip(PreprocessStage::Deskew, "too little ink");
                    gray
                }
                Some(est) if est.confidence < cfg.deskew_min_confidence => {
                    run.skip(
                        PreprocessStage::Deskew,
                        format!("confidence {:.2} below threshold", est.confidence),
                    );
                    gray
                }
                Some(est) if est.angle.abs() < cfg.deskew_min_angle => {
                    run.skip(
                        PreprocessStage::Deskew,
                        format!("angle {:.1} below minimum", est.angle),
                    );
                    gray
                }
                Some(est) => {
                    run.transformations.push(Transformation::Deskew {
                        angle_degrees: -est.angle,
                        confidence: est.confidence,
                    });
                    run.rotation = -est.angle;
                    let rotated = rotate_gray(&gray, -est.angle);
                    if binarized {
                        threshold(rotated, INK_THRESHOLD)
                    } else {
                        rotated
                    }
                }
            }
        };

        // 5. contrast and gamma
        if !cfg.contrast {
            run.skip(PreprocessStage::Contrast, "disabled");
            return gray;
        }
        let (low, high) = min_max(&gray);
        let gamma = if cfg.gamma.is_finite() && cfg.gamma > 0.0 {
            cfg.gamma
        } else {
            1.0
        };
        if high <= low {
            run.skip(PreprocessStage::Contrast, "flat histogram");
            return gray;
        }
        if low == 0 && high == 255 && (gamma - 1.0).abs() < f32::EPSILON {
            run.skip(PreprocessStage::Contrast, "already full range");
            return gray;
        }
        run.transformations.push(Transformation::Contrast { low, high, gamma });
        apply_lut(&gray, &contrast_lut(low, high, gamma))
    }

    fn denoise<P>(&self, img: ImageBuffer<P, Vec<u8>>, run: &mut Run) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        if !self.config.denoise {
            run.skip(PreprocessStage::Denoise, "disabled");
            return img;
        }
        if self.config.denoise_radius == 0 {
            run.skip(PreprocessStage::Denoise, "radius is zero");
            return img;
        }
        run.transformations.push(Transformation::Denoise {
            radius: self.config.denoise_radius,
        });
        median_filter(&img, self.config.denoise_radius)
    }
}

/// Encode a frame as PNG, the format both the engine and frame dumps use.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut output), ImageFormat::Png)
        .map_err(|e| ScribeError::Internal(format!("Failed to encode image: {e}")))?;
    Ok(output)
}

/// Resize image if it exceeds maximum dimension while maintaining aspect ratio
///
/// Uses Lanczos3 filter for high-quality downscaling
fn resize_if_needed(img: DynamicImage, max_dim: u32) -> DynamicImage {
    let (width, height) = img.dimensions();

    if width <= max_dim && height <= max_dim {
        return img;
    }

    let ratio = if width > height {
        max_dim as f32 / width as f32
    } else {
        max_dim as f32 / height as f32
    };

    let new_width = ((width as f32 * ratio) as u32).max(1);
    let new_height = ((height as f32 * ratio) as u32).max(1);

    img.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3)
}

/// Drop the alpha channel, compositing nothing: transparent pixels keep their colour.
fn remove_alpha(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgba8(_) | DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_) => {
            DynamicImage::ImageRgb8(img.to_rgb8())
        }
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
            DynamicImage::ImageLuma8(img.to_luma8())
        }
        _ => img,
    }
}

fn median_filter<P>(img: &ImageBuffer<P, Vec<u8>>, radius: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = img.dimensions();
    let r = radius as i64;
    let channels = P::CHANNEL_COUNT as usize;
    let mut out: ImageBuffer<P, Vec<u8>> = ImageBuffer::new(w, h);
    let mut window: Vec<u8> = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);

    for y in 0..h {
        for x in 0..w {
            let mut pixel = *img.get_pixel(x, y);
            for c in 0..channels {
                window.clear();
                for dy in -r..=r {
                    let sy = (y as i64 + dy).clamp(0, h as i64 - 1) as u32;
                    for dx in -r..=r {
                        let sx = (x as i64 + dx).clamp(0, w as i64 - 1) as u32;
                        window.push(img.get_pixel(sx, sy).channels()[c]);
                    }
                }
                let mid = window.len() / 2;
                let (_, median, _) = window.select_nth_unstable(mid);
                pixel.channels_mut()[c] = *median;
            }
            out.put_pixel(x, y, pixel);
        }
    }
    out
}

fn std_dev(gray: &GrayImage) -> f64 {
    let n = (gray.width() as f64) * (gray.height() as f64);
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sq) = gray.pixels().fold((0f64, 0f64), |(s, q), p| {
        let v = p[0] as f64;
        (s + v, q + v * v)
    });
    let mean = sum / n;
    (sq / n - mean * mean).max(0.0).sqrt()
}

fn min_max(gray: &GrayImage) -> (u8, u8) {
    gray.pixels()
        .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])))
}

/// Global Otsu threshold; pixels `<=` the result are ink.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total: f64 = hist.iter().sum::<u64>() as f64;
    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &n)| i as f64 * n as f64)
        .sum();

    let mut weight_bg = 0f64;
    let mut sum_bg = 0f64;
    let mut best = -1f64;
    let mut threshold = 0u8;

    for (t, &count) in hist.iter().enumerate() {
        weight_bg += count as f64;
        if weight_bg == 0.0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0.0 {
            break;
        }
        sum_bg += t as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_all - sum_bg) / weight_fg;
        let between = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);
        if between > best {
            best = between;
            threshold = t as u8;
        }
    }
    threshold
}

fn integral_images(gray: &GrayImage) -> (Vec<u64>, Vec<u64>) {
    let (w, h) = gray.dimensions();
    let stride = w as usize + 1;
    let mut sum = vec![0u64; stride * (h as usize + 1)];
    let mut sq = vec![0u64; stride * (h as usize + 1)];

    for y in 0..h as usize {
        let mut row_sum = 0u64;
        let mut row_sq = 0u64;
        for x in 0..w as usize {
            let v = gray.get_pixel(x as u32, y as u32)[0] as u64;
            row_sum += v;
            row_sq += v * v;
            let idx = (y + 1) * stride + x + 1;
            sum[idx] = sum[idx - stride] + row_sum;
            sq[idx] = sq[idx - stride] + row_sq;
        }
    }
    (sum, sq)
}

fn rect_sum(table: &[u64], stride: usize, x0: usize, y0: usize, x1: usize, y1: usize) -> u64 {
    table[y1 * stride + x1] + table[y0 * stride + x0] - table[y0 * stride + x1] - table[y1 * stride + x0]
}

/// Sauvola local thresholding over integral images.
fn sauvola(gray: &GrayImage, window: u32, k: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (sum, sq) = integral_images(gray);
    let stride = w as usize + 1;
    let half = (window / 2) as i64;
    let global = otsu_threshold(gray);
    let k = k as f64;

    GrayImage::from_fn(w, h, |x, y| {
        let x0 = (x as i64 - half).max(0) as usize;
        let y0 = (y as i64 - half).max(0) as usize;
        let x1 = (x as i64 + half + 1).min(w as i64) as usize;
        let y1 = (y as i64 + half + 1).min(h as i64) as usize;
        let n = ((x1 - x0) * (y1 - y0)) as f64;

        let mean = rect_sum(&sum, stride, x0, y0, x1, y1) as f64 / n;
        let var = rect_sum(&sq, stride, x0, y0, x1, y1) as f64 / n - mean * mean;
        let std = var.max(0.0).sqrt();

        let v = gray.get_pixel(x, y)[0];
        let ink = if std < FLAT_WINDOW_STD {
            v <= global
        } else {
            (v as f64) <= mean * (1.0 + k * (std / SAUVOLA_R - 1.0))
        };
        Luma([if ink { 0 } else { 255 }])
    })
}

fn threshold(gray: GrayImage, level: u8) -> GrayImage {
    let mut gray = gray;
    for p in gray.pixels_mut() {
        p[0] = if p[0] < level { 0 } else { 255 };
    }
    gray
}

/// Projection-profile skew search over [-45°, 45°]: coarse 1° steps, then
/// 0.1° steps around the best coarse angle.
///
/// Returns `None` when there is too little ink to measure.
pub fn estimate_skew(gray: &GrayImage) -> Option<SkewEstimate> {
    let (w, h) = gray.dimensions();
    let cx = w as f64 / 2.0;
    let cy = h as f64 / 2.0;

    let mut points: Vec<(f64, f64)> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] < INK_THRESHOLD)
        .map(|(x, y, _)| (x as f64 + 0.5 - cx, y as f64 + 0.5 - cy))
        .collect();
    if points.len() < MIN_INK_PIXELS {
        return None;
    }
    if points.len() > MAX_SKEW_SAMPLES {
        let step = points.len().div_ceil(MAX_SKEW_SAMPLES);
        points = points.into_iter().step_by(step).collect();
    }

    let diagonal = ((w as f64).powi(2) + (h as f64).powi(2)).sqrt();
    let offset = diagonal / 2.0 + 1.0;
    let bins = diagonal.ceil() as usize + 3;
    let mut hist = vec![0u32; bins];

    let mut score = |angle: f64| -> f64 {
        hist.iter_mut().for_each(|b| *b = 0);
        let (s, c) = angle.to_radians().sin_cos();
        for &(x, y) in &points {
            let r = y * c - x * s + offset;
            let idx = (r as usize).min(bins - 1);
            hist[idx] += 1;
        }
        hist.iter().map(|&n| (n as f64) * (n as f64)).sum()
    };

    let mut best_angle = 0f64;
    let mut best_score = f64::MIN;
    let mut total = 0f64;
    let mut count = 0f64;
    for step in -MAX_SKEW_DEGREES..=MAX_SKEW_DEGREES {
        let angle = step as f64;
        let s = score(angle);
        total += s;
        count += 1.0;
        // ties go to the angle closest to level
        if s > best_score || (s == best_score && angle.abs() < best_angle.abs()) {
            best_score = s;
            best_angle = angle;
        }
    }
    let mean = total / count;

    let coarse = best_angle;
    for step in -10..=10 {
        if step == 0 {
            continue;
        }
        let angle = coarse + step as f64 * 0.1;
        if angle.abs() > MAX_SKEW_DEGREES as f64 {
            continue;
        }
        let s = score(angle);
        if s > best_score {
            best_score = s;
            best_angle = angle;
        }
    }

    if best_score <= 0.0 {
        return None;
    }

    Some(SkewEstimate {
        angle: ((best_angle * 10.0).round() / 10.0) as f32,
        confidence: (1.0 - mean / best_score).clamp(0.0, 1.0) as f32,
    })
}

/// Rotate content by `angle` degrees (positive turns the x axis toward the
/// y axis) onto a canvas large enough to keep every corner. Uncovered
/// area is white.
pub fn rotate_gray(gray: &GrayImage, angle: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let (s, c) = (angle as f64).to_radians().sin_cos();
    let new_w = (w as f64 * c.abs() + h as f64 * s.abs() - 1e-9).ceil().max(1.0) as u32;
    let new_h = (w as f64 * s.abs() + h as f64 * c.abs() - 1e-9).ceil().max(1.0) as u32;

    let (cx_in, cy_in) = (w as f64 / 2.0, h as f64 / 2.0);
    let (cx_out, cy_out) = (new_w as f64 / 2.0, new_h as f64 / 2.0);

    GrayImage::from_fn(new_w, new_h, |x, y| {
        let qx = x as f64 + 0.5 - cx_out;
        let qy = y as f64 + 0.5 - cy_out;
        let px = c * qx + s * qy + cx_in - 0.5;
        let py = -s * qx + c * qy + cy_in - 0.5;
        Luma([bilinear(gray, px, py)])
    })
}

fn bilinear(gray: &GrayImage, u: f64, v: f64) -> u8 {
    let (w, h) = (gray.width() as f64, gray.height() as f64);
    let sample = |x: f64, y: f64| -> f64 {
        if x < 0.0 || y < 0.0 || x >= w || y >= h {
            255.0
        } else {
            gray.get_pixel(x as u32, y as u32)[0] as f64
        }
    };

    let x0 = u.floor();
    let y0 = v.floor();
    let fx = u - x0;
    let fy = v - y0;

    let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1.0, y0) * fx;
    let bottom = sample(x0, y0 + 1.0) * (1.0 - fx) + sample(x0 + 1.0, y0 + 1.0) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Stretch `[low, high]` to the full range, then apply gamma.
fn contrast_lut(low: u8, high: u8, gamma: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let range = (high - low) as f32;
    let inv_gamma = 1.0 / gamma;
    for (v, slot) in lut.iter_mut().enumerate() {
        let clamped = (v as f32).clamp(low as f32, high as f32);
        let normalized = (clamped - low as f32) / range;
        *slot = (normalized.powf(inv_gamma) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn apply_lut(gray: &GrayImage, lut: &[u8; 256]) -> GrayImage {
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
    out
}
