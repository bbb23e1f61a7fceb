//! Pixel helpers shared by the locator, the encoders and the capture checks.
//!
//! Frames are `image::RgbImage` throughout the pipeline.

use crate::types::FaceBox;
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};

/// Crop the face region of `frame`. Returns `None` for zero-area boxes.
pub fn crop_face(frame: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    let clipped = face.clipped(frame.width(), frame.height())?;
    let (x, y, w, h) = clipped.pixel_rect();
    let w = w.min(frame.width().saturating_sub(x));
    let h = h.min(frame.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return None;
    }
    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Luma conversion with the BT.601 weights (0.299 R + 0.587 G + 0.114 B).
pub fn to_grayscale(img: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(img.width(), img.height());
    for (x, y, p) in img.enumerate_pixels() {
        let v = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        gray.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
    }
    gray
}

/// Mean gray level (0.0–255.0).
pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&p| p as f64).sum::<f64>() / n as f64
}

/// Variance of the 4-neighbour Laplacian response, a standard focus measure.
///
/// Borders are reflected without repeating the edge pixel (`dcba|bcd`).
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let w = gray.width() as i64;
    let h = gray.height() as i64;
    if w == 0 || h == 0 {
        return 0.0;
    }
    let data = gray.as_raw();
    let at = |x: i64, y: i64| -> f64 {
        let x = reflect_101(x, w);
        let y = reflect_101(y, h);
        data[(y * w + x) as usize] as f64
    };

    let n = (w * h) as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn reflect_101(i: i64, len: i64) -> i64 {
    if len == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= len {
        if i < 0 {
            i = -i;
        }
        if i >= len {
            i = 2 * (len - 1) - i;
        }
    }
    i
}

/// Resize with pixel-area averaging when shrinking; bilinear when enlarging.
pub fn resize_area(img: &RgbImage, dst_w: u32, dst_h: u32) -> RgbImage {
    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return RgbImage::new(dst_w, dst_h);
    }
    if (src_w, src_h) == (dst_w, dst_h) {
        return img.clone();
    }
    if dst_w >= src_w && dst_h >= src_h {
        return image::imageops::resize(img, dst_w, dst_h, FilterType::Triangle);
    }

    let xw = area_weights(src_w, dst_w);
    let yw = area_weights(src_h, dst_h);
    let mut out = RgbImage::new(dst_w, dst_h);

    for (oy, row_weights) in yw.iter().enumerate() {
        for (ox, col_weights) in xw.iter().enumerate() {
            let mut acc = [0.0f32; 3];
            let mut total = 0.0f32;
            for &(sy, wy) in row_weights {
                for &(sx, wx) in col_weights {
                    let p = img.get_pixel(sx, sy);
                    let wgt = wx * wy;
                    acc[0] += p[0] as f32 * wgt;
                    acc[1] += p[1] as f32 * wgt;
                    acc[2] += p[2] as f32 * wgt;
                    total += wgt;
                }
            }
            let px = if total > 0.0 {
                [
                    (acc[0] / total).round().clamp(0.0, 255.0) as u8,
                    (acc[1] / total).round().clamp(0.0, 255.0) as u8,
                    (acc[2] / total).round().clamp(0.0, 255.0) as u8,
                ]
            } else {
                [0, 0, 0]
            };
            out.put_pixel(ox as u32, oy as u32, image::Rgb(px));
        }
    }
    out
}

/// For each output index, the source indices it covers and their coverage.
fn area_weights(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let scale = src as f32 / dst as f32;
    (0..dst)
        .map(|o| {
            let start = o as f32 * scale;
            let end = ((o + 1) as f32 * scale).min(src as f32);
            let first = start.floor() as u32;
            let last = (end.ceil() as u32).min(src);
            (first..last)
                .filter_map(|i| {
                    let cover = (end.min((i + 1) as f32) - start.max(i as f32)).max(0.0);
                    (cover > 0.0).then_some((i, cover))
                })
                .collect()
        })
        .collect()
}

/// Downscale `frame` so neither side exceeds `max_side`.
///
/// Returns the (possibly borrowed) frame and the factor that maps coordinates
/// in the returned frame back to the original (1.0 when no resize happened).
pub fn limit_size(frame: &RgbImage, max_side: u32) -> (std::borrow::Cow<'_, RgbImage>, f32) {
    let longest = frame.width().max(frame.height());
    if max_side == 0 || longest <= max_side {
        return (std::borrow::Cow::Borrowed(frame), 1.0);
    }
    let scale = max_side as f32 / longest as f32;
    let w = ((frame.width() as f32 * scale).round() as u32).max(1);
    let h = ((frame.height() as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(frame, w, h, FilterType::Triangle);
    (std::borrow::Cow::Owned(resized), frame.width() as f32 / w as f32)
}
