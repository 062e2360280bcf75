//! Modality-specific frame enhancement before inference
//!
//! Thermal frames are low-contrast single-channel images; contrast-limited
//! adaptive histogram equalization (CLAHE) brings out human silhouettes.
//! Color frames pass through unchanged.

use image::imageops;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Tiles per axis for CLAHE
const CLAHE_GRID: u32 = 8;
/// Max channel spread for a pixel to count as gray in auto mode
const GRAY_CHANNEL_TOLERANCE: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Color,
    Thermal,
    /// Decide per frame from the pixel data
    Auto,
}

/// Apply the enhancement for `modality`
pub fn preprocess(image: &RgbImage, modality: Modality) -> Cow<'_, RgbImage> {
    let thermal = match modality {
        Modality::Color => false,
        Modality::Thermal => true,
        Modality::Auto => looks_thermal(image),
    };

    if !thermal {
        return Cow::Borrowed(image);
    }

    let gray = imageops::grayscale(image);
    let clip_limit = adaptive_clip_limit(mean_brightness(&gray));
    let equalized = clahe(&gray, CLAHE_GRID, clip_limit);
    let smoothed = imageops::blur(&equalized, 1.0);

    Cow::Owned(gray_to_rgb(&smoothed))
}

/// Dark scenes get a higher clip limit
pub fn adaptive_clip_limit(mean: f32) -> f32 {
    if mean < 60.0 {
        4.0
    } else if mean < 100.0 {
        3.0
    } else {
        2.0
    }
}

pub fn mean_brightness(gray: &GrayImage) -> f32 {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    raw.iter().map(|&v| v as u64).sum::<u64>() as f32 / raw.len() as f32
}

/// Sampled check whether R, G and B are (almost) equal across the frame
pub fn looks_thermal(image: &RgbImage) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return false;
    }
    let step = (total / 2048).max(1);
    let mut sampled = 0usize;
    let mut gray = 0usize;

    for pixel in image.pixels().step_by(step) {
        let [r, g, b] = pixel.0;
        let spread = r.max(g).max(b) - r.min(g).min(b);
        if spread <= GRAY_CHANNEL_TOLERANCE {
            gray += 1;
        }
        sampled += 1;
    }

    gray * 100 >= sampled * 95
}

/// Contrast-limited adaptive histogram equalization
pub fn clahe(gray: &GrayImage, grid: u32, clip_limit: f32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let tiles_x = grid.clamp(1, width);
    let tiles_y = grid.clamp(1, height);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    // One lookup table per tile
    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            let count = (x1.saturating_sub(x0) * y1.saturating_sub(y0)).max(1);
            luts[(ty * tiles_x + tx) as usize] = tile_lut(&mut hist, count, clip_limit);
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        // Position relative to tile centers
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let ty0 = fy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let wy = (fy - ty0 as f32).clamp(0.0, 1.0);

        for x in 0..width {
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let tx0 = fx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let wx = (fx - tx0 as f32).clamp(0.0, 1.0);

            let v = gray.get_pixel(x, y).0[0] as usize;
            let at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;

            let top = at(tx0, ty0) * (1.0 - wx) + at(tx1, ty0) * wx;
            let bottom = at(tx0, ty1) * (1.0 - wx) + at(tx1, ty1) * wx;
            let value = top * (1.0 - wy) + bottom * wy;

            out.put_pixel(x, y, image::Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    out
}

/// Clip the histogram, redistribute the excess and build the CDF mapping
fn tile_lut(hist: &mut [u32; 256], count: u32, clip_limit: f32) -> [u8; 256] {
    let limit = ((clip_limit * count as f32 / 256.0).max(1.0)) as u32;

    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let share = excess / 256;
    let mut remainder = excess % 256;
    for bin in hist.iter_mut() {
        *bin += share;
        if remainder > 0 {
            *bin += 1;
            remainder -= 1;
        }
    }

    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cumulative += bin;
        lut[i] = ((cumulative as f32 * 255.0) / count as f32).round().min(255.0) as u8;
    }
    lut
}

fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y).0[0];
        image::Rgb([v, v, v])
    })
}
