//! Still and animated event previews
//!
//! Pure image composition over ring-buffer samples; nothing here touches the
//! filesystem or spawns processes.

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, ImageError, Rgb, RgbImage, Rgba, RgbaImage};
use std::borrow::Borrow;

use crate::ring_buffer::SampledFrame;

pub const COLLAGE_SLOTS: usize = 5;
const GRID_COLUMNS: u32 = 3;
const GRID_ROWS: u32 = 2;
const GUTTER: u32 = 4;

const BACKGROUND: Rgb<u8> = Rgb([24, 24, 24]);
const PEAK_COLOR: Rgb<u8> = Rgb([230, 40, 40]);
const BOX_COLOR: Rgb<u8> = Rgb([250, 200, 30]);
const MUTED: Rgb<u8> = Rgb([200, 200, 200]);

/// Sample holding the highest-confidence detection
pub fn peak_index<S: Borrow<SampledFrame>>(samples: &[S]) -> Option<usize> {
    samples
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.borrow().peak_confidence().map(|c| (i, c)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// `slots` indices spread across the buffer with `peak` in the middle slot
/// where the buffer edges allow it
pub fn collage_indices(len: usize, peak: usize, slots: usize) -> Vec<usize> {
    if len == 0 || slots == 0 {
        return Vec::new();
    }
    if len <= slots {
        return (0..len).collect();
    }

    let mut stride = (len / (2 * slots)).max(1);
    if (slots - 1) * stride > len - 1 {
        stride = ((len - 1) / (slots - 1)).max(1);
    }
    let span = (slots - 1) * stride;
    let start = peak
        .min(len - 1)
        .saturating_sub((slots / 2) * stride)
        .min(len - 1 - span);

    (0..slots).map(|k| start + k * stride).collect()
}

/// Up to `count` indices evenly spaced over `0..len`, ends included
pub fn evenly_spaced(len: usize, count: usize) -> Vec<usize> {
    if count == 0 || len == 0 {
        return Vec::new();
    }
    if len <= count {
        return (0..len).collect();
    }
    if count == 1 {
        return vec![len / 2];
    }
    (0..count).map(|i| i * (len - 1) / (count - 1)).collect()
}

/// 3x2 grid: five frames with boxes and badges, then a confidence panel
pub fn compose_collage(samples: &[SampledFrame], indices: &[usize], peak: Option<usize>, cell_width: u32, cell_height: u32) -> RgbImage {
    let width = GRID_COLUMNS * cell_width + (GRID_COLUMNS + 1) * GUTTER;
    let height = GRID_ROWS * cell_height + (GRID_ROWS + 1) * GUTTER;
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

    let cell_origin = |slot: u32| {
        let col = slot % GRID_COLUMNS;
        let row = slot / GRID_COLUMNS;
        (GUTTER + col * (cell_width + GUTTER), GUTTER + row * (cell_height + GUTTER))
    };

    for (slot, &index) in indices.iter().take(COLLAGE_SLOTS).enumerate() {
        let Some(sample) = samples.get(index) else {
            continue;
        };
        let is_peak = peak == Some(index);
        let cell = annotate(sample, cell_width, cell_height, is_peak);
        let (x, y) = cell_origin(slot as u32);
        imageops::replace(&mut canvas, &cell, x as i64, y as i64);
    }

    let panel = confidence_panel(samples, indices, peak, cell_width, cell_height);
    let (x, y) = cell_origin(GRID_COLUMNS * GRID_ROWS - 1);
    imageops::replace(&mut canvas, &panel, x as i64, y as i64);

    canvas
}

/// Frame scaled to the cell with its detections and a badge
fn annotate(sample: &SampledFrame, width: u32, height: u32, is_peak: bool) -> RgbImage {
    let source = sample.frame.image();
    let mut cell = imageops::resize(source, width, height, FilterType::Triangle);
    let sx = width as f32 / source.width().max(1) as f32;
    let sy = height as f32 / source.height().max(1) as f32;

    let color = if is_peak { PEAK_COLOR } else { BOX_COLOR };
    for det in &sample.detections {
        draw_rect(
            &mut cell,
            (det.bbox.x1 * sx) as i64,
            (det.bbox.y1 * sy) as i64,
            (det.bbox.x2 * sx) as i64,
            (det.bbox.y2 * sy) as i64,
            color,
            2,
        );
    }

    // Badge: square marks the peak, pips count detections
    fill_rect(&mut cell, 4, 4, 12, 12, if is_peak { PEAK_COLOR } else { MUTED });
    for pip in 0..sample.detections.len().min(5) as u32 {
        fill_rect(&mut cell, 20 + pip * 8, 8, 5, 5, BOX_COLOR);
    }
    cell
}

/// One bar per collage slot, height by peak confidence
fn confidence_panel(samples: &[SampledFrame], indices: &[usize], peak: Option<usize>, width: u32, height: u32) -> RgbImage {
    let mut panel = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
    let slots = indices.len().max(1) as u32;
    let slot_width = width / slots;
    let usable = height.saturating_sub(16);

    for (slot, &index) in indices.iter().enumerate() {
        let confidence = samples.get(index).and_then(|s| s.peak_confidence()).unwrap_or(0.0);
        let bar = (confidence.clamp(0.0, 1.0) * usable as f32) as u32;
        let color = if peak == Some(index) { PEAK_COLOR } else { MUTED };
        let x = slot as u32 * slot_width + slot_width / 4;
        fill_rect(&mut panel, x, height.saturating_sub(8 + bar), (slot_width / 2).max(1), bar, color);
    }
    panel
}

/// GIF frames: detections, a progress bar and index ticks
pub fn gif_frames(samples: &[SampledFrame], indices: &[usize], width: u32) -> Vec<RgbaImage> {
    let total = indices.len() as u32;
    indices
        .iter()
        .enumerate()
        .filter_map(|(position, &index)| {
            let sample = samples.get(index)?;
            let source = sample.frame.image();
            let height = ((source.height() as u64 * width as u64) / source.width().max(1) as u64).max(2) as u32;
            let mut frame = annotate(sample, width, height, false);

            let progress = width * (position as u32 + 1) / total.max(1);
            fill_rect(&mut frame, 0, height.saturating_sub(6), width, 6, Rgb([60, 60, 60]));
            fill_rect(&mut frame, 0, height.saturating_sub(6), progress, 6, Rgb([60, 160, 250]));

            for tick in 0..total {
                let color = if tick == position as u32 { Rgb([255, 255, 255]) } else { Rgb([90, 90, 90]) };
                let x = width.saturating_sub((total - tick) * 8 + 4);
                fill_rect(&mut frame, x, 4, 5, 5, color);
            }

            Some(rgb_to_rgba(&frame))
        })
        .collect()
}

/// Infinitely looping GIF
pub fn encode_gif(frames: &[RgbaImage], delay_ms: u32) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut buffer, 10);
        encoder.set_repeat(Repeat::Infinite)?;
        for frame in frames {
            let delay = Delay::from_numer_denom_ms(delay_ms, 1);
            encoder.encode_frame(image::Frame::from_parts(frame.clone(), 0, 0, delay))?;
        }
    }
    Ok(buffer)
}

/// Encode, halving the width until the result fits `budget` bytes or
/// `min_width` is reached. Returns the bytes and the width used.
pub fn encode_gif_within_budget(
    samples: &[SampledFrame],
    indices: &[usize],
    width: u32,
    min_width: u32,
    delay_ms: u32,
    budget: usize,
) -> Result<(Vec<u8>, u32), ImageError> {
    let mut width = width.max(min_width).max(2);
    loop {
        let bytes = encode_gif(&gif_frames(samples, indices, width), delay_ms)?;
        if bytes.len() <= budget || width / 2 < min_width {
            return Ok((bytes, width));
        }
        width /= 2;
    }
}

fn rgb_to_rgba(image: &RgbImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Rgba([r, g, b, 255])
    })
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(width).min(image.width());
    let y_end = y.saturating_add(height).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            image.put_pixel(px, py, color);
        }
    }
}

/// Rectangle outline, clipped to the image
fn draw_rect(image: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgb<u8>, thickness: i64) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x1, x2) = (x1.min(x2).clamp(0, w - 1), x1.max(x2).clamp(0, w - 1));
    let (y1, y2) = (y1.min(y2).clamp(0, h - 1), y1.max(y2).clamp(0, h - 1));

    for t in 0..thickness {
        for x in x1..=x2 {
            for y in [y1 + t, y2 - t] {
                if (0..h).contains(&y) {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
        for y in y1..=y2 {
            for x in [x1 + t, x2 - t] {
                if (0..w).contains(&x) {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_capture::Frame;
    use vigil_detect::{BoundingBox, Detection};

    fn samples(confidences: &[Option<f32>]) -> Vec<SampledFrame> {
        let t0 = Utc::now();
        confidences
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let image = RgbImage::from_pixel(64, 48, Rgb([(i * 20) as u8, 80, 120]));
                let detections = c
                    .map(|c| vec![Detection::new(BoundingBox::new(10.0, 5.0, 30.0, 40.0), c, "person")])
                    .unwrap_or_default();
                SampledFrame::new(Frame::from_image("cam", t0 + chrono::Duration::milliseconds(i as i64 * 500), image), detections)
            })
            .collect()
    }

    #[test]
    fn test_peak_index() {
        let s = samples(&[None, Some(0.5), Some(0.9), Some(0.7)]);
        assert_eq!(peak_index(&s), Some(2));
        assert_eq!(peak_index(&samples(&[None, None])), None);
    }

    #[test]
    fn test_collage_indices_center_on_peak() {
        assert_eq!(collage_indices(100, 50, 5), vec![30, 40, 50, 60, 70]);
        assert_eq!(collage_indices(100, 0, 5), vec![0, 10, 20, 30, 40]);
        assert_eq!(collage_indices(100, 99, 5), vec![59, 69, 79, 89, 99]);
        assert_eq!(collage_indices(7, 3, 5), vec![1, 2, 3, 4, 5]);
        assert_eq!(collage_indices(3, 1, 5), vec![0, 1, 2]);
        assert!(collage_indices(0, 0, 5).is_empty());
    }

    #[test]
    fn test_evenly_spaced() {
        assert_eq!(evenly_spaced(19, 10), vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
        assert_eq!(evenly_spaced(4, 10), vec![0, 1, 2, 3]);
        assert_eq!(evenly_spaced(9, 1), vec![4]);
        assert!(evenly_spaced(0, 10).is_empty());
    }

    #[test]
    fn test_collage_dimensions() {
        let s = samples(&[Some(0.4), Some(0.6), Some(0.9), Some(0.5), None, Some(0.3)]);
        let peak = peak_index(&s);
        let indices = collage_indices(s.len(), peak.unwrap(), COLLAGE_SLOTS);
        let collage = compose_collage(&s, &indices, peak, 80, 60);
        assert_eq!(collage.dimensions(), (3 * 80 + 4 * GUTTER, 2 * 60 + 3 * GUTTER));
        // Peak badge in the middle slot
        let (x, y) = (GUTTER + 2 * (80 + GUTTER) + 6, GUTTER + 6);
        assert_eq!(*collage.get_pixel(x, y), PEAK_COLOR);
    }

    #[test]
    fn test_gif_loops_and_fits_budget() {
        let s = samples(&[Some(0.5); 12]);
        let indices = evenly_spaced(s.len(), 10);
        let (bytes, width) = encode_gif_within_budget(&s, &indices, 128, 32, 200, usize::MAX).unwrap();
        assert!(bytes.starts_with(b"GIF89a"));
        assert_eq!(width, 128);

        let (_, shrunk) = encode_gif_within_budget(&s, &indices, 128, 32, 200, 1).unwrap();
        assert_eq!(shrunk, 32);
    }

    #[test]
    fn test_draw_rect_clips_to_bounds() {
        let mut img = RgbImage::new(10, 10);
        draw_rect(&mut img, -5, -5, 20, 20, PEAK_COLOR, 2);
        assert_eq!(*img.get_pixel(0, 5), PEAK_COLOR);
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }
}
