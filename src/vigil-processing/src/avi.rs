//! Motion-JPEG in an AVI container, written without FFmpeg
//!
//! Last step of the clip chain: every frame becomes a JPEG `00dc` chunk in
//! the `movi` list, followed by an `idx1` keyframe index. Any player that
//! sniffs the container (ffmpeg, VLC, browsers via ffmpeg) can open it.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;

use crate::error::ProcessingError;

const JPEG_QUALITY: u8 = 80;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const MAIN_HEADER_LEN: u32 = 56;
const STREAM_HEADER_LEN: u32 = 56;
const BITMAP_INFO_LEN: u32 = 40;

struct IndexEntry {
    offset: u32,
    len: u32,
}

/// Encode `frames` at `fps` into an AVI byte stream. Frames that differ in
/// size from the first are scaled to match.
pub fn encode_mjpeg_avi(frames: &[RgbImage], fps: f32) -> Result<Vec<u8>, ProcessingError> {
    let first = frames.first().ok_or(ProcessingError::NoFrames)?;
    let (width, height) = first.dimensions();
    if width == 0 || height == 0 {
        return Err(ProcessingError::NoFrames);
    }
    let fps = if fps.is_finite() { fps.clamp(0.1, 60.0) } else { 2.0 };

    // `movi` fourcc, then the frame chunks; index offsets are relative to it
    let mut movi = b"movi".to_vec();
    let mut index = Vec::with_capacity(frames.len());
    let mut largest = 0u32;
    for frame in frames {
        let jpeg = if frame.dimensions() == (width, height) {
            encode_jpeg(frame)?
        } else {
            encode_jpeg(&imageops::resize(frame, width, height, FilterType::Triangle))?
        };
        let len = jpeg.len() as u32;
        largest = largest.max(len);
        index.push(IndexEntry {
            offset: movi.len() as u32,
            len,
        });
        push_chunk(&mut movi, b"00dc", &jpeg);
    }

    let frame_count = frames.len() as u32;
    let micros_per_frame = (1_000_000.0 / fps).round() as u32;
    let rate = (fps * 1000.0).round() as u32;

    let mut avih = Vec::with_capacity(MAIN_HEADER_LEN as usize);
    push_u32(&mut avih, micros_per_frame);
    push_u32(&mut avih, (largest as f32 * fps).round() as u32);
    push_u32(&mut avih, 0);
    push_u32(&mut avih, AVIF_HASINDEX);
    push_u32(&mut avih, frame_count);
    push_u32(&mut avih, 0);
    push_u32(&mut avih, 1);
    push_u32(&mut avih, largest);
    push_u32(&mut avih, width);
    push_u32(&mut avih, height);
    avih.extend_from_slice(&[0u8; 16]);

    let mut strh = Vec::with_capacity(STREAM_HEADER_LEN as usize);
    strh.extend_from_slice(b"vids");
    strh.extend_from_slice(b"MJPG");
    push_u32(&mut strh, 0);
    push_u16(&mut strh, 0);
    push_u16(&mut strh, 0);
    push_u32(&mut strh, 0);
    push_u32(&mut strh, 1000);
    push_u32(&mut strh, rate);
    push_u32(&mut strh, 0);
    push_u32(&mut strh, frame_count);
    push_u32(&mut strh, largest);
    push_u32(&mut strh, u32::MAX);
    push_u32(&mut strh, 0);
    push_u16(&mut strh, 0);
    push_u16(&mut strh, 0);
    push_u16(&mut strh, width.min(u16::MAX as u32) as u16);
    push_u16(&mut strh, height.min(u16::MAX as u32) as u16);

    let mut strf = Vec::with_capacity(BITMAP_INFO_LEN as usize);
    push_u32(&mut strf, BITMAP_INFO_LEN);
    push_u32(&mut strf, width);
    push_u32(&mut strf, height);
    push_u16(&mut strf, 1);
    push_u16(&mut strf, 24);
    strf.extend_from_slice(b"MJPG");
    push_u32(&mut strf, width * height * 3);
    push_u32(&mut strf, 0);
    push_u32(&mut strf, 0);
    push_u32(&mut strf, 0);
    push_u32(&mut strf, 0);

    let mut strl = b"strl".to_vec();
    push_chunk(&mut strl, b"strh", &strh);
    push_chunk(&mut strl, b"strf", &strf);

    let mut hdrl = b"hdrl".to_vec();
    push_chunk(&mut hdrl, b"avih", &avih);
    push_chunk(&mut hdrl, b"LIST", &strl);

    let mut idx1 = Vec::with_capacity(index.len() * 16);
    for entry in &index {
        idx1.extend_from_slice(b"00dc");
        push_u32(&mut idx1, AVIIF_KEYFRAME);
        push_u32(&mut idx1, entry.offset);
        push_u32(&mut idx1, entry.len);
    }

    let mut body = b"AVI ".to_vec();
    push_chunk(&mut body, b"LIST", &hdrl);
    push_chunk(&mut body, b"LIST", &movi);
    push_chunk(&mut body, b"idx1", &idx1);

    let mut out = Vec::with_capacity(body.len() + 8);
    push_chunk(&mut out, b"RIFF", &body);
    Ok(out)
}

/// Write an MJPEG AVI of `frames` to `path`
pub fn write_mjpeg_avi(frames: &[RgbImage], fps: f32, path: &Path) -> Result<(), ProcessingError> {
    let bytes = encode_mjpeg_avi(frames, fps)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, ProcessingError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(image)?;
    Ok(bytes)
}

/// fourcc, little-endian length, payload, pad to an even size
fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(fourcc);
    push_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn find(bytes: &[u8], needle: &[u8]) -> Option<usize> {
        bytes.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn test_riff_layout() {
        let frames: Vec<RgbImage> = (0..4)
            .map(|i| RgbImage::from_pixel(33, 17, Rgb([i * 60, 100, 200])))
            .collect();
        let avi = encode_mjpeg_avi(&frames, 2.0).unwrap();

        assert_eq!(&avi[0..4], b"RIFF");
        assert_eq!(read_u32(&avi, 4) as usize, avi.len() - 8);
        assert_eq!(&avi[8..12], b"AVI ");
        assert_eq!(&avi[12..16], b"LIST");
        assert_eq!(&avi[20..24], b"hdrl");
        assert_eq!(&avi[24..28], b"avih");
        assert_eq!(read_u32(&avi, 28), MAIN_HEADER_LEN);
        // microseconds per frame, total frames, width, height
        assert_eq!(read_u32(&avi, 32), 500_000);
        assert_eq!(read_u32(&avi, 48), 4);
        assert_eq!(read_u32(&avi, 64), 33);
        assert_eq!(read_u32(&avi, 68), 17);

        let strh = find(&avi, b"strh").unwrap();
        assert_eq!(&avi[strh + 8..strh + 16], b"vidsMJPG");
        assert!(find(&avi, b"idx1").is_some());
    }

    #[test]
    fn test_index_points_at_jpeg_chunks() {
        let frames = vec![RgbImage::from_pixel(16, 16, Rgb([10, 20, 30])); 3];
        let avi = encode_mjpeg_avi(&frames, 5.0).unwrap();

        let movi = find(&avi, b"movi").unwrap();
        let idx1 = find(&avi, b"idx1").unwrap();
        let entries = read_u32(&avi, idx1 + 4) as usize / 16;
        assert_eq!(entries, 3);

        for i in 0..entries {
            let entry = idx1 + 8 + i * 16;
            assert_eq!(&avi[entry..entry + 4], b"00dc");
            let chunk = movi + read_u32(&avi, entry + 8) as usize;
            let len = read_u32(&avi, entry + 12);
            assert_eq!(&avi[chunk..chunk + 4], b"00dc");
            assert_eq!(read_u32(&avi, chunk + 4), len);
            // JPEG start-of-image marker
            assert_eq!(&avi[chunk + 8..chunk + 10], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn test_mismatched_frames_are_scaled() {
        let frames = vec![RgbImage::new(20, 10), RgbImage::new(40, 30)];
        let avi = encode_mjpeg_avi(&frames, 1.0).unwrap();
        assert_eq!(read_u32(&avi, 48), 2);
        assert_eq!(read_u32(&avi, 64), 20);
    }

    #[test]
    fn test_no_frames_is_an_error() {
        assert!(matches!(encode_mjpeg_avi(&[], 2.0), Err(ProcessingError::NoFrames)));
    }
}
