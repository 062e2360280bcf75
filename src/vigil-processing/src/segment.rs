//! Recording segments on disk
//!
//! The recorder writes one file per segment, named after its UTC start time
//! (`YYYYMMDDHHMMSS.mp4`). Everything here is pure bookkeeping over those
//! names: parsing, selection for a time window and the extraction plan.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SEGMENT_EXTENSION: &str = "mp4";
/// strftime pattern the recorder names segments with
pub const SEGMENT_NAME_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub start: DateTime<Utc>,
    /// Nominal length; the real file may end slightly off a keyframe
    pub duration: Duration,
}

impl Segment {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Half-open overlap with `[start, end)`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && self.end() > start
    }

    /// Closed once its nominal end plus `grace` has passed
    pub fn is_closed(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        self.end() + grace <= now
    }

    pub fn closes_at(&self, grace: Duration) -> DateTime<Utc> {
        self.end() + chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

pub fn segment_file_name(start: DateTime<Utc>) -> String {
    format!("{}.{}", start.format(SEGMENT_NAME_FORMAT), SEGMENT_EXTENSION)
}

/// Start time encoded in a segment file name, `None` for foreign files
pub fn parse_segment_start(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != 14 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stem, SEGMENT_NAME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Segments in `dir`, oldest first. A missing directory has no segments.
pub fn list_segments(dir: &Path, duration: Duration) -> io::Result<Vec<Segment>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(start) = name.to_str().and_then(parse_segment_start) else {
            continue;
        };
        segments.push(Segment {
            path: entry.path(),
            start,
            duration,
        });
    }

    segments.sort_by_key(|s| s.start);
    Ok(segments)
}

/// Closed segments overlapping `[start, end)`, oldest first
pub fn select_for_window(
    segments: &[Segment],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| s.overlaps(start, end) && s.is_closed(now, grace))
        .cloned()
        .collect()
}

/// How to cut a window out of the selected segments
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractPlan {
    /// Seek inside one segment
    Single {
        segment: Segment,
        offset: Duration,
        duration: Duration,
    },
    /// Join segments with the concat demuxer, then seek
    Concat {
        segments: Vec<Segment>,
        offset: Duration,
        duration: Duration,
    },
}

impl ExtractPlan {
    /// Plan a cut of `[start, end)`; `None` when nothing overlaps
    pub fn new(selected: &[Segment], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        let first = selected.first()?;
        let last = selected.last()?;

        let effective_start = start.max(first.start);
        let effective_end = end.min(last.end());
        let offset = (effective_start - first.start).to_std().unwrap_or(Duration::ZERO);
        let duration = (effective_end - effective_start).to_std().ok()?;
        if duration.is_zero() {
            return None;
        }

        Some(if selected.len() == 1 {
            ExtractPlan::Single {
                segment: first.clone(),
                offset,
                duration,
            }
        } else {
            ExtractPlan::Concat {
                segments: selected.to_vec(),
                offset,
                duration,
            }
        })
    }

    pub fn segments(&self) -> Vec<&Segment> {
        match self {
            ExtractPlan::Single { segment, .. } => vec![segment],
            ExtractPlan::Concat { segments, .. } => segments.iter().collect(),
        }
    }

    pub fn offset(&self) -> Duration {
        match self {
            ExtractPlan::Single { offset, .. } | ExtractPlan::Concat { offset, .. } => *offset,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            ExtractPlan::Single { duration, .. } | ExtractPlan::Concat { duration, .. } => *duration,
        }
    }

    /// ffmpeg arguments producing `output`. `concat_list` is the list file
    /// written from [`concat_list_contents`] for `Concat` plans.
    pub fn ffmpeg_args(&self, output: &Path, speed: f32, concat_list: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];

        args.push("-ss".into());
        args.push(format_secs(self.offset()));

        match (self, concat_list) {
            (ExtractPlan::Concat { .. }, Some(list)) => {
                args.extend(["-f", "concat", "-safe", "0", "-i"].map(String::from));
                args.push(list.to_string_lossy().into_owned());
            }
            _ => {
                let input = self.segments().first().map(|s| s.path.to_string_lossy().into_owned()).unwrap_or_default();
                args.push("-i".into());
                args.push(input);
            }
        }

        args.push("-t".into());
        args.push(format_secs(self.duration()));

        if (speed - 1.0).abs() < f32::EPSILON || speed <= 0.0 {
            args.extend(["-c", "copy"].map(String::from));
        } else {
            args.push("-filter:v".into());
            args.push(format!("setpts=PTS/{}", speed));
            args.extend(["-an", "-c:v", "libx264", "-preset", "veryfast", "-crf", "26", "-pix_fmt", "yuv420p"].map(String::from));
        }

        args.extend(["-movflags", "+faststart", "-f", "mp4"].map(String::from));
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

/// Body of a concat demuxer list file
pub fn concat_list_contents(segments: &[&Segment]) -> String {
    segments
        .iter()
        .map(|s| format!("file '{}'\n", s.path.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

fn format_secs(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MINUTE: Duration = Duration::from_secs(60);

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn segment(start: DateTime<Utc>) -> Segment {
        Segment {
            path: PathBuf::from(format!("/rec/cam/{}", segment_file_name(start))),
            start,
            duration: MINUTE,
        }
    }

    #[test]
    fn test_name_round_trip() {
        let start = at(10, 1, 0);
        assert_eq!(segment_file_name(start), "20240501100100.mp4");
        assert_eq!(parse_segment_start("20240501100100.mp4"), Some(start));
        assert_eq!(parse_segment_start("notes.txt"), None);
        assert_eq!(parse_segment_start("2024.mp4"), None);
        assert_eq!(parse_segment_start("20241301100100.mp4"), None);
    }

    #[test]
    fn test_window_across_two_segments() {
        let segments = vec![segment(at(9, 59, 0)), segment(at(10, 0, 0)), segment(at(10, 1, 0)), segment(at(10, 2, 0))];
        let (start, end) = (at(10, 0, 50), at(10, 1, 10));
        let now = at(10, 5, 0);

        let selected = select_for_window(&segments, start, end, now, Duration::from_secs(10));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].start, at(10, 0, 0));
        assert_eq!(selected[1].start, at(10, 1, 0));

        let plan = ExtractPlan::new(&selected, start, end).unwrap();
        assert!(matches!(plan, ExtractPlan::Concat { .. }));
        assert_eq!(plan.offset(), Duration::from_secs(50));
        assert_eq!(plan.duration(), Duration::from_secs(20));
    }

    #[test]
    fn test_open_segment_excluded() {
        let segments = vec![segment(at(10, 0, 0)), segment(at(10, 1, 0))];
        // 10:01 segment nominally ends 10:02, grace pushes closing to 10:02:10
        let selected = select_for_window(&segments, at(10, 0, 50), at(10, 1, 10), at(10, 2, 5), Duration::from_secs(10));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].start, at(10, 0, 0));
    }

    #[test]
    fn test_single_segment_plan() {
        let selected = vec![segment(at(10, 0, 0))];
        let plan = ExtractPlan::new(&selected, at(10, 0, 15), at(10, 0, 45)).unwrap();
        assert_eq!(
            plan,
            ExtractPlan::Single { segment: selected[0].clone(), offset: Duration::from_secs(15), duration: Duration::from_secs(30) }
        );

        let args = plan.ffmpeg_args(Path::new("/out/clip.mp4"), 1.0, None);
        assert!(args.windows(2).any(|w| w == ["-ss", "15.000"]));
        assert!(args.windows(2).any(|w| w == ["-t", "30.000"]));
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert_eq!(args.last().map(String::as_str), Some("/out/clip.mp4"));
    }

    #[test]
    fn test_speed_reencodes() {
        let selected = vec![segment(at(10, 0, 0)), segment(at(10, 1, 0))];
        let plan = ExtractPlan::new(&selected, at(10, 0, 30), at(10, 1, 30)).unwrap();
        let args = plan.ffmpeg_args(Path::new("/out/clip.mp4"), 4.0, Some(Path::new("/out/list.txt")));
        assert!(args.iter().any(|a| a == "setpts=PTS/4"));
        assert!(args.windows(2).any(|w| w == ["-f", "concat"]));
        assert!(!args.windows(2).any(|w| w == ["-c", "copy"]));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let selected = vec![segment(at(10, 0, 0)), segment(at(10, 1, 0))];
        let a = ExtractPlan::new(&selected, at(10, 0, 50), at(10, 1, 10)).unwrap();
        let b = ExtractPlan::new(&selected, at(10, 0, 50), at(10, 1, 10)).unwrap();
        assert_eq!(a, b);
        let out = Path::new("/out/clip.mp4");
        assert_eq!(a.ffmpeg_args(out, 1.0, None), b.ffmpeg_args(out, 1.0, None));
    }

    #[test]
    fn test_nothing_selected() {
        assert_eq!(ExtractPlan::new(&[], at(10, 0, 0), at(10, 1, 0)), None);
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let mut s = segment(at(10, 0, 0));
        s.path = PathBuf::from("/rec/it's/20240501100000.mp4");
        assert_eq!(concat_list_contents(&[&s]), "file '/rec/it'\\''s/20240501100000.mp4'\n");
    }

    #[test]
    fn test_list_segments_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20240501100100.mp4", "20240501100000.mp4", "junk.mp4", "readme.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let segments = list_segments(dir.path(), MINUTE).unwrap();
        assert_eq!(segments.iter().map(|s| s.start).collect::<Vec<_>>(), vec![at(10, 0, 0), at(10, 1, 0)]);

        assert!(list_segments(&dir.path().join("missing"), MINUTE).unwrap().is_empty());
    }
}
