use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chapters::Chapter;
use crate::config::MediaConfig;
use crate::error::{MediaError, MediaResult};
use crate::segments::{keep_ranges, AdInterval};

/// Keep this much of a failing command's stderr.
const STDERR_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeDirection {
    In,
    Out,
}

/// One stretch of source audio copied into the output, optionally faded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPiece {
    pub start_ms: u64,
    pub end_ms: u64,
    pub fade: Option<FadeDirection>,
}

impl EditPiece {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// The exact sequence of pieces the filter graph concatenates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPlan {
    pub source_duration_ms: u64,
    pub removed: Vec<AdInterval>,
    pub pieces: Vec<EditPiece>,
}

impl EditPlan {
    pub fn output_duration_ms(&self) -> u64 {
        self.pieces.iter().map(EditPiece::duration_ms).sum()
    }

    pub fn fade_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.fade.is_some()).count()
    }

    pub fn is_noop(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Lay out the output as retained regions plus fade pieces around each cut.
///
/// Before a cut, a fade-out copy of the last `fade_ms` of the retained region
/// follows it; after a cut, a fade-in copy of the first `fade_ms` of the next
/// region precedes it. Fade windows never extend past the retained region they
/// are taken from, so no removed audio is ever played.
pub fn plan_edit(
    source_duration_ms: u64,
    intervals: &[AdInterval],
    fade_ms: u64,
) -> MediaResult<EditPlan> {
    let mut previous_end = 0u64;
    for iv in intervals {
        if iv.end_ms <= iv.start_ms {
            return Err(MediaError::InvalidEdit(format!(
                "empty interval {}..{} ms",
                iv.start_ms, iv.end_ms
            )));
        }
        if iv.start_ms < previous_end {
            return Err(MediaError::InvalidEdit(
                "intervals must be sorted and non-overlapping".to_string(),
            ));
        }
        if iv.end_ms > source_duration_ms {
            return Err(MediaError::InvalidEdit(format!(
                "interval ends at {} ms, past the end of the audio ({} ms)",
                iv.end_ms, source_duration_ms
            )));
        }
        previous_end = iv.end_ms;
    }

    let keep = keep_ranges(source_duration_ms, intervals);
    if keep.is_empty() {
        return Err(MediaError::InvalidEdit(
            "every part of the audio would be removed".to_string(),
        ));
    }

    let mut pieces = Vec::with_capacity(keep.len() * 3);
    for (start, end) in keep {
        if start > 0 && fade_ms > 0 {
            pieces.push(EditPiece {
                start_ms: start,
                end_ms: (start + fade_ms).min(end),
                fade: Some(FadeDirection::In),
            });
        }
        pieces.push(EditPiece {
            start_ms: start,
            end_ms: end,
            fade: None,
        });
        if end < source_duration_ms && fade_ms > 0 {
            pieces.push(EditPiece {
                start_ms: end.saturating_sub(fade_ms).max(start),
                end_ms: end,
                fade: Some(FadeDirection::Out),
            });
        }
    }

    Ok(EditPlan {
        source_duration_ms,
        removed: intervals.to_vec(),
        pieces,
    })
}

fn secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// `filter_complex` script that trims, fades and concatenates the plan's pieces.
pub fn render_filter_graph(plan: &EditPlan) -> String {
    let mut graph = String::new();
    for (i, piece) in plan.pieces.iter().enumerate() {
        write!(
            graph,
            "[0:a]atrim=start={:.3}:end={:.3},asetpts=PTS-STARTPTS",
            secs(piece.start_ms),
            secs(piece.end_ms)
        )
        .ok();
        match piece.fade {
            Some(FadeDirection::In) => {
                write!(graph, ",afade=t=in:st=0:d={:.3}", secs(piece.duration_ms())).ok();
            }
            Some(FadeDirection::Out) => {
                write!(graph, ",afade=t=out:st=0:d={:.3}", secs(piece.duration_ms())).ok();
            }
            None => {}
        }
        writeln!(graph, "[p{}];", i).ok();
    }
    for i in 0..plan.pieces.len() {
        write!(graph, "[p{}]", i).ok();
    }
    write!(graph, "concat=n={}:v=0:a=1[out]", plan.pieces.len()).ok();
    graph
}

/// Encoder arguments for the container implied by `path`'s extension.
fn codec_args(path: &Path) -> &'static [&'static str] {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp3") => &["-c:a", "libmp3lame", "-q:a", "2"],
        Some("m4a") | Some("m4b") | Some("mp4") | Some("aac") => &["-c:a", "aac", "-b:a", "192k"],
        Some("ogg") | Some("opus") => &["-c:a", "libopus", "-b:a", "96k"],
        Some("flac") => &["-c:a", "flac"],
        Some("wav") => &["-c:a", "pcm_s16le"],
        _ => &[],
    }
}

/// `<stem><suffix>.<ext>` next to the input.
pub fn generate_output_path(input: &Path, suffix: &str) -> PathBuf {
    let parent = input.parent().unwrap_or(Path::new(""));
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "episode".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    parent.join(name)
}

/// Move a finished file into place, falling back to copy + delete across filesystems.
fn move_into_place(from: &Path, to: &Path) -> MediaResult<()> {
    std::fs::rename(from, to)
        .or_else(|_| std::fs::copy(from, to).and_then(|_| std::fs::remove_file(from)))?;
    Ok(())
}

fn stderr_tail(output: &Output) -> Option<String> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return None;
    }
    let skip = stderr.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    Some(stderr.chars().skip(skip).collect())
}

// ffprobe -show_chapters output
#[derive(Debug, Deserialize)]
struct ProbeChapters {
    #[serde(default)]
    chapters: Vec<ProbeChapter>,
}

#[derive(Debug, Deserialize)]
struct ProbeChapter {
    start_time: String,
    end_time: String,
    #[serde(default)]
    tags: ProbeTags,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
    #[serde(default)]
    title: Option<String>,
}

// ffprobe -show_entries format=duration output
#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format: ProbeFormatEntry,
}

#[derive(Debug, Deserialize)]
struct ProbeFormatEntry {
    duration: Option<String>,
}

fn parse_seconds_ms(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

pub fn parse_probe_chapters(json: &str) -> MediaResult<Vec<Chapter>> {
    let probe: ProbeChapters = serde_json::from_str(json)?;
    probe
        .chapters
        .into_iter()
        .enumerate()
        .map(|(i, ch)| {
            let start = parse_seconds_ms(&ch.start_time).ok_or_else(|| MediaError::FfprobeFailed {
                message: format!("bad chapter start time {:?}", ch.start_time),
                stderr: None,
            })?;
            let end = parse_seconds_ms(&ch.end_time).ok_or_else(|| MediaError::FfprobeFailed {
                message: format!("bad chapter end time {:?}", ch.end_time),
                stderr: None,
            })?;
            Ok(Chapter {
                element_id: format!("ch{}", i),
                title: ch.tags.title.unwrap_or_default(),
                start_time_ms: start,
                end_time_ms: end.max(start),
            })
        })
        .collect()
}

fn escape_ffmetadata(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' | '\n' => {
                out.push('\\');
                out.push(c);
            }
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

/// FFMETADATA1 document describing `chapters` in millisecond time base.
pub fn ffmetadata(chapters: &[Chapter]) -> String {
    let mut doc = String::from(";FFMETADATA1\n");
    for chapter in chapters {
        writeln!(doc, "\n[CHAPTER]").ok();
        writeln!(doc, "TIMEBASE=1/1000").ok();
        writeln!(doc, "START={}", chapter.start_time_ms).ok();
        writeln!(doc, "END={}", chapter.end_time_ms).ok();
        writeln!(doc, "title={}", escape_ffmetadata(&chapter.title)).ok();
    }
    doc
}

/// Paths to the ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct MediaTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl MediaTools {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_bin.clone(),
            ffprobe: config.ffprobe_bin.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        let runs = |bin: &Path| Command::new(bin).arg("-version").output().is_ok();
        runs(&self.ffmpeg) && runs(&self.ffprobe)
    }

    fn spawn(mut cmd: Command) -> MediaResult<Output> {
        cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MediaError::ToolNotFound(cmd.get_program().to_string_lossy().into_owned())
            } else {
                MediaError::Io(e)
            }
        })
    }

    fn run_ffprobe(&self, cmd: Command) -> MediaResult<String> {
        let output = Self::spawn(cmd)?;
        if !output.status.success() {
            return Err(MediaError::FfprobeFailed {
                message: format!("ffprobe exited with {}", output.status),
                stderr: stderr_tail(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_ffmpeg(&self, cmd: Command, what: &str) -> MediaResult<()> {
        debug!(command = ?cmd, "Running ffmpeg");
        let output = Self::spawn(cmd)?;
        if !output.status.success() {
            return Err(MediaError::FfmpegFailed {
                message: format!("{} failed ({})", what, output.status),
                stderr: stderr_tail(&output),
                exit_code: output.status.code(),
            });
        }
        Ok(())
    }

    pub fn probe_duration_ms(&self, path: &Path) -> MediaResult<u64> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(path);
        let stdout = self.run_ffprobe(cmd)?;
        let probe: ProbeFormat = serde_json::from_str(&stdout)?;
        probe
            .format
            .duration
            .as_deref()
            .and_then(parse_seconds_ms)
            .ok_or_else(|| MediaError::FfprobeFailed {
                message: format!("no duration reported for {}", path.display()),
                stderr: None,
            })
    }

    pub fn read_chapters(&self, path: &Path) -> MediaResult<Vec<Chapter>> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-show_chapters", "-of", "json"])
            .arg(path);
        let stdout = self.run_ffprobe(cmd)?;
        parse_probe_chapters(&stdout)
    }

    /// Replace every chapter in `path` with `chapters`, in order.
    ///
    /// The file is remuxed (no re-encode) to a sibling temp file which then
    /// replaces the original, so readers never see a half-written file.
    pub fn write_chapters(&self, path: &Path, chapters: &[Chapter]) -> MediaResult<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let meta_path = dir.join(format!(".{}.ffmetadata", file_name));
        let temp_path = dir.join(format!(".{}.chapters.tmp{}", file_name, extension_suffix(path)));

        std::fs::write(&meta_path, ffmetadata(chapters))?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-y", "-i"])
            .arg(path)
            .arg("-i")
            .arg(&meta_path)
            .args(["-map", "0", "-map_metadata", "0", "-map_chapters", "1", "-c", "copy"]);
        if is_mp3(path) {
            cmd.args(["-id3v2_version", "3"]);
        }
        cmd.arg(&temp_path);

        let result = self
            .run_ffmpeg(cmd, "chapter rewrite")
            .and_then(|_| move_into_place(&temp_path, path));
        let _ = std::fs::remove_file(&meta_path);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        result?;

        info!(path = %path.display(), chapters = chapters.len(), "Wrote chapters");
        Ok(())
    }

    /// Cut `intervals` out of `source` with fades at every cut, writing to `output`.
    ///
    /// Rendering happens inside `work_dir`, which must be unique to the job; the
    /// result is moved to `output` only once ffmpeg succeeds.
    pub fn cut_and_fade(
        &self,
        source: &Path,
        intervals: &[AdInterval],
        fade_ms: u64,
        output: &Path,
        work_dir: &Path,
    ) -> MediaResult<EditPlan> {
        let duration_ms = self.probe_duration_ms(source)?;
        let plan = plan_edit(duration_ms, intervals, fade_ms)?;
        std::fs::create_dir_all(work_dir)?;

        if plan.is_noop() {
            info!(source = %source.display(), "No ad intervals, copying source unchanged");
            std::fs::copy(source, output)?;
            return Ok(plan);
        }

        info!(
            source = %source.display(),
            cuts = plan.removed.len(),
            pieces = plan.pieces.len(),
            original_ms = duration_ms,
            output_ms = plan.output_duration_ms(),
            "Rendering edited audio"
        );

        // Filter graphs for long episodes exceed command line limits.
        let filter_path = work_dir.join("filter.txt");
        std::fs::write(&filter_path, render_filter_graph(&plan))?;

        let temp_output = work_dir.join(format!("render_output{}", extension_suffix(output)));
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-y", "-i"])
            .arg(source)
            .arg("-filter_complex_script")
            .arg(&filter_path)
            .args(["-map", "[out]", "-map_metadata", "0", "-map_chapters", "-1"])
            .args(codec_args(output))
            .arg(&temp_output);

        self.run_ffmpeg(cmd, "audio edit")?;
        move_into_place(&temp_output, output)?;
        Ok(plan)
    }
}

fn extension_suffix(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

fn is_mp3(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mp3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: u64, end: u64) -> AdInterval {
        AdInterval::new(start, end)
    }

    #[test]
    fn test_plan_interior_cut_adds_two_fades() {
        let plan = plan_edit(100_000, &[iv(20_000, 30_000)], 3_000).unwrap();
        let layout: Vec<(u64, u64, Option<FadeDirection>)> = plan
            .pieces
            .iter()
            .map(|p| (p.start_ms, p.end_ms, p.fade))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, 20_000, None),
                (17_000, 20_000, Some(FadeDirection::Out)),
                (30_000, 33_000, Some(FadeDirection::In)),
                (30_000, 100_000, None),
            ]
        );
        assert_eq!(plan.output_duration_ms(), 100_000 - 10_000 + 2 * 3_000);
    }

    #[test]
    fn test_plan_duration_formula_for_interior_cuts() {
        let cuts = [iv(60_000, 120_000), iv(300_000, 330_000), iv(500_000, 560_000)];
        let plan = plan_edit(900_000, &cuts, 3_000).unwrap();
        let removed: u64 = cuts.iter().map(AdInterval::duration_ms).sum();
        assert_eq!(plan.fade_count(), 6);
        assert_eq!(plan.output_duration_ms(), 900_000 - removed + 2 * 3_000 * 3);
    }

    #[test]
    fn test_plan_trailing_cut_has_no_fade_in() {
        let plan = plan_edit(100_000, &[iv(90_000, 100_000)], 3_000).unwrap();
        assert_eq!(plan.fade_count(), 1);
        assert_eq!(plan.pieces.last().unwrap().fade, Some(FadeDirection::Out));
        assert_eq!(plan.output_duration_ms(), 93_000);
    }

    #[test]
    fn test_plan_leading_cut_has_no_fade_out() {
        let plan = plan_edit(100_000, &[iv(0, 10_000)], 3_000).unwrap();
        assert_eq!(plan.fade_count(), 1);
        assert_eq!(plan.pieces[0].fade, Some(FadeDirection::In));
        assert_eq!(plan.output_duration_ms(), 93_000);
    }

    #[test]
    fn test_plan_fade_clamped_to_retained_region() {
        // Only 1s of audio between the two cuts.
        let plan = plan_edit(100_000, &[iv(10_000, 20_000), iv(21_000, 40_000)], 3_000).unwrap();
        for piece in &plan.pieces {
            for cut in &plan.removed {
                assert!(piece.end_ms <= cut.start_ms || piece.start_ms >= cut.end_ms);
            }
        }
        let short: Vec<&EditPiece> = plan
            .pieces
            .iter()
            .filter(|p| p.start_ms >= 20_000 && p.end_ms <= 21_000)
            .collect();
        assert_eq!(short.len(), 3);
        assert!(short.iter().all(|p| p.duration_ms() == 1_000));
    }

    #[test]
    fn test_plan_without_fades() {
        let plan = plan_edit(100_000, &[iv(20_000, 30_000)], 0).unwrap();
        assert_eq!(plan.fade_count(), 0);
        assert_eq!(plan.output_duration_ms(), 90_000);
    }

    #[test]
    fn test_plan_rejects_bad_intervals() {
        assert!(plan_edit(100_000, &[iv(30_000, 20_000)], 0).is_err());
        assert!(plan_edit(100_000, &[iv(20_000, 40_000), iv(30_000, 50_000)], 0).is_err());
        assert!(plan_edit(100_000, &[iv(90_000, 110_000)], 0).is_err());
        assert!(plan_edit(100_000, &[iv(0, 100_000)], 0).is_err());
    }

    #[test]
    fn test_plan_noop() {
        let plan = plan_edit(100_000, &[], 3_000).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.output_duration_ms(), 100_000);
    }

    #[test]
    fn test_filter_graph() {
        let plan = plan_edit(100_000, &[iv(20_000, 30_000)], 3_000).unwrap();
        let graph = render_filter_graph(&plan);
        assert_eq!(
            graph,
            "[0:a]atrim=start=0.000:end=20.000,asetpts=PTS-STARTPTS[p0];\n\
             [0:a]atrim=start=17.000:end=20.000,asetpts=PTS-STARTPTS,afade=t=out:st=0:d=3.000[p1];\n\
             [0:a]atrim=start=30.000:end=33.000,asetpts=PTS-STARTPTS,afade=t=in:st=0:d=3.000[p2];\n\
             [0:a]atrim=start=30.000:end=100.000,asetpts=PTS-STARTPTS[p3];\n\
             [p0][p1][p2][p3]concat=n=4:v=0:a=1[out]"
        );
    }

    #[test]
    fn test_parse_probe_chapters() {
        let json = r#"{"chapters": [
            {"id": 0, "time_base": "1/1000", "start": 0, "start_time": "0.000000",
             "end": 61500, "end_time": "61.500000", "tags": {"title": "Intro"}},
            {"id": 1, "time_base": "1/1000", "start": 61500, "start_time": "61.500000",
             "end": 90000, "end_time": "90.000000"}
        ]}"#;
        let chapters = parse_probe_chapters(json).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].element_id, "ch0");
        assert_eq!(chapters[0].title, "Intro");
        assert_eq!(chapters[0].end_time_ms, 61_500);
        assert_eq!(chapters[1].title, "");
        assert_eq!(chapters[1].start_time_ms, 61_500);

        assert!(parse_probe_chapters("{}").unwrap().is_empty());
    }

    #[test]
    fn test_ffmetadata_escapes_titles() {
        let doc = ffmetadata(&[Chapter {
            element_id: "ch0".into(),
            title: "Q&A; part=1 #2".into(),
            start_time_ms: 0,
            end_time_ms: 5_000,
        }]);
        assert!(doc.starts_with(";FFMETADATA1\n"));
        assert!(doc.contains("START=0\nEND=5000\n"));
        assert!(doc.contains(r"title=Q&A\; part\=1 \#2"));
    }

    #[test]
    fn test_generate_output_path() {
        assert_eq!(
            generate_output_path(Path::new("/pods/ep1.mp3"), "_adfree"),
            PathBuf::from("/pods/ep1_adfree.mp3")
        );
        assert_eq!(
            generate_output_path(Path::new("ep1"), "_adfree"),
            PathBuf::from("ep1_adfree")
        );
    }

    #[test]
    fn test_codec_follows_extension() {
        assert_eq!(codec_args(Path::new("a.MP3"))[1], "libmp3lame");
        assert_eq!(codec_args(Path::new("a.m4a"))[1], "aac");
        assert!(codec_args(Path::new("a.xyz")).is_empty());
    }

    #[test]
    fn test_missing_binary_is_tool_not_found() {
        let tools = MediaTools {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg-adtrim"),
            ffprobe: PathBuf::from("/nonexistent/ffprobe-adtrim"),
        };
        assert!(!tools.is_available());
        let err = tools.probe_duration_ms(Path::new("x.mp3")).unwrap_err();
        assert!(matches!(err, MediaError::ToolNotFound(_)));
    }
}
