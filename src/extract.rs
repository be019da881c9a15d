//! Metadata extraction: duration and thumbnail for a newly cataloged file.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ExtractionError;
use crate::media::MediaType;

const THUMB_MAX_SIZE: u32 = 256;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extracted {
    pub duration_seconds: Option<f64>,
    pub thumbnail_ref: Option<String>,
}

/// Black-box metadata source. Called only for new entries, possibly from
/// several worker threads at once; must be safe to call again for the same
/// path.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, media_type: MediaType) -> Result<Extracted, ExtractionError>;
}

/// Default extractor: `image` for stills, `ffprobe`/`ffmpeg` for videos.
/// Thumbnails land in `thumb_dir`, named by a hash of the source path.
#[derive(Clone, Debug)]
pub struct ThumbnailExtractor {
    thumb_dir: PathBuf,
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl ThumbnailExtractor {
    pub fn new(thumb_dir: PathBuf) -> Self {
        Self {
            thumb_dir,
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_tools(mut self, ffprobe: PathBuf, ffmpeg: PathBuf) -> Self {
        self.ffprobe = ffprobe;
        self.ffmpeg = ffmpeg;
        self
    }

    /// Thumbnail file for the current content of `source`. Size and mtime
    /// are part of the name, so a different file showing up at the same path
    /// never gets the old thumbnail.
    fn thumb_path(&self, source: &Path, ext: &str) -> Result<PathBuf, ExtractionError> {
        let meta = fs::metadata(source).map_err(|e| ExtractionError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mtime_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(self.thumb_path_for(source, meta.len(), mtime_nanos, ext))
    }

    fn thumb_path_for(&self, source: &Path, len: u64, mtime_nanos: u128, ext: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source.as_os_str().as_encoded_bytes());
        hasher.update(len.to_le_bytes());
        hasher.update(mtime_nanos.to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.thumb_dir.join(format!("{}.{}", &digest[..32], ext))
    }

    fn ensure_dir(&self) -> Result<(), ExtractionError> {
        fs::create_dir_all(&self.thumb_dir).map_err(|source| ExtractionError::Io {
            path: self.thumb_dir.clone(),
            source,
        })
    }

    fn extract_image(&self, path: &Path) -> Result<Extracted, ExtractionError> {
        let out = self.thumb_path(path, "webp")?;
        if !out.exists() {
            let img = image::open(path).map_err(|e| ExtractionError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            // thumbnail() is a fast box filter, plenty for previews.
            let thumb = img.thumbnail(THUMB_MAX_SIZE, THUMB_MAX_SIZE).to_rgba8();
            self.ensure_dir()?;
            let part = partial_path(&out);
            thumb
                .save_with_format(&part, image::ImageFormat::WebP)
                .map_err(|e| {
                    fs::remove_file(&part).ok();
                    ExtractionError::Decode {
                        path: path.to_path_buf(),
                        message: format!("thumbnail encode: {}", e),
                    }
                })?;
            publish_thumb(&part, &out)?;
            debug!(path = %path.display(), thumb = %out.display(), "extract: image thumbnail");
        }
        Ok(Extracted {
            duration_seconds: None,
            thumbnail_ref: Some(out.to_string_lossy().into_owned()),
        })
    }

    fn extract_video(&self, path: &Path) -> Result<Extracted, ExtractionError> {
        let duration = self.probe_duration(path)?;

        let out = self.thumb_path(path, "jpg")?;
        let thumbnail_ref = if out.exists() {
            Some(out.to_string_lossy().into_owned())
        } else {
            self.ensure_dir()?;
            match self.grab_frame(path, &out, duration) {
                Ok(()) => Some(out.to_string_lossy().into_owned()),
                Err(e) => {
                    // A poster frame is cosmetic; the duration is what matters.
                    debug!(path = %path.display(), error = %e, "extract: no poster frame");
                    None
                }
            }
        };

        Ok(Extracted {
            duration_seconds: Some(duration),
            thumbnail_ref,
        })
    }

    fn probe_duration(&self, path: &Path) -> Result<f64, ExtractionError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .map_err(|e| ExtractionError::Tool {
                tool: "ffprobe",
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ExtractionError::Tool {
                tool: "ffprobe",
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ExtractionError::Tool {
                tool: "ffprobe",
                path: path.to_path_buf(),
                message: "no duration reported".into(),
            }
        })
    }

    fn grab_frame(&self, path: &Path, out: &Path, duration: f64) -> Result<(), ExtractionError> {
        let part = partial_path(out);
        let seek = format!("{:.3}", poster_time(duration));
        let scale = format!(
            "scale='min({m},iw)':'min({m},ih)':force_original_aspect_ratio=decrease",
            m = THUMB_MAX_SIZE
        );
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-y", "-ss", &seek, "-i"])
            .arg(path)
            .args(["-frames:v", "1", "-vf", &scale])
            .arg(&part)
            .output()
            .map_err(|e| ExtractionError::Tool {
                tool: "ffmpeg",
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if output.status.success() && part.exists() {
            publish_thumb(&part, out)
        } else {
            fs::remove_file(&part).ok();
            Err(ExtractionError::Tool {
                tool: "ffmpeg",
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Extractor for ThumbnailExtractor {
    fn extract(&self, path: &Path, media_type: MediaType) -> Result<Extracted, ExtractionError> {
        match media_type {
            MediaType::Image => self.extract_image(path),
            MediaType::Video => self.extract_video(path),
        }
    }
}

/// Sibling the encoder writes first; keeps the final extension so ffmpeg
/// still picks the right muxer.
fn partial_path(out: &Path) -> PathBuf {
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    out.with_file_name(format!("part-{}", name))
}

/// Move a finished thumbnail into place. Only complete files ever carry the
/// final name, so an interrupted encode is never reused.
fn publish_thumb(part: &Path, out: &Path) -> Result<(), ExtractionError> {
    fs::rename(part, out).map_err(|source| {
        fs::remove_file(part).ok();
        ExtractionError::Io {
            path: out.to_path_buf(),
            source,
        }
    })
}

/// ffprobe prints the duration in seconds, or `N/A` for streams without one.
fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Poster frame position: 10% in, capped at 5s, so short clips still get one.
fn poster_time(duration: f64) -> f64 {
    (duration * 0.1).min(5.0)
}
