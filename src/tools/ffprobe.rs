// ffprobe wrapper for media inspection

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::config::ToolsConfig;
use crate::error::{Result, SpindleError};
use crate::tools::ffprobe_path;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    duration: Option<String>,
    #[serde(default)]
    tags: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub video_codec: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub audio_tracks: Vec<AudioTrack>,
}

#[derive(Debug, Clone, Default)]
pub struct AudioTrack {
    pub index: u32,
    pub codec: Option<String>,
    pub language: Option<String>,
}

/// Run ffprobe on a file and extract the stream facts the stages need.
pub fn probe(tools: &ToolsConfig, path: &Path) -> Result<MediaInfo> {
    let output = Command::new(ffprobe_path(tools))
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .map_err(|e| SpindleError::ExternalTool(format!("failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SpindleError::ExternalTool(format!(
            "ffprobe failed on {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    let probe_output: FfprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| SpindleError::ExternalTool(format!("failed to parse ffprobe output: {}", e)))?;

    let mut info = MediaInfo::default();
    let mut audio_index = 0u32;

    if let Some(streams) = probe_output.streams {
        for stream in streams {
            match stream.codec_type.as_deref() {
                Some("video") => {
                    info.video_codec = stream.codec_name;
                    info.width = stream.width;
                    info.height = stream.height;
                    if info.duration_seconds.is_none() {
                        info.duration_seconds = parse_seconds(stream.duration.as_deref());
                    }
                }
                Some("audio") => {
                    let language = stream
                        .tags
                        .as_ref()
                        .and_then(|t| t.get("language"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    info.audio_tracks.push(AudioTrack {
                        index: audio_index,
                        codec: stream.codec_name,
                        language,
                    });
                    audio_index += 1;
                }
                _ => {}
            }
        }
    }

    if info.duration_seconds.is_none() {
        if let Some(format) = probe_output.format {
            info.duration_seconds = parse_seconds(format.duration.as_deref());
        }
    }

    Ok(info)
}

fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    raw?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds(Some("5505.13")), Some(5505.13));
        assert_eq!(parse_seconds(Some("x")), None);
        assert_eq!(parse_seconds(None), None);
    }
}
