use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Compact media metadata attached to job logs so operators can see what
/// went through the pipeline without re-probing files by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub video_codec: Option<String>,
    pub bit_rate: Option<u64>,
    pub byte_size: Option<u64>,
}

static FRAME_RATE_FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*/\s*(\d+)$").expect("frame-rate regex"));

/// Probe a media file with the configured probe binary (`ffprobe` unless
/// overridden). Probing is informational: callers treat failures as missing
/// metadata, not as job failures.
pub fn probe_media(probe_bin: &str, source: &Path) -> Result<MediaInfo> {
    let output = Command::new(probe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(source.as_os_str())
        .output()
        .with_context(|| format!("failed to run {probe_bin} on {}", source.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "probe failed for {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let doc: Value = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("probe output for {} is not JSON", source.display()))?;

    let mut info = parse_probe_document(&doc);
    info.byte_size = std::fs::metadata(source).map(|m| m.len()).ok();
    Ok(info)
}

fn parse_probe_document(doc: &Value) -> MediaInfo {
    let mut info = MediaInfo::default();

    if let Some(format) = doc.get("format") {
        info.duration_seconds = format
            .get("duration")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0);
        info.bit_rate = format
            .get("bit_rate")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok());
    }

    let video_stream = doc
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
        });

    if let Some(stream) = video_stream {
        info.video_codec = stream
            .get("codec_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        info.width = stream.get("width").and_then(Value::as_u64).map(|w| w as u32);
        info.height = stream.get("height").and_then(Value::as_u64).map(|h| h as u32);
        info.frame_rate = stream
            .get("r_frame_rate")
            .and_then(Value::as_str)
            .and_then(parse_frame_rate);
    }

    info
}

/// ffprobe reports frame rates as `num/den` fractions; a denominator of
/// zero means "unknown".
fn parse_frame_rate(raw: &str) -> Option<f64> {
    if let Some(caps) = FRAME_RATE_FRACTION.captures(raw.trim()) {
        let num: f64 = caps[1].parse().ok()?;
        let den: f64 = caps[2].parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_fractional_and_plain_frame_rates() {
        assert_eq!(parse_frame_rate("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("29.97"), Some(29.97));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn extracts_fields_from_probe_json() {
        let doc = json!({
            "format": {"duration": "12.480000", "bit_rate": "1500000"},
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080,
                    "r_frame_rate": "30/1"
                }
            ]
        });
        let info = parse_probe_document(&doc);
        assert_eq!(info.duration_seconds, Some(12.48));
        assert_eq!(info.bit_rate, Some(1_500_000));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!((info.width, info.height), (Some(1920), Some(1080)));
        assert_eq!(info.frame_rate, Some(30.0));
    }

    #[test]
    fn tolerates_documents_without_video_streams() {
        let info = parse_probe_document(&json!({"format": {}, "streams": []}));
        assert_eq!(info, MediaInfo::default());
    }

    #[test]
    fn probe_runs_against_a_real_subprocess() {
        use crate::test_support::{self, EnvVarGuard};

        let _lock = test_support::env_lock();
        let _env = EnvVarGuard::capture(test_support::MOCK_ENCODER_ENV_KEYS);
        test_support::clear_mock_encoder_env();
        test_support::set_env(
            "CLIPFORGE_MOCK_ENCODER_STDOUT",
            r#"{"format":{"duration":"3.5"},"streams":[]}"#,
        );

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"fake media").unwrap();

        let info = probe_media(&test_support::mock_encoder_bin(), &source).unwrap();
        assert_eq!(info.duration_seconds, Some(3.5));
        assert_eq!(info.byte_size, Some(10));
    }
}
