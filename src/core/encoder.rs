use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;

use crate::core::cancel::CancelToken;
use crate::core::error::TaskError;

/// Bytes of combined encoder output kept for error diagnostics.
const ERROR_TAIL_BYTES: usize = 4 * 1024;

/// How often a running encoder is polled for exit and cancellation.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Video encoders the adapter knows how to drive, in detection priority
/// order. Hardware encoders use constant-quality rate control; the software
/// encoder uses CRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    Nvenc,
    Qsv,
    Amf,
    Software,
}

impl VideoEncoder {
    pub fn cli_name(self) -> &'static str {
        match self {
            VideoEncoder::Nvenc => "h264_nvenc",
            VideoEncoder::Qsv => "h264_qsv",
            VideoEncoder::Amf => "h264_amf",
            VideoEncoder::Software => "libx264",
        }
    }

    pub fn is_hardware(self) -> bool {
        !matches!(self, VideoEncoder::Software)
    }
}

const HARDWARE_CANDIDATES: [VideoEncoder; 3] =
    [VideoEncoder::Nvenc, VideoEncoder::Qsv, VideoEncoder::Amf];

// Detection results per encoder binary, cached process-wide: probing spawns
// subprocesses and the answer cannot change within one process lifetime.
static DETECTED_ENCODERS: Lazy<Mutex<HashMap<String, VideoEncoder>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Wrapper around the external encoder binary: hardware detection, argument
/// assembly for the three invocation modes, and cancellable subprocess runs
/// with a software fallback for flaky hardware paths.
#[derive(Debug, Clone)]
pub struct EncoderAdapter {
    encoder_bin: String,
    /// Pinned encoder choice; None means "detect on first use".
    forced: Option<VideoEncoder>,
}

impl EncoderAdapter {
    pub fn new(encoder_bin: impl Into<String>) -> Self {
        Self {
            encoder_bin: encoder_bin.into(),
            forced: None,
        }
    }

    /// Pin the encoder choice, bypassing detection. Used by configuration
    /// overrides and tests.
    pub fn with_encoder(mut self, encoder: VideoEncoder) -> Self {
        self.forced = Some(encoder);
        self
    }

    pub fn encoder_bin(&self) -> &str {
        &self.encoder_bin
    }

    /// The encoder concat/encode invocations will use, probing hardware on
    /// first call and caching the verdict for the process lifetime.
    pub fn selected_encoder(&self) -> VideoEncoder {
        if let Some(forced) = self.forced {
            return forced;
        }
        {
            let cache = DETECTED_ENCODERS.lock().expect("encoder cache poisoned");
            if let Some(found) = cache.get(&self.encoder_bin) {
                return *found;
            }
        }
        let detected = detect_encoder(&self.encoder_bin);
        DETECTED_ENCODERS
            .lock()
            .expect("encoder cache poisoned")
            .insert(self.encoder_bin.clone(), detected);
        detected
    }

    /// Stream-copy remux of a single source into MPEG-TS. No re-encode;
    /// only the H.264 bitstream is rewritten to Annex-B framing.
    pub fn preprocess_args(src: &Path, dst: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            src.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            "-bsf:v".into(),
            "h264_mp4toannexb".into(),
            "-f".into(),
            "mpegts".into(),
            dst.to_string_lossy().into_owned(),
        ]
    }

    /// Normalize one input into an intermediate MP4. Always software: the
    /// intermediates only need to be decodable and fast to produce.
    pub fn decode_args(src: &Path, dst: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            src.to_string_lossy().into_owned(),
            "-c:v".into(),
            VideoEncoder::Software.cli_name().into(),
            "-preset".into(),
            "ultrafast".into(),
            "-crf".into(),
            "28".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "96k".into(),
            "-threads".into(),
            "0".into(),
            dst.to_string_lossy().into_owned(),
        ]
    }

    /// Concat the manifest entries, scale to the target geometry, and encode
    /// with the given encoder and preset.
    pub fn concat_args(
        manifest: &Path,
        width: i64,
        height: i64,
        fps: i64,
        encoder: VideoEncoder,
        preset: &str,
        dst: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            manifest.to_string_lossy().into_owned(),
            "-vf".into(),
            format!("scale={width}:{height},fps={fps}"),
            "-c:v".into(),
            encoder.cli_name().into(),
        ];
        if encoder.is_hardware() {
            args.push("-cq".into());
            args.push("28".into());
        } else {
            args.push("-crf".into());
            args.push("28".into());
        }
        args.extend([
            "-preset".into(),
            preset.to_string(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "96k".into(),
            "-threads".into(),
            "0".into(),
            dst.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Run one encoder invocation to completion. The child is polled on a
    /// short tick so a cancelled token translates into an OS-level kill
    /// within one tick. Non-zero exits carry the tail of the combined
    /// output in the error.
    pub fn run(&self, args: &[String], token: &CancelToken) -> Result<(), TaskError> {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let mut child = Command::new(&self.encoder_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn encoder {}", self.encoder_bin))
            .map_err(TaskError::Internal)?;

        let stdout_pump = child.stdout.take().map(spawn_output_pump);
        let stderr_pump = child.stderr.take().map(spawn_output_pump);

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TaskError::Internal(
                        anyhow::Error::new(err).context("wait for encoder"),
                    ));
                }
            }
            if token.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskError::Cancelled);
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let mut combined = String::new();
        for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
            if let Ok(chunk) = pump.join() {
                combined.push_str(&chunk);
            }
        }

        if status.success() {
            Ok(())
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(TaskError::EncoderFailure(format!(
                "encoder exited with status {code}: {}",
                tail(&combined, ERROR_TAIL_BYTES)
            )))
        }
    }

    /// Concat+encode with the selected encoder, falling back to the
    /// software encoder once when a hardware attempt exits non-zero. Both
    /// failing is a recoverable `EncoderFailure` for the retry loop.
    pub fn run_concat(
        &self,
        manifest: &Path,
        width: i64,
        height: i64,
        fps: i64,
        preset: &str,
        dst: &Path,
        token: &CancelToken,
    ) -> Result<VideoEncoder, TaskError> {
        let chosen = self.selected_encoder();
        let args = Self::concat_args(manifest, width, height, fps, chosen, preset, dst);
        match self.run(&args, token) {
            Ok(()) => Ok(chosen),
            Err(TaskError::EncoderFailure(primary)) if chosen.is_hardware() => {
                tracing::warn!(
                    encoder = chosen.cli_name(),
                    error = %primary,
                    "hardware encode failed, retrying with software encoder"
                );
                let fallback_args = Self::concat_args(
                    manifest,
                    width,
                    height,
                    fps,
                    VideoEncoder::Software,
                    preset,
                    dst,
                );
                self.run(&fallback_args, token)
                    .map(|()| VideoEncoder::Software)
                    .map_err(|err| match err {
                        TaskError::EncoderFailure(fallback) => TaskError::EncoderFailure(format!(
                            "{} (after hardware failure: {primary})",
                            fallback
                        )),
                        other => other,
                    })
            }
            Err(err) => Err(err),
        }
    }
}

/// Probe for usable hardware encoders by asking the binary to describe each
/// candidate. The binary exits zero even for unknown encoders, so the
/// printed help is inspected as well.
fn detect_encoder(encoder_bin: &str) -> VideoEncoder {
    for candidate in HARDWARE_CANDIDATES {
        let output = Command::new(encoder_bin)
            .arg("-h")
            .arg(format!("encoder={}", candidate.cli_name()))
            .stdin(Stdio::null())
            .output();
        let Ok(output) = output else {
            // Binary missing or not runnable; software is the only answer.
            return VideoEncoder::Software;
        };
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if output.status.success() && !text.contains("Unknown encoder") {
            tracing::info!(encoder = candidate.cli_name(), "hardware encoder detected");
            return candidate;
        }
    }
    VideoEncoder::Software
}

fn spawn_output_pump<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text.trim_end();
    }
    let start = text.len() - max_bytes;
    // Step forward to a char boundary.
    let mut idx = start;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    text[idx..].trim_end()
}
