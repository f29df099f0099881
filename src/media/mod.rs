//! FFmpeg command builder and the three media operations the cluster needs:
//! segmenting a source into shards, transcoding one shard, and stream-copy
//! concatenation of processed shards.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VidshardError};

/// Container formats accepted at upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl ContainerFormat {
    /// File extension, also the wire form.
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Webm => "webm",
            ContainerFormat::Mov => "mov",
        }
    }

    /// FFmpeg muxer name. Differs from the extension only for mkv.
    pub fn muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mkv => "matroska",
            other => other.extension(),
        }
    }

    pub fn video_codec(&self) -> &'static str {
        match self {
            ContainerFormat::Webm => "libvpx-vp9",
            _ => "libx264",
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl std::str::FromStr for ContainerFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mp4" => Ok(ContainerFormat::Mp4),
            "mkv" => Ok(ContainerFormat::Mkv),
            "webm" => Ok(ContainerFormat::Webm),
            "mov" => Ok(ContainerFormat::Mov),
            other => Err(format!("unsupported container format '{other}'")),
        }
    }
}

/// Builder for FFmpeg invocations.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    input_args: Vec<String>,
    output_args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    /// Add an argument before `-i`.
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add an argument after `-i`.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn format(self, muxer: impl Into<String>) -> Self {
        self.output_arg("-f").output_arg(muxer)
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Full argv, without the leading `ffmpeg`.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-nostdin".to_string(),
        ];
        args.extend(self.input_args.clone());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs FFmpeg commands, killing the child on cancellation or timeout.
#[derive(Debug, Clone)]
pub struct MediaExecutor {
    timeout: Option<Duration>,
}

impl Default for MediaExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaExecutor {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Verify the media tool is installed.
    pub fn check_available() -> Result<PathBuf> {
        which::which("ffmpeg")
            .map_err(|_| VidshardError::Media("ffmpeg not found in PATH".to_string()))
    }

    pub async fn run(&self, cmd: &FfmpegCommand, cancel: &CancellationToken) -> Result<()> {
        let args = cmd.build_args();
        tracing::debug!(args = %args.join(" "), "Running ffmpeg");

        // kill_on_drop reaps the child when cancellation or timeout abandons it.
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr_pipe = child.stderr.take();

        let work = async move {
            let mut stderr_buf: Vec<u8> = Vec::new();
            let drain = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = tokio::io::copy(pipe, &mut stderr_buf).await;
                }
            };
            let (_, status) = tokio::join!(drain, child.wait());
            (status, stderr_buf)
        };
        tokio::pin!(work);

        let deadline = self.timeout.unwrap_or(Duration::from_secs(24 * 60 * 60));
        let (status, stderr_buf) = tokio::select! {
            result = tokio::time::timeout(deadline, &mut work) => match result {
                Ok((status, buf)) => (status?, buf),
                Err(_) => {
                    return Err(VidshardError::Media("ffmpeg timed out".to_string()));
                }
            },
            _ = cancel.cancelled() => {
                return Err(VidshardError::Media("ffmpeg cancelled".to_string()));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(VidshardError::Media(stderr_tail(&stderr_buf)))
        }
    }
}

/// Last few lines of ffmpeg's stderr, enough to diagnose without shipping
/// the whole transcript around the cluster.
pub fn stderr_tail(stderr: &[u8]) -> String {
    const TAIL_LINES: usize = 8;
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "ffmpeg exited with a non-zero status".to_string()
    } else {
        tail
    }
}

/// Segment `input` into ~`segment_seconds` shards under `out_dir`, named
/// `<index>.<ext>` with zero-padded indices so a sorted listing is the
/// playback order. Returns the ordered shard paths.
pub async fn segment(
    executor: &MediaExecutor,
    input: &Path,
    out_dir: &Path,
    format: ContainerFormat,
    segment_seconds: u32,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(out_dir).await?;

    let pattern = out_dir.join(format!("%04d.{}", format.extension()));
    let cmd = FfmpegCommand::new(input, &pattern)
        .output_arg("-f")
        .output_arg("segment")
        .output_arg("-segment_time")
        .output_arg(segment_seconds.to_string())
        .output_arg("-segment_format")
        .output_arg(format.muxer())
        .output_arg("-segment_format_options")
        .output_arg("fflags=+genpts")
        .output_arg("-reset_timestamps")
        .output_arg("1")
        .output_arg("-force_key_frames")
        .output_arg(format!("expr:gte(t,n_forced*{segment_seconds})"))
        .output_arg("-c:v")
        .output_arg(format.video_codec())
        .output_arg("-c:a")
        .output_arg("copy");

    executor.run(&cmd, cancel).await?;

    let mut shards = Vec::new();
    let mut entries = tokio::fs::read_dir(out_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(format.extension()) {
            shards.push(path);
        }
    }
    shards.sort();

    if shards.is_empty() {
        return Err(VidshardError::Media(
            "segmentation produced no shards".to_string(),
        ));
    }
    Ok(shards)
}

/// Transcode one shard: scale to the target resolution, encode video for the
/// requested container, copy audio.
pub async fn transcode(
    executor: &MediaExecutor,
    input: &Path,
    output: &Path,
    width: u32,
    height: u32,
    format: ContainerFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let cmd = FfmpegCommand::new(input, output)
        .video_filter(format!("scale={width}:{height}"))
        .video_codec(format.video_codec())
        .audio_codec("copy")
        .preset("fast")
        .output_arg("-fps_mode")
        .output_arg("passthrough")
        .format(format.muxer());

    executor.run(&cmd, cancel).await
}

/// Stream-copy concatenation with preserved timebases. Writes a concat
/// manifest next to the output and removes it afterwards.
pub async fn concatenate(
    executor: &MediaExecutor,
    inputs: &[PathBuf],
    output: &Path,
    format: ContainerFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(VidshardError::Media("nothing to concatenate".to_string()));
    }

    let manifest_path = output.with_extension("concat.txt");
    let mut manifest = tokio::fs::File::create(&manifest_path).await?;
    manifest
        .write_all(concat_manifest(inputs).as_bytes())
        .await?;
    manifest.flush().await?;
    drop(manifest);

    let cmd = FfmpegCommand::new(&manifest_path, output)
        .input_arg("-f")
        .input_arg("concat")
        .input_arg("-safe")
        .input_arg("0")
        .input_arg("-copytb")
        .input_arg("1")
        .output_arg("-c")
        .output_arg("copy")
        .format(format.muxer());

    let result = executor.run(&cmd, cancel).await;
    let _ = tokio::fs::remove_file(&manifest_path).await;
    result
}

/// Concat demuxer manifest body: one `file '<path>'` line per shard, in order.
pub fn concat_manifest(inputs: &[PathBuf]) -> String {
    let mut body = String::new();
    for path in inputs {
        body.push_str(&format!("file '{}'\n", path.display()));
    }
    body
}
