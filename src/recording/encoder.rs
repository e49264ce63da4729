//! Video encoding backends.
//!
//! A backend advertises which mime types it can produce; [`negotiate`]
//! walks [`CODEC_PREFERENCE`] and picks the first one supported. An opened
//! [`EncodingSession`] takes composited RGBA frames and hands back encoded
//! chunks as they become available.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use image::RgbaImage;

/// Most preferred first: VP9, then VP8, then plain WebM with any encoder that can write it.
pub const CODEC_PREFERENCE: [&str; 3] = [
    "video/webm;codecs=vp9",
    "video/webm;codecs=vp8",
    "video/webm",
];

pub trait EncoderBackend: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn open(
        &self,
        mime_type: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn EncodingSession>>;
}

pub trait EncodingSession: Send {
    fn mime_type(&self) -> &str;

    /// Queues one frame. Frames must match the size the session was opened with.
    fn push_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    /// Encoded output produced so far and not yet drained. Never blocks.
    fn drain_chunks(&mut self) -> Vec<Bytes>;

    /// Flushes the encoder and returns every chunk not yet drained. Blocks
    /// until the encoder has exited.
    fn finish(self: Box<Self>) -> Result<Vec<Bytes>>;
}

pub fn negotiate(backend: &dyn EncoderBackend) -> Option<&'static str> {
    CODEC_PREFERENCE
        .iter()
        .copied()
        .find(|mime| backend.is_type_supported(mime))
}

/// Encodes through an `ffmpeg` subprocess fed raw RGBA on stdin, producing
/// WebM on stdout.
pub struct FfmpegEncoder {
    binary: PathBuf,
    supported: Vec<&'static str>,
    /// Encoder used for the bare `video/webm` entry.
    webm_encoder: Option<&'static str>,
}

/// WebM-capable ffmpeg encoders, in the order the bare `video/webm` entry
/// picks them.
const WEBM_ENCODERS: [&str; 4] = ["libvpx-vp9", "libvpx", "libaom-av1", "libsvtav1"];

/// Frames buffered between `push_frame` and the stdin writer thread.
const FRAME_QUEUE_DEPTH: usize = 8;

/// Seconds of consecutive dropped frames before the encoder is considered stalled.
const STALL_SECONDS: u32 = 2;

/// Bytes of ffmpeg stderr kept for error messages.
const STDERR_LIMIT: usize = 8 * 1024;

impl FfmpegEncoder {
    /// Probes `binary -encoders` once. A missing binary yields an encoder
    /// that supports nothing.
    pub fn detect(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let listing = match Command::new(&binary)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(output) => {
                log::warn!("{} -encoders exited with {}", binary.display(), output.status);
                String::new()
            }
            Err(err) => {
                log::warn!("ffmpeg not available at {}: {err}", binary.display());
                String::new()
            }
        };

        let encoder = Self::from_listing(binary, &listing);
        log::info!(
            "ffmpeg encoder supports {:?} (webm fallback: {:?})",
            encoder.supported,
            encoder.webm_encoder
        );
        encoder
    }

    fn from_listing(binary: PathBuf, listing: &str) -> Self {
        let (supported, webm_encoder) = supported_types(listing);
        Self {
            binary,
            supported,
            webm_encoder,
        }
    }

    pub fn supported_types(&self) -> &[&'static str] {
        &self.supported
    }

    fn codec_args(&self, mime_type: &str) -> Result<Vec<&'static str>> {
        let encoder = match mime_type {
            "video/webm;codecs=vp9" => "libvpx-vp9",
            "video/webm;codecs=vp8" => "libvpx",
            "video/webm" => self
                .webm_encoder
                .context("no WebM-capable encoder in this ffmpeg build")?,
            other => bail!("unsupported mime type {other}"),
        };

        let mut args = vec!["-c:v", encoder];
        match encoder {
            "libvpx-vp9" | "libvpx" => args.extend(["-deadline", "realtime", "-cpu-used", "8"]),
            "libaom-av1" => args.extend(["-cpu-used", "8", "-row-mt", "1"]),
            _ => {}
        }
        Ok(args)
    }
}

/// Maps `ffmpeg -encoders` output onto the mime types it can produce, plus
/// the encoder backing the bare `video/webm` entry. Builds without any
/// WebM-capable encoder support nothing.
fn supported_types(listing: &str) -> (Vec<&'static str>, Option<&'static str>) {
    let names: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    let has = |name: &str| names.contains(&name);

    let mut supported = Vec::new();
    if has("libvpx-vp9") {
        supported.push(CODEC_PREFERENCE[0]);
    }
    if has("libvpx") {
        supported.push(CODEC_PREFERENCE[1]);
    }

    let webm_encoder = WEBM_ENCODERS.iter().copied().find(|name| has(name));
    if webm_encoder.is_some() {
        supported.push(CODEC_PREFERENCE[2]);
    }
    (supported, webm_encoder)
}

impl EncoderBackend for FfmpegEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.contains(&mime_type)
    }

    fn open(
        &self,
        mime_type: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn EncodingSession>> {
        if !self.is_type_supported(mime_type) {
            bail!("{mime_type} is not supported by this ffmpeg build");
        }

        let size = format!("{width}x{height}");
        let rate = fps.to_string();
        let mut child = Command::new(&self.binary)
            .args([
                "-f", "rawvideo",
                "-pix_fmt", "rgba",
                "-s", size.as_str(),
                "-r", rate.as_str(),
                "-i", "pipe:0",
            ])
            .args(self.codec_args(mime_type)?)
            .args(["-pix_fmt", "yuv420p", "-f", "webm", "-loglevel", "error", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn ffmpeg. Is it installed?")?;

        let stdin = child.stdin.take().context("Failed to get ffmpeg stdin")?;
        let stdout = child.stdout.take().context("Failed to get ffmpeg stdout")?;
        let stderr = child.stderr.take().context("Failed to get ffmpeg stderr")?;

        // Stdin writer thread
        let (stdin_tx, stdin_rx) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let writer = thread::spawn(move || {
            let mut writer = BufWriter::new(stdin);
            while let Ok(data) = stdin_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
            }
            let _ = writer.flush();
        });

        // Stdout reader thread
        let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>();
        let reader = thread::spawn(move || {
            let mut reader = BufReader::with_capacity(64 * 1024, stdout);
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdout_tx.send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Stderr is drained continuously so ffmpeg never blocks on it
        let diagnostics = thread::spawn(move || {
            let mut kept = Vec::new();
            let mut buffer = [0u8; 4096];
            let mut stderr = stderr;
            loop {
                match stderr.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_LIMIT.saturating_sub(kept.len());
                        kept.extend_from_slice(&buffer[..n.min(room)]);
                    }
                }
            }
            String::from_utf8_lossy(&kept).trim().to_string()
        });

        log::info!("ffmpeg encoder started for {size} @ {fps}fps ({mime_type})");

        Ok(Box::new(FfmpegSession {
            mime_type: mime_type.to_string(),
            width,
            height,
            stall_limit: fps.max(1) * STALL_SECONDS,
            dropped_in_a_row: 0,
            child: Some(child),
            stdin_tx: Some(stdin_tx),
            stdout_rx,
            writer: Some(writer),
            reader: Some(reader),
            diagnostics: Some(diagnostics),
        }))
    }
}

struct FfmpegSession {
    mime_type: String,
    width: u32,
    height: u32,
    stall_limit: u32,
    dropped_in_a_row: u32,
    child: Option<Child>,
    stdin_tx: Option<SyncSender<Vec<u8>>>,
    stdout_rx: Receiver<Bytes>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    diagnostics: Option<JoinHandle<String>>,
}

impl EncodingSession for FfmpegSession {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// A full queue drops the frame. Dropping for `STALL_SECONDS` straight
    /// fails the session.
    fn push_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            bail!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }

        let tx = self.stdin_tx.as_ref().context("encoder input already closed")?;
        match tx.try_send(frame.as_raw().clone()) {
            Ok(()) => {
                self.dropped_in_a_row = 0;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped_in_a_row += 1;
                if self.dropped_in_a_row == 1 {
                    log::warn!("ffmpeg is falling behind; dropping frames");
                }
                if self.dropped_in_a_row >= self.stall_limit {
                    bail!(
                        "ffmpeg has not accepted a frame for {} frames",
                        self.dropped_in_a_row
                    );
                }
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("ffmpeg stopped accepting frames")),
        }
    }

    fn drain_chunks(&mut self) -> Vec<Bytes> {
        self.stdout_rx.try_iter().collect()
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<Bytes>> {
        if self.dropped_in_a_row >= self.stall_limit {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
            }
        }

        // closing stdin lets ffmpeg flush and exit
        self.stdin_tx.take();
        if let Some(writer) = self.writer.take() {
            writer
                .join()
                .map_err(|_| anyhow!("ffmpeg writer thread panicked"))?;
        }
        if let Some(reader) = self.reader.take() {
            reader
                .join()
                .map_err(|_| anyhow!("ffmpeg reader thread panicked"))?;
        }

        let chunks: Vec<Bytes> = self.stdout_rx.try_iter().collect();

        let mut child = self.child.take().context("ffmpeg process already reaped")?;
        let status = child.wait().context("failed to wait for ffmpeg")?;
        let diagnostics = match self.diagnostics.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            bail!("ffmpeg exited with {status}: {diagnostics}");
        }

        Ok(chunks)
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Keeps frames in memory instead of encoding them: one chunk per frame
/// with a short text record. For headless runs and tests.
pub struct MemoryEncoder {
    supported: Vec<String>,
}

impl MemoryEncoder {
    pub fn new<I, S>(supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported: supported.into_iter().map(Into::into).collect(),
        }
    }

    /// Supports every entry of [`CODEC_PREFERENCE`].
    pub fn all() -> Self {
        Self::new(CODEC_PREFERENCE)
    }
}

impl EncoderBackend for MemoryEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|s| s == mime_type)
    }

    fn open(
        &self,
        mime_type: &str,
        width: u32,
        height: u32,
        _fps: u32,
    ) -> Result<Box<dyn EncodingSession>> {
        if !self.is_type_supported(mime_type) {
            bail!("{mime_type} is not supported");
        }
        Ok(Box::new(MemorySession {
            mime_type: mime_type.to_string(),
            width,
            height,
            frames: 0,
            pending: Vec::new(),
        }))
    }
}

struct MemorySession {
    mime_type: String,
    width: u32,
    height: u32,
    frames: u64,
    pending: Vec<Bytes>,
}

impl EncodingSession for MemorySession {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn push_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            bail!("frame size changed mid-recording");
        }
        self.frames += 1;
        self.pending.push(Bytes::from(format!(
            "frame {} {}x{}\n",
            self.frames, self.width, self.height
        )));
        Ok(())
    }

    fn drain_chunks(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<Bytes>> {
        Ok(std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Encoders:
 V..... = Video
 ------
 V....D libvpx               libvpx VP8 (codec vp8)
 V....D libvpx-vp9           libvpx VP9 (codec vp9)
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
";

    #[test]
    fn listing_maps_to_mime_types() {
        let (supported, fallback) = supported_types(LISTING);
        assert_eq!(supported, CODEC_PREFERENCE.to_vec());
        assert_eq!(fallback, Some("libvpx-vp9"));

        let vp8_only = LISTING.replace("libvpx-vp9", "libaom-av1");
        let (supported, fallback) = supported_types(&vp8_only);
        assert_eq!(supported, vec!["video/webm;codecs=vp8", "video/webm"]);
        assert_eq!(fallback, Some("libvpx"));

        assert!(supported_types("").0.is_empty());
    }

    #[test]
    fn build_without_webm_encoders_supports_nothing() {
        let h264_only = " V....D libx264              libx264 H.264 (codec h264)\n";
        let encoder = FfmpegEncoder::from_listing(PathBuf::from("ffmpeg"), h264_only);
        assert!(encoder.supported_types().is_empty());
        assert_eq!(negotiate(&encoder), None);
        assert!(encoder.open("video/webm", 4, 4, 30).is_err());
    }

    #[test]
    fn bare_webm_names_its_encoder() {
        let av1_only = " V....D libaom-av1           libaom AV1 (codec av1)\n";
        let encoder = FfmpegEncoder::from_listing(PathBuf::from("ffmpeg"), av1_only);
        assert_eq!(negotiate(&encoder), Some("video/webm"));

        let args = encoder.codec_args("video/webm").unwrap();
        assert_eq!(&args[..2], &["-c:v", "libaom-av1"]);
        assert_eq!(
            &encoder.codec_args("video/webm;codecs=vp8").unwrap()[..2],
            &["-c:v", "libvpx"]
        );
    }

    /// Stands in for an ffmpeg that never reads its input.
    #[cfg(unix)]
    fn stalled_ffmpeg(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn stalled_ffmpeg_bounds_queue_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::from_listing(stalled_ffmpeg(dir.path()), LISTING);
        let fps = 30;
        let mut session = encoder.open("video/webm;codecs=vp9", 640, 480, fps).unwrap();
        let frame = RgbaImage::new(640, 480);

        let mut accepted = 0;
        let failure = (0..900).find_map(|_| match session.push_frame(&frame) {
            Ok(()) => {
                accepted += 1;
                None
            }
            Err(err) => Some(err),
        });

        let failure = failure.expect("stalled encoder never reported an error");
        assert!(failure.to_string().contains("has not accepted a frame"));
        // queue plus the one frame the writer thread is stuck on, then the
        // dropped frames that did not yet reach the stall limit
        let stall_limit = (fps * STALL_SECONDS) as usize;
        assert!(accepted <= FRAME_QUEUE_DEPTH + 1 + stall_limit);

        assert!(session.finish().is_err());
    }

    #[test]
    fn negotiation_follows_preference_order() {
        assert_eq!(negotiate(&MemoryEncoder::all()), Some("video/webm;codecs=vp9"));
        assert_eq!(
            negotiate(&MemoryEncoder::new(["video/webm", "video/webm;codecs=vp8"])),
            Some("video/webm;codecs=vp8")
        );
        assert_eq!(negotiate(&MemoryEncoder::new(["video/webm"])), Some("video/webm"));
        assert_eq!(negotiate(&MemoryEncoder::new(["video/mp4"])), None);
    }

    #[test]
    fn missing_ffmpeg_supports_nothing() {
        let encoder = FfmpegEncoder::detect("/nonexistent/ffmpeg-binary");
        assert!(encoder.supported_types().is_empty());
        assert_eq!(negotiate(&encoder), None);
    }

    #[test]
    fn memory_session_emits_chunk_per_frame() {
        let mut session = MemoryEncoder::all().open("video/webm", 4, 4, 30).unwrap();
        let frame = RgbaImage::new(4, 4);
        session.push_frame(&frame).unwrap();
        session.push_frame(&frame).unwrap();

        assert_eq!(session.drain_chunks().len(), 2);
        assert!(session.drain_chunks().is_empty());
        assert!(session.push_frame(&RgbaImage::new(2, 2)).is_err());
        assert!(session.finish().unwrap().is_empty());
    }
}
