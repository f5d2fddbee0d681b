//! Voice message normalization.
//!
//! Every voice note is decoded to 16 kHz mono 16-bit PCM before it reaches a
//! transcription backend. Decoding is done by ffmpeg in a child process that
//! is killed if the caller stops waiting.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Sample rate every backend receives.
pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug)]
pub enum TranscriptionError {
    /// The payload could not be decoded to PCM.
    UnsupportedFormat { format: String, reason: String },
    /// The backend failed, timed out or heard nothing.
    BackendError(String),
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFormat { format, reason } => {
                write!(f, "unsupported audio format '{}': {}", format, reason)
            }
            Self::BackendError(msg) => write!(f, "transcription backend error: {}", msg),
        }
    }
}

impl std::error::Error for TranscriptionError {}

/// Container/codec of an inbound voice payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    /// WhatsApp voice notes.
    OggOpus,
    Mpeg,
    Mp4,
    Aac,
    Amr,
    Wav,
    Webm,
    Other(String),
}

impl AudioFormat {
    /// Parse a MIME type such as `audio/ogg; codecs=opus`.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "audio/ogg" | "audio/opus" | "application/ogg" => Self::OggOpus,
            "audio/mpeg" | "audio/mp3" => Self::Mpeg,
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Self::Mp4,
            "audio/aac" => Self::Aac,
            "audio/amr" => Self::Amr,
            "audio/wav" | "audio/x-wav" | "audio/wave" => Self::Wav,
            "audio/webm" => Self::Webm,
            _ => Self::Other(mime.trim().to_string()),
        }
    }

    /// Guess from a file extension.
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "ogg" | "oga" | "opus" => Self::OggOpus,
            "mp3" => Self::Mpeg,
            "m4a" | "mp4" => Self::Mp4,
            "aac" => Self::Aac,
            "amr" => Self::Amr,
            "wav" => Self::Wav,
            "webm" => Self::Webm,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::from_extension(path.extension().and_then(|e| e.to_str()).unwrap_or(""))
    }

    /// File extension ffmpeg uses to probe the input. `None` for unknown formats.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::OggOpus => Some("ogg"),
            Self::Mpeg => Some("mp3"),
            Self::Mp4 => Some("m4a"),
            Self::Aac => Some("aac"),
            Self::Amr => Some("amr"),
            Self::Wav => Some("wav"),
            Self::Webm => Some("webm"),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OggOpus => f.write_str("audio/ogg; codecs=opus"),
            Self::Mpeg => f.write_str("audio/mpeg"),
            Self::Mp4 => f.write_str("audio/mp4"),
            Self::Aac => f.write_str("audio/aac"),
            Self::Amr => f.write_str("audio/amr"),
            Self::Wav => f.write_str("audio/wav"),
            Self::Webm => f.write_str("audio/webm"),
            Self::Other(mime) => f.write_str(mime),
        }
    }
}

/// 16 kHz mono signed 16-bit samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pcm {
    pub samples: Vec<i16>,
}

impl Pcm {
    /// Decode raw s16le bytes. A trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / SAMPLE_RATE as f64)
    }

    /// Samples scaled to [-1.0, 1.0), as whisper expects.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }

    /// A complete RIFF/WAVE file holding these samples.
    pub fn to_wav(&self) -> Vec<u8> {
        let data_len = (self.samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
        out.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Decodes an encoded payload to PCM.
#[async_trait]
pub trait AudioConverter: Send + Sync {
    async fn convert(&self, data: &[u8], format: &AudioFormat) -> Result<Pcm, TranscriptionError>;
}

/// Turns PCM into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;
    async fn transcribe(&self, pcm: &Pcm) -> Result<String, TranscriptionError>;
}

/// Converter backed by the ffmpeg binary.
pub struct FfmpegConverter {
    binary: PathBuf,
}

impl FfmpegConverter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Input file for one ffmpeg run, removed on drop.
struct TempInput(PathBuf);

impl TempInput {
    fn path_for(ext: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("kisaan_audio_{}_{}.{}", std::process::id(), n, ext))
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl AudioConverter for FfmpegConverter {
    async fn convert(&self, data: &[u8], format: &AudioFormat) -> Result<Pcm, TranscriptionError> {
        let unsupported = |reason: String| TranscriptionError::UnsupportedFormat {
            format: format.to_string(),
            reason,
        };
        let ext = format.extension().ok_or_else(|| unsupported("unknown format".into()))?;
        if data.is_empty() {
            return Err(unsupported("empty payload".into()));
        }

        // ffmpeg needs a seekable input for OGG, so go through a file.
        let input = TempInput(TempInput::path_for(ext));
        tokio::fs::write(&input.0, data)
            .await
            .map_err(|e| unsupported(format!("failed to write temp input: {e}")))?;

        let output = Command::new(&self.binary)
            .arg("-i")
            .arg(&input.0)
            .args([
                "-ar", "16000",
                "-ac", "1",
                "-f", "s16le",
                "-acodec", "pcm_s16le",
                "-y",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unsupported(format!("failed to run {:?}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(unsupported(format!("ffmpeg exited with {}: {}", output.status, last)));
        }

        let pcm = Pcm::from_le_bytes(&output.stdout);
        if pcm.is_empty() {
            return Err(unsupported("no audio decoded".into()));
        }
        debug!("Decoded {} bytes of {} to {:?} of PCM", data.len(), format, pcm.duration());
        Ok(pcm)
    }
}

/// Voice payload to text: decode, then transcribe, within one deadline.
pub struct AudioNormalizer {
    converter: Arc<dyn AudioConverter>,
    backend: Arc<dyn Transcriber>,
    timeout: Duration,
}

impl AudioNormalizer {
    pub fn new(converter: Arc<dyn AudioConverter>, backend: Arc<dyn Transcriber>, timeout: Duration) -> Self {
        Self { converter, backend, timeout }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn transcribe(&self, data: &[u8], format: &AudioFormat) -> Result<String, TranscriptionError> {
        if let AudioFormat::Other(mime) = format {
            return Err(TranscriptionError::UnsupportedFormat {
                format: mime.clone(),
                reason: "unknown format".into(),
            });
        }

        let started = Instant::now();
        let work = async {
            let pcm = self.converter.convert(data, format).await?;
            self.backend.transcribe(&pcm).await
        };

        let text = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Transcription via {} timed out after {:?}", self.backend.name(), self.timeout);
                return Err(TranscriptionError::BackendError(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(TranscriptionError::BackendError("empty transcript".into()));
        }
        info!(
            "Transcribed {} bytes via {} in {:?}",
            data.len(),
            self.backend.name(),
            started.elapsed()
        );
        Ok(text.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Returns a fixed second of silence.
    pub(crate) struct FakeConverter;

    #[async_trait]
    impl AudioConverter for FakeConverter {
        async fn convert(&self, _data: &[u8], _format: &AudioFormat) -> Result<Pcm, TranscriptionError> {
            Ok(Pcm { samples: vec![0; SAMPLE_RATE as usize] })
        }
    }

    /// Replies with a canned transcript after an optional delay.
    pub(crate) struct FakeTranscriber {
        pub text: String,
        pub delay: Duration,
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        fn name(&self) -> &str {
            "fake"
        }

        async fn transcribe(&self, _pcm: &Pcm) -> Result<String, TranscriptionError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.text.clone())
        }
    }

    pub(crate) fn normalizer(text: &str, delay: Duration, timeout: Duration) -> AudioNormalizer {
        AudioNormalizer::new(
            Arc::new(FakeConverter),
            Arc::new(FakeTranscriber { text: text.to_string(), delay }),
            timeout,
        )
    }

    #[test]
    fn test_format_from_mime() {
        assert_eq!(AudioFormat::from_mime("audio/ogg; codecs=opus"), AudioFormat::OggOpus);
        assert_eq!(AudioFormat::from_mime("Audio/MPEG"), AudioFormat::Mpeg);
        assert_eq!(AudioFormat::from_mime("audio/amr"), AudioFormat::Amr);
        assert_eq!(AudioFormat::from_mime("audio/webm;codecs=opus"), AudioFormat::Webm);
        assert_eq!(AudioFormat::from_mime("video/avi"), AudioFormat::Other("video/avi".into()));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(AudioFormat::from_path(Path::new("/tmp/note.OGG")), AudioFormat::OggOpus);
        assert_eq!(AudioFormat::from_path(Path::new("note.m4a")), AudioFormat::Mp4);
        assert!(AudioFormat::from_path(Path::new("note")).extension().is_none());
    }

    #[test]
    fn test_pcm_from_le_bytes() {
        let pcm = Pcm::from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x07]);
        assert_eq!(pcm.samples, vec![1, -1]);
        assert_eq!(Pcm { samples: vec![0; 8000] }.duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_pcm_to_f32_range() {
        let f = Pcm { samples: vec![i16::MIN, 0, i16::MAX] }.to_f32();
        assert_eq!(f[0], -1.0);
        assert_eq!(f[1], 0.0);
        assert!(f[2] < 1.0);
    }

    #[test]
    fn test_wav_header() {
        let wav = Pcm { samples: vec![1, 2, 3] }.to_wav();
        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36 + 6);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16_000);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 6);
        assert_eq!(&wav[44..46], &[1, 0]);
    }

    #[tokio::test]
    async fn test_normalizer_returns_trimmed_text() {
        let n = normalizer("  wheat varieties ", Duration::ZERO, Duration::from_secs(5));
        let text = n.transcribe(b"fake", &AudioFormat::OggOpus).await.unwrap();
        assert_eq!(text, "wheat varieties");
    }

    #[tokio::test]
    async fn test_normalizer_timeout_is_backend_error() {
        let n = normalizer("late", Duration::from_secs(10), Duration::from_millis(50));
        let err = n.transcribe(b"fake", &AudioFormat::OggOpus).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::BackendError(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_normalizer_empty_transcript_is_backend_error() {
        let n = normalizer("   ", Duration::ZERO, Duration::from_secs(5));
        let err = n.transcribe(b"fake", &AudioFormat::OggOpus).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::BackendError(_)));
    }

    #[tokio::test]
    async fn test_normalizer_rejects_unknown_format() {
        let n = normalizer("x", Duration::ZERO, Duration::from_secs(5));
        let err = n.transcribe(b"fake", &AudioFormat::from_mime("image/png")).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn test_ffmpeg_missing_binary_is_unsupported() {
        let converter = FfmpegConverter::new("/nonexistent/ffmpeg");
        let err = converter.convert(b"OggS", &AudioFormat::OggOpus).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn test_ffmpeg_empty_payload_is_unsupported() {
        let err = FfmpegConverter::default().convert(&[], &AudioFormat::Wav).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::UnsupportedFormat { ref reason, .. } if reason == "empty payload"));
    }
}
