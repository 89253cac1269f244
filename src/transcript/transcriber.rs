//! Transcript generation
//!
//! 1. Cache every audio part locally under `audio_cache/<abs_id>/`
//! 2. Probe each part's duration with ffprobe
//! 3. Run the configured speech-to-text command per part
//! 4. Offset segment times by the running duration and save one transcript
//!
//! The cache directory is always removed afterwards; a partially written
//! transcript is removed on failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::{Segment, TranscriptError};
use crate::config::TranscribeConfig;

/// A downloadable audio part of an audiobook
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFile {
    pub stream_url: String,
    /// Extension including the dot, e.g. `.m4b`
    pub ext: String,
}

pub struct Transcriber {
    transcripts_dir: PathBuf,
    cache_root: PathBuf,
    config: TranscribeConfig,
    http: reqwest::Client,
}

impl Transcriber {
    pub fn new(data_dir: &Path, config: TranscribeConfig) -> Self {
        Self {
            transcripts_dir: data_dir.join("transcripts"),
            cache_root: data_dir.join("audio_cache"),
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn transcript_path(&self, abs_id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{}.json", abs_id))
    }

    /// Build (or reuse) the transcript for an audiobook and return its path
    pub async fn process_audio(
        &self,
        abs_id: &str,
        audio_files: &[AudioFile],
    ) -> Result<PathBuf, TranscriptError> {
        let output = self.transcript_path(abs_id);
        if output.exists() {
            info!(abs_id, "Transcript already exists");
            return Ok(output);
        }

        if self.config.command.is_empty() {
            return Err(TranscriptError::NotConfigured);
        }

        let cache_dir = self.cache_root.join(abs_id);
        if cache_dir.exists() {
            tokio::fs::remove_dir_all(&cache_dir).await.ok();
        }
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| TranscriptError::Download(e.to_string()))?;
        tokio::fs::create_dir_all(&self.transcripts_dir)
            .await
            .map_err(|e| TranscriptError::Transcribe(e.to_string()))?;

        let result = self.run_pipeline(abs_id, audio_files, &cache_dir, &output).await;

        info!(abs_id, "Cleaning up audio cache");
        if let Err(e) = tokio::fs::remove_dir_all(&cache_dir).await {
            warn!(abs_id, error = %e, "Failed to remove audio cache");
        }

        if let Err(e) = &result {
            error!(abs_id, error = %e, "Transcription failed");
            if output.exists() {
                tokio::fs::remove_file(&output).await.ok();
            }
        }

        result.map(|_| output)
    }

    async fn run_pipeline(
        &self,
        abs_id: &str,
        audio_files: &[AudioFile],
        cache_dir: &Path,
        output: &Path,
    ) -> Result<(), TranscriptError> {
        info!(abs_id, parts = audio_files.len(), "Caching audio parts");

        let mut local_files = Vec::with_capacity(audio_files.len());
        for (idx, audio) in audio_files.iter().enumerate() {
            let local = cache_dir.join(format!("part_{:03}{}", idx, audio.ext));
            info!(abs_id, part = idx + 1, total = audio_files.len(), "Downloading part");
            self.download(&audio.stream_url, &local).await?;
            local_files.push(local);
        }

        info!(abs_id, "All parts cached, transcribing");

        let mut transcript = Vec::new();
        let mut offset = 0.0;
        for (idx, local) in local_files.iter().enumerate() {
            let duration = self.probe_duration(local).await;
            info!(abs_id, part = idx + 1, duration_secs = duration, "Transcribing part");

            for seg in self.transcribe_part(local).await? {
                transcript.push(Segment {
                    start: seg.start + offset,
                    end: seg.end + offset,
                    text: seg.text.trim().to_string(),
                });
            }
            offset += duration;
        }

        let json = serde_json::to_vec(&transcript)
            .map_err(|e| TranscriptError::Transcribe(e.to_string()))?;
        tokio::fs::write(output, json)
            .await
            .map_err(|e| TranscriptError::Transcribe(e.to_string()))?;

        info!(abs_id, path = %output.display(), segments = transcript.len(), "Transcript saved");
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), TranscriptError> {
        let response = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| TranscriptError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TranscriptError::Download(format!("HTTP {}", response.status())));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TranscriptError::Download(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TranscriptError::Download(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TranscriptError::Download(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| TranscriptError::Download(e.to_string()))?;

        if written == 0 {
            return Err(TranscriptError::Download(format!(
                "{} is empty",
                dest.display()
            )));
        }
        Ok(())
    }

    /// Part length in seconds; 0 when ffprobe is unavailable or confused
    async fn probe_duration(&self, path: &Path) -> f64 {
        let output = Command::new(&self.config.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) => parse_duration(&String::from_utf8_lossy(&out.stdout)).unwrap_or_else(|| {
                error!(path = %path.display(), "Could not parse ffprobe duration");
                0.0
            }),
            Err(e) => {
                error!(path = %path.display(), error = %e, "ffprobe failed");
                0.0
            }
        }
    }

    async fn transcribe_part(&self, path: &Path) -> Result<Vec<Segment>, TranscriptError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(TranscriptError::NotConfigured)?;

        let output = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| TranscriptError::Transcribe(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            return Err(TranscriptError::Transcribe(format!(
                "{} exited with {}",
                program, output.status
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| TranscriptError::Transcribe(format!("invalid segment JSON: {}", e)))
    }
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout.trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}
