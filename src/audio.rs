//! Rolling per-call audio store
//!
//! Bounded append-only PCM ring per call, FIFO-evicted by wall-clock window,
//! materialized as WAV on demand. A best-effort disk mirror keeps chunk
//! payloads and a `state.json` next to them for operators; correctness never
//! depends on the mirror.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::{codec, Error, Result};

const SAMPLE_WIDTH: u64 = 2;

/// Public metadata view of a call's rolling buffer
#[derive(Debug, Clone, Serialize)]
pub struct AudioSnapshot {
    pub call_id: String,
    pub available: bool,
    pub duration_seconds: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub sample_width: Option<u8>,
    pub chunk_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_chunk_id: String,
    pub window_seconds: u64,
}

#[derive(Debug)]
struct AudioChunk {
    id: String,
    pcm: Bytes,
    samples: u64,
    file: String,
}

#[derive(Debug)]
struct CallBuffer {
    sample_rate: u32,
    channels: u16,
    chunks: VecDeque<AudioChunk>,
    total_samples: u64,
    next_seq: u64,
    updated_at: DateTime<Utc>,
    last_chunk_id: String,
}

impl CallBuffer {
    fn new(sample_rate: u32, channels: u16, now: DateTime<Utc>) -> Self {
        Self {
            sample_rate,
            channels,
            chunks: VecDeque::new(),
            total_samples: 0,
            next_seq: 1,
            updated_at: now,
            last_chunk_id: String::new(),
        }
    }
}

/// Stores rolling PCM chunks per call and exposes WAV render output
pub struct LiveAudioStore {
    base_dir: PathBuf,
    window_seconds: u64,
    max_chunk_bytes: usize,
    buffers: DashMap<String, CallBuffer>,
}

impl LiveAudioStore {
    pub fn new(base_dir: PathBuf, window_seconds: u64, max_chunk_bytes: usize) -> Self {
        Self {
            base_dir,
            window_seconds: window_seconds.max(1),
            max_chunk_bytes: max_chunk_bytes.max(8_192),
            buffers: DashMap::new(),
        }
    }

    /// Append one S16LE PCM chunk. A sample-rate or channel change closes the
    /// old buffer and starts a new one; media format only changes at chunk
    /// boundaries.
    pub fn append(
        &self,
        call_id: &str,
        pcm: Bytes,
        sample_rate: u32,
        channels: u16,
        occurred_at: DateTime<Utc>,
        chunk_id: Option<String>,
    ) -> Result<AudioSnapshot> {
        if pcm.is_empty() {
            return Err(Error::InvalidRequest("Empty audio chunk".to_string()));
        }
        if pcm.len() > self.max_chunk_bytes {
            return Err(Error::InvalidRequest(
                "Audio chunk exceeds max size".to_string(),
            ));
        }
        if sample_rate == 0 {
            return Err(Error::InvalidRequest("Invalid sample_rate".to_string()));
        }
        if channels == 0 {
            return Err(Error::InvalidRequest("Invalid channels".to_string()));
        }

        let safe_id = safe_call_id(call_id);
        let call_dir = self.base_dir.join(&safe_id);

        let mut entry = self
            .buffers
            .entry(call_id.to_string())
            .or_insert_with(|| CallBuffer::new(sample_rate, channels, occurred_at));
        let buffer = entry.value_mut();

        if !buffer.chunks.is_empty()
            && (buffer.sample_rate != sample_rate || buffer.channels != channels)
        {
            debug!(
                call_id = %call_id,
                old_rate = buffer.sample_rate,
                new_rate = sample_rate,
                "audio format changed, resetting rolling buffer"
            );
            reset_call_dir(&call_dir);
            *buffer = CallBuffer::new(sample_rate, channels, occurred_at);
        }
        buffer.sample_rate = sample_rate;
        buffer.channels = channels;

        let seq = buffer.next_seq;
        let id = chunk_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("{}_{}", occurred_at.timestamp_millis(), seq));
        let file = format!("{seq:09}_{id}.pcm");

        let bytes_per_frame = u64::from(channels) * SAMPLE_WIDTH;
        let samples = (pcm.len() as u64 / bytes_per_frame).max(1);

        mirror_chunk(&call_dir, &file, &pcm);

        buffer.chunks.push_back(AudioChunk {
            id: id.clone(),
            pcm,
            samples,
            file,
        });
        buffer.total_samples += samples;
        buffer.next_seq = seq + 1;
        buffer.updated_at = occurred_at;
        buffer.last_chunk_id = id;

        // Evict from the front while the remainder still covers the window;
        // the total stays within one chunk of the configured window.
        let max_samples = self.window_seconds * u64::from(sample_rate);
        while buffer.chunks.len() > 1 {
            let front_samples = match buffer.chunks.front() {
                Some(front) => front.samples,
                None => break,
            };
            if buffer.total_samples.saturating_sub(front_samples) < max_samples {
                break;
            }
            if let Some(dropped) = buffer.chunks.pop_front() {
                buffer.total_samples = buffer.total_samples.saturating_sub(dropped.samples);
                unlink_mirror(&call_dir.join(&dropped.file));
            }
        }

        mirror_state(&call_dir, call_id, self.window_seconds, buffer);
        Ok(self.summarize(call_id, Some(&*buffer)))
    }

    /// Metadata-only view; zeroed fields when the call has no buffer
    pub fn snapshot(&self, call_id: &str) -> AudioSnapshot {
        match self.buffers.get(call_id) {
            Some(entry) => self.summarize(call_id, Some(entry.value())),
            None => self.summarize(call_id, None),
        }
    }

    /// Concatenate the retained window into a WAV stream. `max_seconds`
    /// trims to the most recent tail.
    pub fn render_wav(&self, call_id: &str, max_seconds: Option<u64>) -> Option<Vec<u8>> {
        let entry = self.buffers.get(call_id)?;
        let buffer = entry.value();
        if buffer.chunks.is_empty() {
            return None;
        }

        let mut pcm = Vec::with_capacity(
            buffer
                .chunks
                .iter()
                .map(|chunk| chunk.pcm.len())
                .sum::<usize>(),
        );
        for chunk in &buffer.chunks {
            pcm.extend_from_slice(&chunk.pcm);
        }

        if let Some(seconds) = max_seconds.filter(|seconds| *seconds > 0) {
            let bytes_per_second =
                u64::from(buffer.sample_rate) * u64::from(buffer.channels) * SAMPLE_WIDTH;
            let max_bytes = (bytes_per_second * seconds) as usize;
            if pcm.len() > max_bytes {
                pcm.drain(..pcm.len() - max_bytes);
            }
        }

        Some(codec::write_wav(buffer.sample_rate, buffer.channels, &pcm))
    }

    fn summarize(&self, call_id: &str, buffer: Option<&CallBuffer>) -> AudioSnapshot {
        match buffer {
            Some(buffer) => {
                let duration = if buffer.sample_rate > 0 {
                    buffer.total_samples as f64 / f64::from(buffer.sample_rate)
                } else {
                    0.0
                };
                AudioSnapshot {
                    call_id: call_id.to_string(),
                    available: !buffer.chunks.is_empty(),
                    duration_seconds: (duration * 1000.0).round() / 1000.0,
                    sample_rate: Some(buffer.sample_rate),
                    channels: Some(buffer.channels),
                    sample_width: Some(SAMPLE_WIDTH as u8),
                    chunk_count: buffer.chunks.len(),
                    updated_at: Some(buffer.updated_at),
                    last_chunk_id: buffer.last_chunk_id.clone(),
                    window_seconds: self.window_seconds,
                }
            }
            None => AudioSnapshot {
                call_id: call_id.to_string(),
                available: false,
                duration_seconds: 0.0,
                sample_rate: None,
                channels: None,
                sample_width: None,
                chunk_count: 0,
                updated_at: None,
                last_chunk_id: String::new(),
                window_seconds: self.window_seconds,
            },
        }
    }
}

fn mirror_chunk(call_dir: &Path, file: &str, pcm: &[u8]) {
    if let Err(err) = std::fs::create_dir_all(call_dir) {
        debug!(path = %call_dir.display(), error = %err, "audio mirror dir create failed");
        return;
    }
    if let Err(err) = std::fs::write(call_dir.join(file), pcm) {
        debug!(path = %call_dir.display(), error = %err, "audio mirror chunk write failed");
    }
}

fn mirror_state(call_dir: &Path, call_id: &str, window_seconds: u64, buffer: &CallBuffer) {
    let chunks: Vec<_> = buffer
        .chunks
        .iter()
        .map(|chunk| {
            json!({
                "id": chunk.id,
                "file": chunk.file,
                "samples": chunk.samples,
                "bytes": chunk.pcm.len(),
            })
        })
        .collect();
    let state = json!({
        "call_id": call_id,
        "window_seconds": window_seconds,
        "sample_rate": buffer.sample_rate,
        "channels": buffer.channels,
        "sample_width": SAMPLE_WIDTH,
        "chunks": chunks,
        "total_samples": buffer.total_samples,
        "next_seq": buffer.next_seq,
        "updated_at": buffer.updated_at.to_rfc3339(),
        "last_chunk_id": buffer.last_chunk_id,
    });
    if let Err(err) = std::fs::write(call_dir.join("state.json"), state.to_string()) {
        debug!(path = %call_dir.display(), error = %err, "audio mirror state write failed");
    }
}

fn unlink_mirror(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %err, "audio mirror cleanup failed");
        }
    }
}

fn reset_call_dir(call_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(call_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_mirror_file = path
            .extension()
            .map(|ext| ext == "pcm")
            .unwrap_or(false)
            || path.file_name().map(|name| name == "state.json").unwrap_or(false);
        if is_mirror_file {
            unlink_mirror(&path);
        }
    }
}

fn safe_call_id(call_id: &str) -> String {
    let cleaned: String = call_id
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|ch| ch == '.' || ch == '_');
    let capped: String = trimmed.chars().take(96).collect();
    if capped.is_empty() {
        "call".to_string()
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(window_seconds: u64) -> LiveAudioStore {
        let dir = tempfile::tempdir().unwrap();
        LiveAudioStore::new(dir.into_path(), window_seconds, 2_000_000)
    }

    fn pcm_millis(sample_rate: u32, channels: u16, millis: u64) -> Bytes {
        let bytes =
            (u64::from(sample_rate) * u64::from(channels) * SAMPLE_WIDTH * millis) / 1000;
        Bytes::from(vec![0u8; bytes as usize])
    }

    #[test]
    fn test_rotation_keeps_window_bounded() {
        // 1s window, 16 kHz mono, six 400ms chunks
        let store = store(1);
        for _ in 0..6 {
            store
                .append("RT-rot", pcm_millis(16_000, 1, 400), 16_000, 1, Utc::now(), None)
                .unwrap();
        }
        let snap = store.snapshot("RT-rot");
        assert!(snap.available);
        assert!(snap.duration_seconds >= 1.0);
        assert!(snap.duration_seconds <= 1.4);
        assert!(snap.chunk_count <= 3);
    }

    #[test]
    fn test_rotation_evicts_oldest_first() {
        let store = store(1);
        let first = store
            .append("RT-old", pcm_millis(16_000, 1, 700), 16_000, 1, Utc::now(), None)
            .unwrap();
        let first_id = first.last_chunk_id.clone();
        for _ in 0..2 {
            store
                .append("RT-old", pcm_millis(16_000, 1, 700), 16_000, 1, Utc::now(), None)
                .unwrap();
        }
        let wav = store.render_wav("RT-old", None).unwrap();
        // two 700ms chunks retained after the first was evicted
        assert_eq!(wav.len(), 44 + 2 * pcm_millis(16_000, 1, 700).len());
        let snap = store.snapshot("RT-old");
        assert_ne!(snap.last_chunk_id, first_id);
        assert_eq!(snap.chunk_count, 2);
    }

    #[test]
    fn test_chunk_ids_are_monotonic() {
        let store = store(300);
        let now = Utc::now();
        let a = store
            .append("RT-ids", pcm_millis(8_000, 1, 100), 8_000, 1, now, None)
            .unwrap();
        let b = store
            .append("RT-ids", pcm_millis(8_000, 1, 100), 8_000, 1, now, None)
            .unwrap();
        assert!(a.last_chunk_id.ends_with("_1"));
        assert!(b.last_chunk_id.ends_with("_2"));
    }

    #[test]
    fn test_format_change_resets_buffer() {
        let store = store(300);
        store
            .append("RT-fmt", pcm_millis(8_000, 1, 500), 8_000, 1, Utc::now(), None)
            .unwrap();
        let snap = store
            .append("RT-fmt", pcm_millis(16_000, 1, 500), 16_000, 1, Utc::now(), None)
            .unwrap();
        assert_eq!(snap.chunk_count, 1);
        assert_eq!(snap.sample_rate, Some(16_000));
        assert!((snap.duration_seconds - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_oversize_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LiveAudioStore::new(dir.into_path(), 300, 8_192);
        let result = store.append(
            "RT-big",
            Bytes::from(vec![0u8; 9_000]),
            16_000,
            1,
            Utc::now(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let store = store(300);
        let snap = store.snapshot("nope");
        assert!(!snap.available);
        assert_eq!(snap.chunk_count, 0);
        assert_eq!(snap.duration_seconds, 0.0);
        assert!(snap.sample_rate.is_none());
        assert!(store.render_wav("nope", None).is_none());
    }

    #[test]
    fn test_render_wav_respects_max_seconds() {
        let store = store(300);
        store
            .append("RT-tail", pcm_millis(8_000, 1, 4_000), 8_000, 1, Utc::now(), None)
            .unwrap();
        let wav = store.render_wav("RT-tail", Some(1)).unwrap();
        // 1s of 8 kHz mono s16le = 16000 bytes
        assert_eq!(wav.len(), 44 + 16_000);
    }
}
