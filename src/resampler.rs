//! Resampler pool (C2).
//!
//! CPU-heavy MP3⇄PCM conversion runs on a bounded worker pool so it never
//! blocks a call's event loop. Workers share one job queue behind a
//! `tokio::sync::Mutex<mpsc::Receiver<_>>`, the same fan-out-to-N-workers
//! shape the teacher uses for its VAD processor pool in `main.rs`.

use crate::error::CoreError;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{ MediaSource, MediaSourceStream };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::{ mpsc, oneshot, Mutex };
use tracing::{ debug, warn };

/// 20 ms of 8 kHz/16-bit/mono PCM.
pub const FRAME_BYTES: usize = 320;
const TARGET_RATE: u32 = 8000;

enum Job {
    Mp3ToPcm8k {
        mp3: Vec<u8>,
        respond: oneshot::Sender<Result<Vec<u8>, CoreError>>,
    },
    Mp3StreamToPcm8k {
        mp3_rx: std::sync::mpsc::Receiver<Vec<u8>>,
        pcm_tx: mpsc::Sender<Vec<u8>>,
        respond: oneshot::Sender<Result<Vec<u8>, CoreError>>,
    },
    Pcm8kToMp3 {
        pcm: Vec<u8>,
        respond: oneshot::Sender<Result<Vec<u8>, CoreError>>,
    },
}

/// Handle to the bounded resampling worker pool.
#[derive(Clone)]
pub struct ResamplerPool {
    job_tx: mpsc::Sender<Job>,
}

impl ResamplerPool {
    /// Spawn `workers` blocking-capable tasks pulling from a shared queue.
    pub fn spawn(workers: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel(256);
        let job_rx = Arc::new(Mutex::new(job_rx));

        for i in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = job_rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => run_job(job).await,
                        None => {
                            break;
                        }
                    }
                }
                debug!(worker = i, "resampler worker stopped");
            });
        }

        Self { job_tx }
    }

    /// Decode a full MP3 byte stream to 8 kHz/16-bit/mono PCM, chunked
    /// into multiples of `FRAME_BYTES` (right-padded with zeros at the
    /// tail so every chunk is exactly 20 ms).
    pub async fn mp3_to_pcm8k(&self, mp3: Vec<u8>) -> Result<Vec<Vec<u8>>, CoreError> {
        let (respond, reply) = oneshot::channel();
        self.job_tx
            .send(Job::Mp3ToPcm8k { mp3, respond }).await
            .map_err(|_| CoreError::Fatal("resampler pool closed".into()))?;
        let pcm = reply.await.map_err(|_| CoreError::Fatal("resampler worker dropped".into()))??;
        Ok(chunk_padded(&pcm, FRAME_BYTES))
    }

    /// Decode a *lazy* MP3 byte stream to 8 kHz/16-bit/mono PCM: bytes
    /// arrive on `mp3_rx` (a plain `std::sync::mpsc` channel, fed from an
    /// async task as the provider response streams in) and are decoded
    /// packet-by-packet, with each completed 20 ms frame pushed onto
    /// `pcm_tx` as soon as it's ready — playout can start before the
    /// whole utterance has finished decoding (§4.2, §4.5). Returns the
    /// full concatenated PCM on completion, for the dynamic-cache write.
    pub async fn mp3_stream_to_pcm8k(
        &self,
        mp3_rx: std::sync::mpsc::Receiver<Vec<u8>>,
        pcm_tx: mpsc::Sender<Vec<u8>>
    ) -> Result<Vec<u8>, CoreError> {
        let (respond, reply) = oneshot::channel();
        self.job_tx
            .send(Job::Mp3StreamToPcm8k { mp3_rx, pcm_tx, respond }).await
            .map_err(|_| CoreError::Fatal("resampler pool closed".into()))?;
        reply.await.map_err(|_| CoreError::Fatal("resampler worker dropped".into()))?
    }

    /// Offline batch direction: PCM8k → MP3, used by the logs-to-MP3
    /// collaborator (not the realtime path).
    pub async fn pcm_to_mp3(&self, pcm: Vec<u8>) -> Result<Vec<u8>, CoreError> {
        let (respond, reply) = oneshot::channel();
        self.job_tx
            .send(Job::Pcm8kToMp3 { pcm, respond }).await
            .map_err(|_| CoreError::Fatal("resampler pool closed".into()))?;
        reply.await.map_err(|_| CoreError::Fatal("resampler worker dropped".into()))?
    }
}

async fn run_job(job: Job) {
    match job {
        Job::Mp3ToPcm8k { mp3, respond } => {
            let result = tokio::task::spawn_blocking(move || decode_mp3_to_pcm8k(&mp3))
                .await
                .unwrap_or_else(|e| Err(CoreError::ProviderError(format!("decode panicked: {e}"))));
            let _ = respond.send(result);
        }
        Job::Mp3StreamToPcm8k { mp3_rx, pcm_tx, respond } => {
            let result = tokio::task::spawn_blocking(move || decode_mp3_stream_to_pcm8k(mp3_rx, pcm_tx))
                .await
                .unwrap_or_else(|e| Err(CoreError::ProviderError(format!("decode panicked: {e}"))));
            let _ = respond.send(result);
        }
        Job::Pcm8kToMp3 { pcm, respond } => {
            let result = tokio::task::spawn_blocking(move || encode_pcm8k_to_mp3(&pcm))
                .await
                .unwrap_or_else(|e| Err(CoreError::ProviderError(format!("encode panicked: {e}"))));
            let _ = respond.send(result);
        }
    }
}

/// Decode an in-memory MP3 buffer to 8 kHz/16-bit LE mono PCM.
fn decode_mp3_to_pcm8k(mp3: &[u8]) -> Result<Vec<u8>, CoreError> {
    let cursor = std::io::Cursor::new(mp3.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia
        ::default
        ::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CoreError::ProviderError(format!("mp3 probe failed: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| CoreError::ProviderError("no audio track in mp3".into()))?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(TARGET_RATE);

    let mut decoder = symphonia
        ::default
        ::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CoreError::ProviderError(format!("mp3 decoder init failed: {e}")))?;

    let mut samples_i16: Vec<i16> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => {
                break;
            }
            Err(e) => {
                return Err(CoreError::ProviderError(format!("mp3 read error: {e}")));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut sample_buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                sample_buf.copy_interleaved_ref(decoded);
                if spec.channels.count() > 1 {
                    for frame in sample_buf.samples().chunks(spec.channels.count()) {
                        samples_i16.push(frame[0]);
                    }
                } else {
                    samples_i16.extend_from_slice(sample_buf.samples());
                }
            }
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                warn!(error = %e, "skipping undecodable mp3 packet");
            }
            Err(e) => {
                return Err(CoreError::ProviderError(format!("mp3 decode error: {e}")));
            }
        }
    }

    let pcm_bytes: Vec<u8> = samples_i16
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    Ok(linear_resample(&pcm_bytes, source_rate, TARGET_RATE))
}

/// A `symphonia` `MediaSource` backed by a blocking channel of byte
/// chunks, so the probe/decoder can read an MP3 as it arrives over the
/// network instead of needing the whole body up front. Not seekable —
/// a live HTTP stream can't rewind.
struct ChannelSource {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl std::io::Read for ChannelSource {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(bytes) => {
                    self.buf = bytes;
                    self.pos = 0;
                }
                Err(_) => {
                    return Ok(0);
                }
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl std::io::Seek for ChannelSource {
    fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "streaming mp3 source is not seekable"))
    }
}

impl MediaSource for ChannelSource {
    fn is_seekable(&self) -> bool {
        false
    }
    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Decode an MP3 stream arriving incrementally on `mp3_rx`, emitting each
/// completed 20 ms PCM frame on `pcm_tx` as soon as it's decoded rather
/// than after the whole body is in (§4.2 "lazy byte stream",
/// §4.5 "incremental playback"). Returns the full concatenated PCM for
/// the caller to cache once the stream ends.
fn decode_mp3_stream_to_pcm8k(
    mp3_rx: std::sync::mpsc::Receiver<Vec<u8>>,
    pcm_tx: mpsc::Sender<Vec<u8>>
) -> Result<Vec<u8>, CoreError> {
    let source = ChannelSource { rx: mp3_rx, buf: Vec::new(), pos: 0 };
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia
        ::default
        ::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CoreError::ProviderError(format!("mp3 probe failed: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| CoreError::ProviderError("no audio track in mp3".into()))?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(TARGET_RATE);

    let mut decoder = symphonia
        ::default
        ::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CoreError::ProviderError(format!("mp3 decoder init failed: {e}")))?;

    let mut concatenated: Vec<u8> = Vec::new();
    let mut carry: Vec<u8> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => {
                break;
            }
            Err(e) => {
                return Err(CoreError::ProviderError(format!("mp3 read error: {e}")));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut sample_buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                sample_buf.copy_interleaved_ref(decoded);
                let mut samples_i16: Vec<i16> = Vec::new();
                if spec.channels.count() > 1 {
                    for frame in sample_buf.samples().chunks(spec.channels.count()) {
                        samples_i16.push(frame[0]);
                    }
                } else {
                    samples_i16.extend_from_slice(sample_buf.samples());
                }
                let pcm_bytes: Vec<u8> = samples_i16
                    .iter()
                    .flat_map(|s| s.to_le_bytes())
                    .collect();
                let resampled = linear_resample(&pcm_bytes, source_rate, TARGET_RATE);
                concatenated.extend_from_slice(&resampled);
                carry.extend_from_slice(&resampled);

                while carry.len() >= FRAME_BYTES {
                    let chunk: Vec<u8> = carry.drain(..FRAME_BYTES).collect();
                    if pcm_tx.blocking_send(chunk).is_err() {
                        return Ok(concatenated);
                    }
                }
            }
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                warn!(error = %e, "skipping undecodable mp3 packet");
            }
            Err(e) => {
                return Err(CoreError::ProviderError(format!("mp3 decode error: {e}")));
            }
        }
    }

    if !carry.is_empty() {
        carry.resize(FRAME_BYTES, 0);
        let _ = pcm_tx.blocking_send(carry);
    }

    Ok(concatenated)
}

/// Encode 8 kHz/16-bit LE mono PCM into an MP3 byte stream (offline path).
fn encode_pcm8k_to_mp3(pcm: &[u8]) -> Result<Vec<u8>, CoreError> {
    use mp3lame_encoder::{ Bitrate, Builder, FlushNoGap, MonoPcm };

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    let mut builder = Builder::new().ok_or_else(|| CoreError::ProviderError("lame init failed".into()))?;
    builder
        .set_sample_rate(TARGET_RATE)
        .map_err(|e| CoreError::ProviderError(format!("lame sample rate: {e:?}")))?;
    builder
        .set_brate(Bitrate::Kbps64)
        .map_err(|e| CoreError::ProviderError(format!("lame bitrate: {e:?}")))?;
    builder.set_num_channels(1).map_err(|e| CoreError::ProviderError(format!("lame channels: {e:?}")))?;
    let mut encoder = builder
        .build()
        .map_err(|e| CoreError::ProviderError(format!("lame build: {e:?}")))?;

    let mut out = Vec::with_capacity(samples.len());
    let input = MonoPcm(&samples);
    out.resize(mp3lame_encoder::max_required_buffer_size(samples.len()), 0u8);
    let written = encoder
        .encode(input, &mut out)
        .map_err(|e| CoreError::ProviderError(format!("lame encode: {e:?}")))?;
    out.truncate(written);

    let mut tail = vec![0u8; 7200];
    let flushed = encoder
        .flush::<FlushNoGap>(&mut tail)
        .map_err(|e| CoreError::ProviderError(format!("lame flush: {e:?}")))?;
    out.extend_from_slice(&tail[..flushed]);

    Ok(out)
}

/// `⌊ms·8⌋` samples of silence (8 kHz, 16-bit, mono ⇒ 2 bytes/sample).
pub fn silence_ms(ms: u64) -> Vec<u8> {
    let samples = (ms * 8) as usize;
    vec![0u8; samples * 2]
}

/// Right-pad `data` to a multiple of `chunk_size` with zeros, then split.
fn chunk_padded(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    let remainder = data.len() % chunk_size;
    let mut padded = data.to_vec();
    if remainder != 0 {
        padded.resize(data.len() + (chunk_size - remainder), 0);
    }
    padded.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Generic linear-interpolation resampler for 16-bit LE PCM, used to move
/// provider-native sample rates to the 8 kHz wire rate.
pub fn linear_resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate {
        return pcm.to_vec();
    }
    let n_in = pcm.len() / 2;
    if n_in == 0 {
        return Vec::new();
    }

    let src: Vec<i16> = (0..n_in)
        .map(|i| i16::from_le_bytes([pcm[i * 2], pcm[i * 2 + 1]]))
        .collect();

    let n_out = (((n_in as u64) * (to_rate as u64)) / (from_rate as u64)) as usize;
    let mut out = Vec::with_capacity(n_out * 2);

    if n_out <= 1 {
        out.extend_from_slice(&src[0].to_le_bytes());
        return out;
    }

    for j in 0..n_out {
        let pos = ((j as f64) * ((n_in - 1) as f64)) / ((n_out - 1) as f64);
        let idx = pos as usize;
        let frac = pos - (idx as f64);

        let s = if idx + 1 < n_in {
            ((src[idx] as f64) * (1.0 - frac) + (src[idx + 1] as f64) * frac).round() as i16
        } else {
            src[n_in - 1]
        };
        out.extend_from_slice(&s.to_le_bytes());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_ms() {
        assert_eq!(silence_ms(20).len(), FRAME_BYTES);
        assert_eq!(silence_ms(20).iter().all(|&b| b == 0), true);
    }

    #[test]
    fn test_chunk_padded_exact() {
        let data = vec![1u8; 640];
        let chunks = chunk_padded(&data, FRAME_BYTES);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == FRAME_BYTES));
    }

    #[test]
    fn test_chunk_padded_pads_tail() {
        let data = vec![1u8; 500];
        let chunks = chunk_padded(&data, FRAME_BYTES);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), FRAME_BYTES);
        assert!(chunks[1][180..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_linear_resample_ratio() {
        let pcm = vec![0u8; 16_000 * 2];
        let down = linear_resample(&pcm, 16_000, 8_000);
        assert_eq!(down.len() / 2, 8_000);
    }

    #[test]
    fn test_linear_resample_identity() {
        let pcm = vec![5u8, 6, 7, 8];
        assert_eq!(linear_resample(&pcm, 8_000, 8_000), pcm);
    }

    #[test]
    fn test_linear_resample_empty() {
        assert!(linear_resample(&[], 16_000, 8_000).is_empty());
    }

    #[tokio::test]
    async fn test_pool_roundtrip_pcm_mp3_pcm() {
        let pool = ResamplerPool::spawn(2);
        let n = 8_000usize;
        let mut pcm = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = (i as f64) / (n as f64);
            let s = (t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 12_000.0;
            pcm.extend_from_slice(&(s as i16).to_le_bytes());
        }

        let mp3 = pool.pcm_to_mp3(pcm.clone()).await.unwrap();
        assert!(!mp3.is_empty());

        let chunks = pool.mp3_to_pcm8k(mp3).await.unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.len() == FRAME_BYTES));
    }

    #[tokio::test]
    async fn test_stream_decode_yields_frames_before_feed_completes() {
        let pool = ResamplerPool::spawn(2);
        let n = 8_000usize;
        let mut pcm = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = (i as f64) / (n as f64);
            let s = (t * 440.0 * 2.0 * std::f64::consts::PI).sin() * 12_000.0;
            pcm.extend_from_slice(&(s as i16).to_le_bytes());
        }
        let mp3 = pool.pcm_to_mp3(pcm).await.unwrap();

        let (mp3_tx, mp3_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let (pcm_tx, mut pcm_rx) = mpsc::channel::<Vec<u8>>(64);

        let decode = tokio::spawn({
            let pool = pool.clone();
            async move { pool.mp3_stream_to_pcm8k(mp3_rx, pcm_tx).await }
        });

        // Feed the encoded body in small windows, standing in for HTTP
        // response chunks arriving off the wire.
        for window in mp3.chunks(256) {
            mp3_tx.send(window.to_vec()).unwrap();
        }
        drop(mp3_tx);

        let first = pcm_rx.recv().await;
        assert!(first.is_some(), "at least one frame must be decoded before the feed fully drains");
        assert_eq!(first.as_ref().unwrap().len(), FRAME_BYTES);

        let mut frame_count = 1;
        while pcm_rx.recv().await.is_some() {
            frame_count += 1;
        }
        assert!(frame_count > 1, "a multi-second utterance must decode into more than one frame");

        let concatenated = decode.await.unwrap().unwrap();
        assert!(!concatenated.is_empty());
    }
}
