//! TTS session (C5).
//!
//! Streaming HTTPS request to the provider (ElevenLabs-shaped), piped
//! through the resampler pool (C2) into 8 kHz PCM chunks sized for 20 ms
//! framing. Grounded on the bridge's `OpenAiSession::close()` abort
//! pattern: cancellation is a `JoinHandle::abort()`, which kills the
//! background producer mid-flight and so naturally skips the
//! cache-write-on-completion step (§4.5: "if cancelled, no cache write").

use crate::phrase_cache::PhraseCache;
use crate::resampler::ResamplerPool;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{ debug, warn };

const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

pub struct TtsSession {
    chunk_rx: mpsc::Receiver<Vec<u8>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TtsSession {
    /// Next 20 ms PCM chunk, or `None` once the session has finished
    /// producing audio (normally or via provider error).
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunk_rx.recv().await
    }

    /// Cancel production immediately; any not-yet-consumed chunks are
    /// dropped and no dynamic-cache write occurs for this text.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TtsSession {
    /// Dropping a session (e.g. because the task holding it was aborted
    /// for barge-in, §4.8) must cancel production too — otherwise the
    /// provider fetch and decode keep running orphaned in the background.
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Open a new streaming TTS session for `text`. Fetched audio is decoded
/// and chunked by the resampler pool as it's produced, and — on
/// uncancelled completion — written back into `cache` for future hits.
pub fn spawn_tts_session(
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    voice_id: String,
    text: String,
    resampler: ResamplerPool,
    cache: PhraseCache
) -> TtsSession {
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(64);

    let handle = tokio::spawn(async move {
        let url = format!("{base_url}/v1/text-to-speech/{voice_id}/stream");
        let request = http
            .post(&url)
            .header("xi-api-key", &api_key)
            .json(&serde_json::json!({ "text": text, "model_id": "eleven_turbo_v2_5" }))
            .send();

        let response = match tokio::time::timeout(DEFAULT_DEADLINE, request).await {
            Ok(Ok(r)) if r.status().is_success() => r,
            Ok(Ok(r)) => {
                warn!(status = %r.status(), "tts provider returned error status");
                return;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "tts request failed");
                return;
            }
            Err(_) => {
                warn!("tts request timed out");
                return;
            }
        };

        // Bytes are handed to the decoder as they arrive rather than
        // buffered whole (§4.2 "lazy byte stream"): the decode task reads
        // from `mp3_rx` while this task is still pulling the HTTP body,
        // so playout can start before the utterance finishes streaming.
        let (mp3_tx, mp3_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let decode_handle = tokio::spawn({
            let resampler = resampler.clone();
            async move { resampler.mp3_stream_to_pcm8k(mp3_rx, chunk_tx).await }
        });

        let mut stream = response.bytes_stream();
        let mut had_bytes = false;
        while let Some(next) = stream.next().await {
            match next {
                Ok(bytes) => {
                    had_bytes = true;
                    if mp3_tx.send(bytes.to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "tts stream read error, stopping");
                    break;
                }
            }
        }
        drop(mp3_tx);

        if !had_bytes {
            warn!("tts provider returned empty body");
            let _ = decode_handle.await;
            return;
        }

        match decode_handle.await {
            Ok(Ok(concatenated)) => {
                debug!(
                    text_len = text.len(),
                    bytes = concatenated.len(),
                    "tts completed, caching dynamic phrase"
                );
                cache.put_dynamic(&text, concatenated).await;
            }
            Ok(Err(e)) => warn!(error = %e, "tts mp3 decode failed"),
            Err(e) => warn!(error = %e, "tts decode task did not complete"),
        }
    });

    TtsSession { chunk_rx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_cancel_aborts_producer_task() {
        let resampler = ResamplerPool::spawn(1);
        let cache = PhraseCache::from_static(HashMap::new(), 8);
        // No real provider reachable in tests; point at an address that
        // will fail fast, then assert cancel() doesn't panic and the
        // session yields no chunks.
        let http = reqwest::Client::new();
        let mut session = spawn_tts_session(
            http,
            "http://127.0.0.1:0".to_string(),
            "key".to_string(),
            "voice".to_string(),
            "bonjour".to_string(),
            resampler,
            cache.clone()
        );
        session.cancel();
        assert!(session.next_chunk().await.is_none());
        assert_eq!(cache.dynamic_len().await, 0);
    }
}
