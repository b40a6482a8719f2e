//! STT session (C4).
//!
//! Streaming speech-to-text over a provider WebSocket (Deepgram-shaped),
//! grounded on the bridge's `transport_openai.rs` reader/writer task
//! split: a writer task forwards inbound PCM as binary frames, a reader
//! task parses server events into [`Transcript`]s and VAD events and
//! forwards them on an mpsc channel. The session is re-created (not
//! reconfigured) whenever the endpointing mode changes across turns.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{ SinkExt, StreamExt };
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{ debug, error, info, warn };

/// Endpointing mode: controls the server's trailing-silence threshold
/// before a final transcript is emitted (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttMode {
    /// ~1200 ms trailing silence — open-ended questions.
    Open,
    /// ~500 ms trailing silence — yes/no confirmations.
    YesNo,
    /// ~500 ms trailing silence — short factual replies (email, etc).
    Quick,
}

impl SttMode {
    fn endpointing_ms(self) -> u32 {
        match self {
            SttMode::Open => 1200,
            SttMode::YesNo | SttMode::Quick => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Not guaranteed final; may repeat for the same utterance.
    Interim(String),
    /// Delivered at most once per utterance.
    Final(String),
    /// Server-side VAD detected the start of speech.
    SpeechStarted,
    /// The provider closed or errored; the call proceeds without STT.
    Closed,
}

pub struct SttSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    event_rx: mpsc::Receiver<SttEvent>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl SttSession {
    /// Forward inbound PCM to the current provider session.
    pub async fn send_audio(&self, pcm: Vec<u8>) {
        let _ = self.audio_tx.send(pcm).await;
    }

    /// Receive the next STT event, or `None` once the session has closed
    /// and the event channel has drained.
    pub async fn recv(&mut self) -> Option<SttEvent> {
        self.event_rx.recv().await
    }

    /// `true` once the provider has closed or errored (§4.4: "the call
    /// proceeds without STT").
    pub fn closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

#[derive(Deserialize)]
struct DeepgramEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    channel: Option<DeepgramChannel>,
    is_final: Option<bool>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Open a new streaming STT session at the given endpointing mode.
pub async fn spawn_stt_session(
    base_url: &str,
    api_key: &str,
    mode: SttMode,
    sample_rate: u32
) -> anyhow::Result<SttSession> {
    let ws_url = format!(
        "{base_url}?encoding=linear16&sample_rate={sample_rate}&endpointing={}&interim_results=true",
        mode.endpointing_ms()
    );

    let request = tungstenite::http::Request
        ::builder()
        .uri(&ws_url)
        .header("Authorization", format!("Token {api_key}"))
        .header("Host", url::Url::parse(base_url)?.host_str().unwrap_or("").to_string())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", tungstenite::handshake::client::generate_key())
        .body(())?;

    let (ws_stream, response) = tokio_tungstenite
        ::connect_async(request).await
        .map_err(|e| anyhow::anyhow!("failed to connect to STT provider: {e}"))?;

    info!(status = %response.status(), mode = ?mode, "stt session connected");

    let (mut ws_sink, mut ws_reader) = ws_stream.split();
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(256);
    let (event_tx, event_rx) = mpsc::channel::<SttEvent>(64);
    let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    let writer_handle = tokio::spawn(async move {
        while let Some(pcm) = audio_rx.recv().await {
            if let Err(e) = ws_sink.send(tungstenite::Message::Binary(pcm)).await {
                error!(error = %e, "stt writer send error");
                break;
            }
        }
        let _ = ws_sink.send(tungstenite::Message::Text(r#"{"type":"CloseStream"}"#.to_string())).await;
    });

    let closed_reader = closed.clone();
    let reader_handle = tokio::spawn(async move {
        while let Some(msg_result) = ws_reader.next().await {
            let msg = match msg_result {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "stt reader error, session closing");
                    break;
                }
            };

            let text = match msg {
                tungstenite::Message::Text(t) => t,
                tungstenite::Message::Close(frame) => {
                    info!(frame = ?frame, "stt provider closed session");
                    break;
                }
                _ => {
                    continue;
                }
            };

            let Ok(raw): Result<Value, _> = serde_json::from_str(&text) else {
                warn!("unparseable stt event, dropping");
                continue;
            };

            if raw.get("type").and_then(Value::as_str) == Some("SpeechStarted") {
                let _ = event_tx.send(SttEvent::SpeechStarted).await;
                continue;
            }

            let event: DeepgramEvent = match serde_json::from_value(raw) {
                Ok(e) => e,
                Err(_) => {
                    continue;
                }
            };

            if event.kind.as_deref() == Some("SpeechStarted") {
                let _ = event_tx.send(SttEvent::SpeechStarted).await;
                continue;
            }

            let Some(channel) = event.channel else {
                continue;
            };
            let Some(transcript) = channel.alternatives.into_iter().next() else {
                continue;
            };
            if transcript.transcript.is_empty() {
                continue;
            }

            debug!(text = %transcript.transcript, is_final = ?event.is_final, "stt transcript");

            let out = if event.is_final.unwrap_or(false) {
                SttEvent::Final(transcript.transcript)
            } else {
                SttEvent::Interim(transcript.transcript)
            };
            if event_tx.send(out).await.is_err() {
                break;
            }
        }
        closed_reader.store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = event_tx.send(SttEvent::Closed).await;
    });

    Ok(SttSession { audio_tx, event_rx, reader_handle, writer_handle, closed })
}

/// base64-encode a PCM chunk for providers that want audio inline in a
/// text frame rather than as a binary frame (kept for providers that
/// require it; the default path above sends binary frames directly).
pub fn encode_audio_b64(pcm: &[u8]) -> String {
    BASE64.encode(pcm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpointing_ms_by_mode() {
        assert_eq!(SttMode::Open.endpointing_ms(), 1200);
        assert_eq!(SttMode::YesNo.endpointing_ms(), 500);
        assert_eq!(SttMode::Quick.endpointing_ms(), 500);
    }

    #[test]
    fn test_deepgram_event_parses_final_transcript() {
        let raw =
            r#"{"is_final":true,"channel":{"alternatives":[{"transcript":"bonjour"}]}}"#;
        let event: DeepgramEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.is_final, Some(true));
        assert_eq!(event.channel.unwrap().alternatives[0].transcript, "bonjour");
    }

    #[test]
    fn test_empty_transcript_is_ignored_by_convention() {
        let raw = r#"{"is_final":false,"channel":{"alternatives":[{"transcript":""}]}}"#;
        let event: DeepgramEvent = serde_json::from_str(raw).unwrap();
        assert!(event.channel.unwrap().alternatives[0].transcript.is_empty());
    }

    #[test]
    fn test_encode_audio_b64_roundtrip() {
        let pcm = vec![1, 2, 3, 4];
        let encoded = encode_audio_b64(&pcm);
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, pcm);
    }
}
