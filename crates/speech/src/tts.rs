//! Per-request TTS synthesis over WebSocket.
//!
//! Protocol: connect, send one JSON text frame, then read. The provider
//! answers with a `{status: ...}` text frame; on success, zero or more
//! binary frames follow and the close frame terminates the audio. An
//! immediate close counts as failure. Intermediate ping/pong frames are
//! tolerated up to a ceiling before the exchange is considered hung.

use futures_util::{SinkExt, StreamExt};
use lily_core::error::SpeechError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Attempts per synthesis before giving up.
const MAX_ATTEMPTS: u32 = 3;
/// Pause between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Ping/pong frames tolerated within one synthesis before treating the
/// exchange as hung.
const PING_CEILING: u32 = 10;

/// One synthesis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub speaker: i32,
    pub sample_rate: u32,
    pub model: String,
    pub lang: String,
}

impl TtsRequest {
    /// A request with the provider defaults for everything but the text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            speaker: 0,
            sample_rate: 24000,
            model: "edge".into(),
            lang: "en-US".into(),
        }
    }
}

#[derive(Deserialize)]
struct StatusFrame {
    status: String,
    #[serde(default)]
    message: String,
}

/// WebSocket TTS client; connections are per-request.
pub struct TtsClient;

impl TtsClient {
    pub fn new() -> Self {
        Self
    }

    /// Synthesize audio for a request, retrying with backoff.
    ///
    /// Always closes and re-opens the connection between attempts.
    pub async fn synthesize(
        &self,
        url: &str,
        request: &TtsRequest,
    ) -> Result<Vec<u8>, SpeechError> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(url, request).await {
                Ok(audio) => {
                    debug!(attempt, bytes = audio.len(), "Synthesis succeeded");
                    return Ok(audio);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Synthesis attempt failed");
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(SpeechError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    async fn attempt(&self, url: &str, request: &TtsRequest) -> Result<Vec<u8>, SpeechError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SpeechError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let payload = serde_json::to_string(request)
            .map_err(|e| SpeechError::ProviderFailure(e.to_string()))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| SpeechError::ConnectionFailed(e.to_string()))?;

        let mut audio: Vec<u8> = Vec::new();
        let mut accepted = false;
        let mut ping_count = 0u32;

        while let Some(frame) = read.next().await {
            let frame = frame.map_err(|e| SpeechError::ConnectionFailed(e.to_string()))?;
            match frame {
                Message::Text(text) => {
                    if let Ok(status) = serde_json::from_str::<StatusFrame>(text.as_str()) {
                        if status.status == "success" {
                            accepted = true;
                        } else {
                            return Err(SpeechError::ProviderFailure(if status.message.is_empty() {
                                status.status
                            } else {
                                status.message
                            }));
                        }
                    }
                    // Other text frames (stream markers) are ignored
                }
                Message::Binary(chunk) => {
                    audio.extend_from_slice(&chunk);
                }
                Message::Ping(_) | Message::Pong(_) => {
                    ping_count += 1;
                    if ping_count > PING_CEILING {
                        return Err(SpeechError::ProviderFailure(
                            "synthesis hung: ping ceiling exceeded".into(),
                        ));
                    }
                }
                Message::Close(_) => break,
                Message::Frame(_) => {}
            }
        }

        if !accepted {
            return Err(SpeechError::EmptyStream);
        }
        Ok(audio)
    }
}

impl Default for TtsClient {
    fn default() -> Self {
        Self::new()
    }
}
