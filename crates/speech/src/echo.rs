//! Persistent WebSocket client for the Echo STT provider.
//!
//! Outbound: binary audio chunks forwarded from gateway clients.
//! Inbound: JSON text frames `{type: "interim"|"final", text, client_id?}`
//! delivered to the consumer through a channel.

use futures_util::{SinkExt, StreamExt};
use lily_core::error::SpeechError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// One decoded transcription frame from Echo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Transcription {
    pub fn is_final(&self) -> bool {
        self.kind == "final"
    }
}

/// Parse a text frame into a transcription; frames without both `type`
/// and `text` are not transcriptions and yield `None`.
pub fn parse_transcription(payload: &str) -> Option<Transcription> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    if value.get("type").is_none() || value.get("text").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

struct EchoShared {
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    connected: AtomicBool,
}

/// Persistent Echo connection with split read/write tasks.
pub struct EchoClient {
    shared: Arc<EchoShared>,
}

impl EchoClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EchoShared {
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Connect and spawn the read/write loops.
    ///
    /// Returns the receiver of decoded transcriptions; the channel closes
    /// when the provider drops the connection.
    pub async fn connect(&self, url: &str) -> Result<mpsc::Receiver<Transcription>, SpeechError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SpeechError::ConnectionFailed(e.to_string()))?;
        info!(url = %url, "Connected to Echo");

        let (mut write, mut read) = stream.split();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (transcription_tx, transcription_rx) = mpsc::channel::<Transcription>(64);

        *self.shared.outbound.lock().await = Some(audio_tx);
        self.shared.connected.store(true, Ordering::SeqCst);

        // Writer: pump audio chunks out as binary frames
        let writer_shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if let Err(e) = write.send(Message::Binary(chunk.into())).await {
                    warn!(error = %e, "Echo send failed");
                    break;
                }
            }
            writer_shared.connected.store(false, Ordering::SeqCst);
        });

        // Reader: decode transcription frames
        let reader_shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(transcription) = parse_transcription(text.as_str()) {
                            debug!(kind = %transcription.kind, "Transcription received");
                            if transcription_tx.send(transcription).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Echo read failed");
                        break;
                    }
                }
            }
            info!("Echo connection closed");
            reader_shared.connected.store(false, Ordering::SeqCst);
            *reader_shared.outbound.lock().await = None;
        });

        Ok(transcription_rx)
    }

    /// Forward one audio chunk to Echo.
    pub async fn send_audio(&self, data: Vec<u8>) -> Result<(), SpeechError> {
        let guard = self.shared.outbound.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(SpeechError::NotConnected);
        };
        tx.send(data).await.map_err(|_| SpeechError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Drop the outbound channel; the writer task exits and the
    /// connection winds down.
    pub async fn disconnect(&self) {
        *self.shared.outbound.lock().await = None;
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn parse_valid_transcription() {
        let t = parse_transcription(r#"{"type":"final","text":"hello","client_id":"u1"}"#)
            .unwrap();
        assert!(t.is_final());
        assert_eq!(t.text, "hello");
        assert_eq!(t.client_id.as_deref(), Some("u1"));
    }

    #[test]
    fn parse_interim_without_client_id() {
        let t = parse_transcription(r#"{"type":"interim","text":"hel"}"#).unwrap();
        assert!(!t.is_final());
        assert!(t.client_id.is_none());
    }

    #[test]
    fn parse_rejects_non_transcription_frames() {
        assert!(parse_transcription(r#"{"status":"ok"}"#).is_none());
        assert!(parse_transcription("not json").is_none());
        assert!(parse_transcription(r#"{"type":"final"}"#).is_none());
    }

    #[test]
    fn transcription_roundtrip_omits_empty_client_id() {
        let t = Transcription {
            kind: "interim".into(),
            text: "partial".into(),
            client_id: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("client_id"));
        assert_eq!(parse_transcription(&json).unwrap(), t);
    }

    #[tokio::test]
    async fn audio_out_transcription_in() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Expect one binary chunk, answer with a final transcription
            let frame = ws.next().await.unwrap().unwrap();
            match frame {
                Message::Binary(data) => assert_eq!(&data[..], &[9u8, 9, 9]),
                other => panic!("Expected binary frame, got {other:?}"),
            }
            ws.send(Message::Text(
                r#"{"type":"final","text":"nine nine nine"}"#.into(),
            ))
            .await
            .unwrap();
            let _ = ws.send(Message::Close(None)).await;
        });

        let client = EchoClient::new();
        let mut transcriptions = client.connect(&format!("ws://{addr}")).await.unwrap();
        assert!(client.is_connected());

        client.send_audio(vec![9, 9, 9]).await.unwrap();
        let t = transcriptions.recv().await.unwrap();
        assert_eq!(t.text, "nine nine nine");
        assert!(t.is_final());
    }

    #[tokio::test]
    async fn send_audio_without_connection_fails() {
        let client = EchoClient::new();
        let err = client.send_audio(vec![1]).await.unwrap_err();
        assert!(matches!(err, SpeechError::NotConnected));
    }
}
