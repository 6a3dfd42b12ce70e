//! Speech provider clients.
//!
//! - [`TtsClient`]: per-request WebSocket synthesis — one connection per
//!   utterance, a JSON request frame out, a status frame and binary
//!   audio chunks back.
//! - [`EchoClient`]: one persistent WebSocket to the STT provider —
//!   binary audio chunks out, JSON transcription frames in.

mod echo;
mod tts;

pub use echo::{parse_transcription, EchoClient, Transcription};
pub use tts::{TtsClient, TtsRequest};
