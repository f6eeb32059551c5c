//! Parley Gateway - real-time voice assistant gateway
//!
//! Bridges a browser client to streaming speech recognition, a reasoning
//! backend and streaming speech synthesis:
//! - Binary frame codec for the speech backend protocols
//! - Streaming recognition and synthesis clients
//! - Reply segmentation and ordered, interruptible playback
//! - Per-session turn control with barge-in
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Browser client                       │
//! │   mic PCM16 ──►  JSON commands  ◄── events + PCM16   │
//! └─────────────────────────┬────────────────────────────┘
//!                           │ /ws
//! ┌─────────────────────────▼────────────────────────────┐
//! │                  Turn controller                      │
//! │   ASR client  │  reply source  │  speaker (split+TTS) │
//! └─────────────────────────┬────────────────────────────┘
//!                           │
//! ┌─────────────────────────▼────────────────────────────┐
//! │   Speech backend (binary WS)  │  Chat completions    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
