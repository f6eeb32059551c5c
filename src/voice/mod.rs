//! Speech in and speech out
//!
//! Recognition and synthesis clients for the streaming speech backend, plus
//! the reply path that turns a token stream into ordered audio.

mod asr;
mod playback;
mod segmenter;
mod speaker;
mod tts;
mod wav;

pub use asr::{AsrClient, Recognizer, audio_frame, handshake_frame, terminal_frame};
pub use playback::{AudioSink, PlaybackPipeline, PlaybackReport};
pub use segmenter::{SegmentSplitter, TextSegment};
pub use speaker::ReplySpeaker;
pub use tts::{SynthesisStatus, Synthesizer, TtsClient};
pub use wav::{pcm_to_wav, read_wav, write_wav};
