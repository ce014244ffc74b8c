//! # Audio Processing Module
//!
//! Sample-level building blocks of a voice session. Nothing in here knows about
//! sockets or session state.
//!
//! ## Key Components:
//! - **FrameCodec**: PCM16 little-endian + base64 wire frames
//! - **TimelineMixer**: sample-accurate output timeline rendered by device sinks
//! - **PlaybackScheduler**: gapless placement of decoded frames, flush on barge-in
//! - **CaptureEncoder**: fixed-size chunking of microphone input into wire frames
//!
//! ## Audio Format:
//! - **Capture**: 16 kHz mono, sent upstream
//! - **Playback**: 24 kHz mono, received from the agent
//! - **Encoding**: 16-bit signed little-endian integers

pub mod capture; // Microphone chunking and encoding
pub mod codec; // Wire frame conversion
pub mod playback; // Output timeline ownership
pub mod timeline; // Mixer behind device sinks
