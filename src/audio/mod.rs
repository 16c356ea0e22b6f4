//! # Audio Module
//!
//! Everything between the sound devices and the transport.
//!
//! ## Key Components:
//! - **codec**: `f32` samples ⇄ 16-bit little-endian PCM
//! - **capture**: frame slicing, the drop-not-queue mailbox and gated forwarding
//! - **scheduler**: gap-free playback scheduling and the active-segment set
//! - **analyser**: spectrum snapshots for the visualizer
//! - **device**: microphone and speaker backends
//!
//! ## Audio Formats:
//! - **Capture**: 16 kHz, mono, 16-bit PCM, 4096-sample frames
//! - **Playback**: 24 kHz, mono, 16-bit PCM from the endpoint

pub mod analyser;
pub mod capture;
pub mod codec;
pub mod device;
pub mod scheduler;
