//! Local media
//!
//! Microphone acquisition, mute and release for the local participant.

pub mod local;

pub use local::{
    LocalAudioStream, LocalAudioTrack, LocalMediaController, MicrophoneProvider, OpusMicrophone,
};
