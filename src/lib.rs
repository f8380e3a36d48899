//! Conditional video GAN building blocks on top of tch.
//!
//! - [`generator::ClipGenerator`]: latent + class label -> clip `[nc, T, 96, 96]`
//! - [`discriminator::FrameDiscriminator`]: frame -> realism score
//! - [`discriminator::ClipDiscriminator`]: clip + class label -> realism score
//! - [`sequencer::FrameSequencer`]: recurrent roll-out of per-frame latents
//! - [`dataset::LabeledVideoDataset`]: `(clip, label)` pairs read lazily from disk

mod check;
pub mod config;
pub mod dataset;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod parallel;
pub mod sequencer;
pub mod video;

pub use error::{Error, Result};
