// SPDX-License-Identifier: Apache-2.0

//! Measure and sign SGX enclave images.
//!
//! The pipeline mirrors what the hardware does when the enclave loads:
//! [`elf`] validates and indexes the shared object, [`layout`] synthesizes
//! the in-memory layout, [`measure`] replays the architectural
//! page-measurement algorithm, [`key`] and [`css`] produce the signature
//! container and [`metadata`] assembles the block written back into the
//! image. [`pipeline`] strings the stages together for one invocation.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod arch;
pub mod config;
pub mod css;
pub mod elf;
pub mod error;
pub mod key;
pub mod layout;
pub mod measure;
pub mod metadata;
pub mod pipeline;

pub use error::{Error, Result};
