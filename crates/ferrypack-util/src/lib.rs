#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for ferrypack.
//!
//! Pure helpers with no logging/tracing dependencies: the output writer used
//! by the bundle emitter and the content hashing used for change detection.

pub mod fs;
pub mod hash;
