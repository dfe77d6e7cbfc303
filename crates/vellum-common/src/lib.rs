//! VellumDB common types, errors, and wire primitives.
//!
//! This crate provides shared definitions used across all VellumDB
//! components: the error type, the self-delimited item codec every page
//! format is built from, and the block-store option surface.

pub mod codec;
pub mod error;
pub mod options;

pub use error::{Result, VellumError};
pub use options::{StoreOptions, DEFAULT_PAGE_SIZE};
