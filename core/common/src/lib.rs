//! Common types shared by the CloudStash storage crates.
//!
//! This module provides the error taxonomy every provider reports through,
//! the provider identity tag, and the validated remote object key type.

pub mod error;
pub mod types;

pub use error::{ErrorKind, ErrorResponse, KeyError, Result, StorageError};
pub use types::{ObjectKey, Provider, Secret};
