//! wren-ai: Provider stream normalization layer
//!
//! This crate defines the uniform part vocabulary for streamed model output
//! and the wire adapters that translate provider-specific streaming responses
//! into it.

pub mod error;
pub mod part;
pub mod providers;
pub mod types;

pub use error::{Error, Result};
pub use part::{Part, PartStream};
pub use providers::Provider;
pub use types::*;
