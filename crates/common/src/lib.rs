//! Shared types for the Gemini relay workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
