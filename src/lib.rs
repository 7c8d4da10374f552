//! Image context proxy for voice conversations
//!
//! Holds images uploaded out-of-band for a voice session and injects them,
//! once, into the chat completions the voice platform forwards to a
//! vision-capable model, relaying streamed answers in the OpenAI wire shape.

pub mod ai;
pub mod api;
pub mod app;
pub mod blob;
pub mod error;
pub mod image;
pub mod models;
pub mod prompts;
pub mod proxy;
pub mod session;

pub use error::{Error, Result, UpstreamError, ValidationError};
