//! The completion capability: the only way the engine talks to a language model.
//!
//! Everything that samples, critiques or summarizes is generic over
//! [`Completion`], so the HTTP client, test doubles and any other backend are
//! interchangeable.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(
        prompt: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            temperature,
            max_tokens,
            timeout,
        }
    }
}

/// Failure of the external completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion transport error: {0}")]
    Transport(String),
}

/// Something that turns a prompt into text.
pub trait Completion: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send;
}
