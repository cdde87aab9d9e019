//! Condensing information for a purpose.

use crate::extract::tags;
use crate::llm::{LanguageModel, LlmError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Shrinks `information` to what matters for `context`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, context: &str, information: &str) -> Result<String, LlmError>;
}

#[async_trait]
impl<S: Summarizer + ?Sized> Summarizer for Arc<S> {
    async fn summarize(&self, context: &str, information: &str) -> Result<String, LlmError> {
        (**self).summarize(context, information).await
    }
}

/// Summarizer backed by a language model.
///
/// A reply without a `<Summary>` tag falls back to the unmodified
/// information so nothing is lost.
pub struct LlmSummarizer {
    model: Arc<dyn LanguageModel>,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn prompt(context: &str, information: &str) -> String {
        format!(
            "You condense information for characters in a simulation.\n\
             \n\
             Read what the information is needed for, then summarize the information \
             below. Keep every detail that matters for that purpose and drop the rest.\n\
             Reply with the summary only, wrapped as <Summary>...</Summary>.\n\
             \n\
             Purpose:\n{context}\n\
             \n\
             Information:\n{information}\n"
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, context: &str, information: &str) -> Result<String, LlmError> {
        let reply = self
            .model
            .complete(&Self::prompt(context, information))
            .await?;
        match tags::SUMMARY.find(&reply) {
            Ok(summary) if !summary.is_empty() => Ok(summary),
            Ok(_) => Ok(information.to_string()),
            Err(err) => {
                warn!(error = %err, raw = %err.raw(), "Summary did not parse, keeping raw information");
                Ok(information.to_string())
            }
        }
    }
}
