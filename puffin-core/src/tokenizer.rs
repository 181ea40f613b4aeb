//! Token counting and the pre-dispatch token budget guard.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{ConfigError, ConversationError};

/// Encoding used when none is configured.
pub const DEFAULT_ENCODING: &str = "cl100k_base";

/// A subword tokenizer. Only the length of its output matters to the guard.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<u32>;

    fn count(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }
}

/// BPE tokenizer backed by tiktoken-rs.
pub struct BpeTokenizer {
    name: String,
    bpe: tiktoken_rs::CoreBPE,
}

impl BpeTokenizer {
    /// Build a tokenizer from an encoding name (`cl100k_base`, `o200k_base`,
    /// `p50k_base`, `r50k_base`) or a model name tiktoken knows.
    pub fn for_encoding(name: &str) -> Result<Self, ConfigError> {
        let bpe = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base().map_err(|e| e.to_string()),
            "o200k_base" => tiktoken_rs::o200k_base().map_err(|e| e.to_string()),
            "p50k_base" => tiktoken_rs::p50k_base().map_err(|e| e.to_string()),
            "r50k_base" => tiktoken_rs::r50k_base().map_err(|e| e.to_string()),
            model => tiktoken_rs::get_bpe_from_model(model).map_err(|e| e.to_string()),
        }
        .map_err(|e| ConfigError::UnknownValue {
            kind: "tokenizer".to_string(),
            value: format!("{name} ({e})"),
        })?;
        Ok(Self {
            name: name.to_string(),
            bpe,
        })
    }

    /// The process-wide default tokenizer, built on first use and never mutated after.
    pub fn shared() -> Result<Arc<BpeTokenizer>, ConfigError> {
        static SHARED: OnceLock<Arc<BpeTokenizer>> = OnceLock::new();
        if let Some(tokenizer) = SHARED.get() {
            return Ok(Arc::clone(tokenizer));
        }
        let built = Arc::new(Self::for_encoding(DEFAULT_ENCODING)?);
        Ok(Arc::clone(SHARED.get_or_init(|| built)))
    }

    /// Resolve a configured name, reusing the shared instance for the default encoding.
    pub fn resolve(name: &str) -> Result<Arc<dyn Tokenizer>, ConfigError> {
        if name == DEFAULT_ENCODING {
            Ok(Self::shared()?)
        } else {
            Ok(Arc::new(Self::for_encoding(name)?))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Tokenizer for BpeTokenizer {
    fn tokenize(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }
}

/// A tokenizer that reports the same count for every input.
#[derive(Debug, Clone, Copy)]
pub struct FixedTokenizer(pub usize);

impl Tokenizer for FixedTokenizer {
    fn tokenize(&self, _text: &str) -> Vec<u32> {
        vec![0; self.0]
    }
}

/// Ceiling on the token count of an assembled prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenBudget(usize);

impl TokenBudget {
    pub const DEFAULT: TokenBudget = TokenBudget(3072);

    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::Invalid {
                message: "token budget must be greater than zero".to_string(),
            });
        }
        Ok(Self(limit))
    }

    pub fn limit(self) -> usize {
        self.0
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Refuses prompts whose token count reaches the budget.
#[derive(Clone)]
pub struct TokenGuard {
    tokenizer: Arc<dyn Tokenizer>,
    budget: TokenBudget,
}

impl TokenGuard {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, budget: TokenBudget) -> Self {
        Self { tokenizer, budget }
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    /// Count the prompt's tokens; `count >= budget` is rejected.
    pub fn check(&self, prompt: &str) -> Result<usize, ConversationError> {
        let used = self.tokenizer.count(prompt);
        let limit = self.budget.limit();
        debug!(used, limit, "Token guard check");
        if used >= limit {
            return Err(ConversationError::TooLong { used, limit });
        }
        Ok(used)
    }

    /// The error text written into the conversation when the guard trips.
    pub fn abort_message(&self) -> String {
        format!(
            "Conversation length too long. Please keep it under {} tokens.",
            self.budget.limit()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(count: usize, budget: usize) -> TokenGuard {
        TokenGuard::new(
            Arc::new(FixedTokenizer(count)),
            TokenBudget::new(budget).unwrap(),
        )
    }

    #[test]
    fn test_guard_boundary() {
        assert_eq!(guard(3071, 3072).check("x").unwrap(), 3071);
        assert!(matches!(
            guard(3072, 3072).check("x").unwrap_err(),
            ConversationError::TooLong {
                used: 3072,
                limit: 3072
            }
        ));
        assert!(guard(5000, 3072).check("x").is_err());
    }

    #[test]
    fn test_abort_message() {
        assert_eq!(
            guard(0, 1500).abort_message(),
            "Conversation length too long. Please keep it under 1500 tokens."
        );
    }

    #[test]
    fn test_zero_budget_rejected() {
        assert!(TokenBudget::new(0).is_err());
        assert_eq!(TokenBudget::default().limit(), 3072);
    }

    #[test]
    fn test_bpe_counts_tokens() {
        let tokenizer = BpeTokenizer::shared().unwrap();
        assert_eq!(tokenizer.count(""), 0);
        let n = tokenizer.count("def f(x): return x+1");
        assert!(n > 0 && n < 20, "unexpected token count {n}");
    }

    #[test]
    fn test_shared_is_memoized() {
        let a = BpeTokenizer::shared().unwrap();
        let b = BpeTokenizer::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(BpeTokenizer::for_encoding("not-a-real-encoding").is_err());
        assert_eq!(BpeTokenizer::for_encoding("p50k_base").unwrap().name(), "p50k_base");
    }
}
