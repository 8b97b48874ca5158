//! Keyword-based intent classification
//!
//! Used when no classifier service is configured. Scores each intent by
//! keyword hits; ties and empty scores fall to `chat` with low confidence,
//! which the router treats as the safe default.

use super::{Classification, Classifier, GenerationError};
use crate::router::Intent;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

// Keyword sets
static SEARCH_KEYWORDS: &[&str] = &[
    "search", "look up", "lookup", "google", "find online", "latest", "news",
    "weather", "price of", "current", "today", "score", "stock",
];

static TASK_KEYWORDS: &[&str] = &[
    "remind", "schedule", "calendar", "todo", "to-do", "timer", "alarm",
    "convert", "calculate", "summarize", "translate", "what time", "date",
];

static ACTION_KEYWORDS: &[&str] = &[
    "run", "execute", "restart", "deploy", "create", "delete", "send",
    "open", "start", "stop", "install", "check disk", "backup",
];

static KNOWLEDGE_KEYWORDS: &[&str] = &[
    "what is", "what are", "who is", "explain", "define", "meaning",
    "how does", "why does", "difference between", "tell me about",
    "remember", "my notes", "did i",
];

static CHAT_KEYWORDS: &[&str] = &[
    "hello", "hi ", "hey", "thanks", "thank you", "good morning",
    "how are you", "lol", "nice",
];

static EXPLICIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*/(search|task|action|knowledge|chat)\b").expect("valid intent pattern"));

#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous scoring, exposed for fallbacks that cannot await
    pub fn score(&self, text: &str) -> Classification {
        if let Some(caps) = EXPLICIT_PATTERN.captures(text) {
            if let Ok(intent) = caps[1].parse::<Intent>() {
                return Classification {
                    intent,
                    confidence: 1.0,
                };
            }
        }

        let lower = format!("{} ", text.to_lowercase());
        let hits = |keywords: &[&str]| keywords.iter().filter(|kw| lower.contains(*kw)).count();

        let scores = [
            (Intent::Search, hits(SEARCH_KEYWORDS)),
            (Intent::Task, hits(TASK_KEYWORDS)),
            (Intent::Action, hits(ACTION_KEYWORDS)),
            (Intent::Knowledge, hits(KNOWLEDGE_KEYWORDS)),
            (Intent::Chat, hits(CHAT_KEYWORDS)),
        ];

        let total: usize = scores.iter().map(|(_, s)| s).sum();
        let (best, best_score) = scores
            .iter()
            .copied()
            .max_by_key(|(_, s)| *s)
            .unwrap_or((Intent::Chat, 0));
        let tied = scores.iter().filter(|(_, s)| *s == best_score).count() > 1;

        let result = if best_score == 0 || tied {
            Classification {
                intent: Intent::Chat,
                confidence: 0.2,
            }
        } else {
            Classification {
                intent: best,
                confidence: (0.5 + 0.5 * best_score as f32 / total as f32).min(0.95),
            }
        };

        debug!(intent = result.intent.as_str(), confidence = result.confidence, "Keyword classification");
        result
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, GenerationError> {
        Ok(self.score(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_intents() {
        let classifier = KeywordClassifier::new();
        assert_eq!(classifier.score("what's the weather in Berlin").intent, Intent::Search);
        assert_eq!(classifier.score("remind me to call mom").intent, Intent::Task);
        assert_eq!(classifier.score("restart the nginx service").intent, Intent::Action);
        assert_eq!(classifier.score("explain how a heat pump works").intent, Intent::Knowledge);
        assert_eq!(classifier.score("hey, thanks!").intent, Intent::Chat);
    }

    #[test]
    fn test_explicit_prefix() {
        let result = KeywordClassifier::new().score("/action do the thing");
        assert_eq!(result.intent, Intent::Action);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_no_signal_is_low_confidence_chat() {
        let result = KeywordClassifier::new().score("purple elephants");
        assert_eq!(result.intent, Intent::Chat);
        assert!(result.confidence < 0.3);
    }
}
