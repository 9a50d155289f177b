//! Hint-request classifier: a substring match over a multilingual keyword
//! list. A known weak point — kept as a replaceable collaborator behind a
//! `HintRequestClassifier` capability so it can be swapped for something
//! smarter later.

use tutor_config::HintConfig;

pub trait HintRequestClassifier: Send + Sync {
    fn is_hint_request(&self, text: &str) -> bool;
}

/// Default, dependency-free classifier: lowercases the input and checks for
/// any configured keyword as a substring.
pub struct KeywordHintClassifier {
    keywords: Vec<String>,
}

impl KeywordHintClassifier {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &HintConfig) -> Self {
        Self::new(config.request_keywords.clone())
    }
}

impl HintRequestClassifier for KeywordHintClassifier {
    fn is_hint_request(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.keywords.iter().any(|keyword| lowered.contains(keyword.as_str()))
    }
}
