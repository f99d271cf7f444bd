//! Keyword rules that classify a bounce as hard, soft or unknown.
//!
//! Rules are evaluated in fixed priority order and the first match wins:
//! - permanence keywords → `Hard`
//! - transience keywords → `Soft`
//! - nothing matched     → `Unknown` (retried like `Soft`)
//!
//! Matching is a case-insensitive substring test against the body text and
//! subject. Delivery-status codes are not parsed, so wording outside these
//! lists falls through to `Unknown`.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{BounceType, RawMessage};

/// Wording that marks a failure as permanent.
pub const HARD_BOUNCE_KEYWORDS: &[&str] = &[
    "does not exist",
    "unknown user",
    "invalid address",
    "no such user",
    "user unknown",
    "rejected",
    "permanent",
    "mailbox not found",
    "address rejected",
];

/// Wording that marks a failure as transient.
pub const SOFT_BOUNCE_KEYWORDS: &[&str] = &[
    "temporarily",
    "try again",
    "quota",
    "mailbox full",
    "too many",
    "rate limit",
    "deferred",
    "retry",
];

/// A single classification rule: a keyword set and the label it assigns.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    /// Which label a match produces.
    pub label: BounceType,
    /// Keywords as configured. An empty set never matches.
    pub keywords: Vec<String>,
    /// Alternation of the escaped keywords.
    regex: Regex,
}

impl ClassifierRule {
    pub fn new(label: BounceType, keywords: &[&str]) -> Result<Self, regex::Error> {
        let alternation = keywords
            .iter()
            .map(|k| regex::escape(&k.to_lowercase()))
            .collect::<Vec<_>>()
            .join("|");
        Ok(Self {
            label,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            regex: Regex::new(&alternation)?,
        })
    }

    /// Whether any keyword occurs in already-lowercased `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.matched_keyword(text).is_some()
    }

    /// The first keyword occurrence in `text`, if any.
    pub fn matched_keyword<'t>(&self, text: &'t str) -> Option<&'t str> {
        if self.keywords.is_empty() {
            return None;
        }
        self.regex.find(text).map(|m| m.as_str())
    }
}

/// Ordered rule list; the first rule that matches decides the type.
#[derive(Debug, Clone)]
pub struct BounceClassifier {
    rules: Vec<ClassifierRule>,
}

impl BounceClassifier {
    /// Hard rule first, then soft.
    pub fn default_rules() -> Self {
        Self::from_rules(vec![
            ClassifierRule::new(BounceType::Hard, HARD_BOUNCE_KEYWORDS)
                .expect("escaped keywords always compile"),
            ClassifierRule::new(BounceType::Soft, SOFT_BOUNCE_KEYWORDS)
                .expect("escaped keywords always compile"),
        ])
    }

    pub fn from_rules(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    /// Classify a fetched message.
    pub fn classify(&self, message: &RawMessage) -> BounceType {
        self.classify_text(&message.classification_text())
    }

    /// Classify lowercased subject + body text.
    pub fn classify_text(&self, text: &str) -> BounceType {
        for rule in &self.rules {
            if let Some(keyword) = rule.matched_keyword(text) {
                debug!(label = rule.label.label(), keyword, "Bounce rule matched");
                return rule.label;
            }
        }
        BounceType::Unknown
    }

    /// Permanence test on its own.
    pub fn is_hard(&self, text: &str) -> bool {
        self.rule_matches(BounceType::Hard, text)
    }

    /// Transience test on its own.
    pub fn is_soft(&self, text: &str) -> bool {
        self.rule_matches(BounceType::Soft, text)
    }

    fn rule_matches(&self, label: BounceType, text: &str) -> bool {
        self.rules
            .iter()
            .filter(|r| r.label == label)
            .any(|r| r.matches(text))
    }
}

impl Default for BounceClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}
