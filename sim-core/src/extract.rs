//! Structured extraction from language model replies.
//!
//! Replies carry their payload inside XML-ish tags (`<Object>3</Object>`).
//! Extraction is case-insensitive, tolerates whitespace inside the brackets
//! and keeps newlines in the body. Free-text answers are mapped back onto a
//! known vocabulary with [`closest_match`].

use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

/// Default cutoff for [`closest_match`].
pub const DEFAULT_MATCH_CUTOFF: f64 = 0.6;

lazy_static! {
    static ref INTEGER: Regex = Regex::new(r"-?\d+").expect("integer pattern compiles");
}

/// A reply that could not be parsed. Always carries the raw reply text.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("reply has no <{tag}> tag")]
    MissingTag { tag: String, raw: String },

    #[error("<{tag}> does not contain an integer")]
    NotAnInteger { tag: String, raw: String },

    #[error("'{value}' matches no known choice")]
    NoMatch { value: String, raw: String },
}

impl ParseError {
    /// The reply text that failed to parse.
    pub fn raw(&self) -> &str {
        match self {
            ParseError::MissingTag { raw, .. }
            | ParseError::NotAnInteger { raw, .. }
            | ParseError::NoMatch { raw, .. } => raw,
        }
    }
}

/// Errors that may wrap a [`ParseError`].
///
/// Lets [`with_parse_retries`] tell a retryable parse failure apart from a
/// transport failure that should surface immediately.
pub trait ParseFailure {
    fn is_parse_failure(&self) -> bool;
}

impl ParseFailure for ParseError {
    fn is_parse_failure(&self) -> bool {
        true
    }
}

/// A compiled `<Tag>...</Tag>` matcher.
#[derive(Debug, Clone)]
pub struct TagPattern {
    tag: String,
    regex: Regex,
}

impl TagPattern {
    pub fn new(tag: &str) -> Result<Self, regex::Error> {
        let escaped = regex::escape(tag);
        let regex = Regex::new(&format!(
            r"(?is)<\s*{escaped}\s*>(.*?)<\s*/\s*{escaped}\s*>"
        ))?;
        Ok(Self {
            tag: tag.to_string(),
            regex,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Body of the first occurrence of the tag, trimmed.
    pub fn find(&self, raw: &str) -> Result<String, ParseError> {
        self.regex
            .captures(raw)
            .and_then(|captures| captures.get(1))
            .map(|body| body.as_str().trim().to_string())
            .ok_or_else(|| ParseError::MissingTag {
                tag: self.tag.clone(),
                raw: raw.to_string(),
            })
    }

    /// Bodies of every occurrence of the tag, trimmed.
    pub fn find_all(&self, raw: &str) -> Vec<String> {
        self.regex
            .captures_iter(raw)
            .filter_map(|captures| captures.get(1))
            .map(|body| body.as_str().trim().to_string())
            .collect()
    }

    /// First integer inside the tag.
    pub fn find_integer(&self, raw: &str) -> Result<i64, ParseError> {
        let body = self.find(raw)?;
        INTEGER
            .find(&body)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| ParseError::NotAnInteger {
                tag: self.tag.clone(),
                raw: raw.to_string(),
            })
    }
}

/// Compiled patterns for every tag the engine reads.
pub mod tags {
    use super::TagPattern;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref ACTION: TagPattern = compile("Action");
        pub static ref CHARACTER: TagPattern = compile("Character");
        pub static ref CONTENT: TagPattern = compile("Content");
        pub static ref DESTROY: TagPattern = compile("Destroy");
        pub static ref IMPORTANCE: TagPattern = compile("Importance");
        pub static ref INFORMATION: TagPattern = compile("Information");
        pub static ref OBJECT: TagPattern = compile("Object");
        pub static ref OUTCOME: TagPattern = compile("Outcome");
        pub static ref SPEECH: TagPattern = compile("Speech");
        pub static ref SUMMARY: TagPattern = compile("Summary");
        pub static ref TITLE: TagPattern = compile("Title");
    }

    fn compile(tag: &str) -> TagPattern {
        TagPattern::new(tag).expect("tag pattern compiles")
    }
}

/// Normalized similarity of two strings in `[0, 1]`.
///
/// `2 * M / (|a| + |b|)` over case-folded characters, where `M` is the length
/// of the longest common subsequence. Two empty strings are identical.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    // Two-row LCS table.
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            current[j + 1] = if ca == cb {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    let matched = previous[b.len()];

    (2 * matched) as f64 / total as f64
}

/// Pick the vocabulary entry closest to `candidate`.
///
/// The highest [`similarity_ratio`] wins; ties go to the earlier entry.
/// Returns `None` when nothing reaches `cutoff`.
pub fn closest_match<'a, S: AsRef<str>>(
    candidate: &str,
    vocabulary: &'a [S],
    cutoff: f64,
) -> Option<&'a S> {
    let candidate = candidate.trim();
    let mut best: Option<(&'a S, f64)> = None;
    for entry in vocabulary {
        let ratio = similarity_ratio(candidate, entry.as_ref());
        if ratio < cutoff {
            continue;
        }
        match best {
            Some((_, best_ratio)) if best_ratio >= ratio => {}
            _ => best = Some((entry, ratio)),
        }
    }
    best.map(|(entry, _)| entry)
}

/// Run a fallible generation, retrying parse failures up to `retries` times.
///
/// Non-parse errors are returned immediately. After the last attempt the
/// final parse error is surfaced unchanged.
pub async fn with_parse_retries<T, E, F, Fut>(retries: usize, mut attempt: F) -> Result<T, E>
where
    E: ParseFailure + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_parse_failure() && tries < retries => {
                tries += 1;
                warn!(attempt = tries, error = %err, "Reply did not parse, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}
