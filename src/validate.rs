//! Query input validation.
//!
//! Format and spam checks only; semantic content is never inspected.
//! Normalization strips control characters (whitespace controls become
//! spaces), collapses whitespace runs and trims the ends.

use crate::config::ValidationConfig;
use crate::error::ValidationError;

/// Normalizes `raw` and checks it against the configured bounds.
pub fn validate_query(raw: &str, rules: &ValidationConfig) -> Result<String, ValidationError> {
    let normalized = normalize(raw);

    if normalized.is_empty() {
        return Err(ValidationError::Empty);
    }

    let len = normalized.chars().count();
    if len < rules.min_len {
        return Err(ValidationError::TooShort { min: rules.min_len });
    }
    if len > rules.max_len {
        return Err(ValidationError::TooLong { max: rules.max_len });
    }

    if longest_run(&normalized) > rules.max_char_run {
        return Err(ValidationError::RepeatedCharacters {
            max: rules.max_char_run,
        });
    }

    if punctuation_ratio(&normalized) > rules.max_punctuation_ratio {
        return Err(ValidationError::ExcessivePunctuation);
    }

    Ok(normalized)
}

pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some(' ')
            } else if c.is_control() {
                None
            } else {
                Some(c)
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Length of the longest run of one repeated non-space character.
fn longest_run(s: &str) -> usize {
    let mut best = 0;
    let mut run = 0;
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if c != ' ' && Some(c) == prev {
            run += 1;
        } else {
            run = 1;
        }
        if c != ' ' {
            best = best.max(run);
        }
        prev = Some(c);
    }
    best
}

fn punctuation_ratio(s: &str) -> f32 {
    let mut total = 0usize;
    let mut punct = 0usize;
    for c in s.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if c.is_ascii_punctuation() {
            punct += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    punct as f32 / total as f32
}
