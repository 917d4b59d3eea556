//! Prompt construction and reply cleanup.
//!
//! The system prompt is fixed. The user message enumerates the hydrated skill
//! records' narrative fields verbatim; fields that are absent are omitted,
//! never invented.

use crate::models::SkillRecord;

pub const SYSTEM_PROMPT: &str = "You answer recruiters' questions about one candidate's skills. \
Use only the facts in the provided skill records. Do not invent employers, numbers, or dates. \
Answer in two or three short sentences, third person, no lists, no greetings, no closing offers. \
If a record names a project, attribute its outcomes to that project rather than to the whole career.";

/// A built prompt ready for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(query: &str, records: &[SkillRecord], project: Option<&str>) -> Prompt {
    let mut context = String::new();
    for (i, r) in records.iter().enumerate() {
        context.push_str(&format!("{}. {}", i + 1, r.name));

        let mut facts = Vec::new();
        if let Some(years) = r.years {
            facts.push(format!("{} years", years));
        }
        if let Some(ref level) = r.level {
            facts.push(level.clone());
        }
        if let Some(ref category) = r.category {
            facts.push(category.clone());
        }
        if !facts.is_empty() {
            context.push_str(&format!(" ({})", facts.join(", ")));
        }
        context.push('\n');

        let fields = [
            ("Summary", Some(r.summary.as_str()).filter(|s| !s.is_empty())),
            ("Action", r.action.as_deref()),
            ("Effect", r.effect.as_deref()),
            ("Outcome", r.outcome.as_deref()),
            ("Project", r.related_project.as_deref()),
        ];
        for (label, value) in fields {
            if let Some(v) = value {
                context.push_str(&format!("   {}: {}\n", label, v));
            }
        }
    }

    let scope = match project {
        Some(p) => format!("The question is about the {} project only.\n", p),
        None => String::new(),
    };

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!("Skill records:\n{}\n{}Question: {}", context, scope, query),
    }
}

/// Removes filler phrases (case-insensitive) and tidies whitespace.
/// Returns `None` when nothing meaningful is left.
pub fn clean_reply(reply: &str, filler_phrases: &[String]) -> Option<String> {
    let mut text = reply.to_string();
    for phrase in filler_phrases.iter().filter(|p| !p.is_empty()) {
        text = remove_case_insensitive(&text, phrase);
    }
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c.is_whitespace() || c == ',');
    if trimmed.chars().any(|c| c.is_alphanumeric()) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn remove_case_insensitive(haystack: &str, needle: &str) -> String {
    let lower_hay = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    // Lowercasing can change byte lengths outside ASCII; only splice when it didn't.
    if lower_hay.len() != haystack.len() || lower_needle.len() != needle.len() {
        return haystack.replace(needle, "");
    }
    let mut out = String::with_capacity(haystack.len());
    let mut pos = 0;
    while let Some(found) = lower_hay[pos..].find(&lower_needle) {
        let start = pos + found;
        out.push_str(&haystack[pos..start]);
        pos = start + needle.len();
    }
    out.push_str(&haystack[pos..]);
    out
}
