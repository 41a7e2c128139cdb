//! Pulls the plan template out of a raw model response.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::PlannerError;
use crate::template;

/// Language tag of the fenced block the model is asked to emit.
pub const TEMPLATE_LANGUAGE: &str = "handlebars";

/// Characters of the raw response kept in `PlanNotFound` diagnostics.
const EXCERPT_CHARS: usize = 200;

static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn fence_re() -> &'static Regex {
    FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)```handlebars[ \t]*\r?\n(.*?)```").expect("valid literal regex")
    })
}

/// Extract the template body from `response`.
///
/// The first ```` ```handlebars ```` fenced block wins and its body is
/// returned trimmed. When `fallback_to_raw` is set and no fence is present,
/// a response that contains no fence markers at all but does contain a
/// well-formed template tag is accepted as the template itself.
pub fn extract_template(response: &str, fallback_to_raw: bool) -> Result<String, PlannerError> {
    if let Some(caps) = fence_re().captures(response) {
        return Ok(caps[1].trim().to_owned());
    }

    if fallback_to_raw {
        if let Some(raw) = raw_template(response) {
            return Ok(raw);
        }
    }

    Err(PlannerError::PlanNotFound {
        excerpt: excerpt(response),
    })
}

fn raw_template(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if trimmed.contains("```") || !trimmed.contains("{{") || !trimmed.contains("}}") {
        return None;
    }
    template::parse(trimmed).ok().map(|_| trimmed.to_owned())
}

fn excerpt(response: &str) -> String {
    let mut out: String = response.chars().take(EXCERPT_CHARS).collect();
    if response.chars().nth(EXCERPT_CHARS).is_some() {
        out.push('…');
    }
    out
}
