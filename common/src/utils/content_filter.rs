//! Output sanitisation shared by the input gate and every outbound fragment.
//!
//! Two passes run in a fixed order: fenced code blocks are dropped in their
//! entirety, then denylisted tokens are replaced with the redaction marker.

use std::borrow::Cow;

use regex::{Regex, RegexBuilder};

use crate::error::AppError;

const FENCE_PATTERN: &str = r"(?s)```.*?```";

/// Compiled content filter. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    fence: Regex,
    denylist: Option<Regex>,
    entries: Vec<String>,
    marker: String,
}

impl ContentFilter {
    /// Builds a filter from denylist entries and a redaction marker.
    ///
    /// Entries must be non-empty, free of backticks and square brackets, and must
    /// not occur inside the marker. Those three rules keep `filter` idempotent.
    pub fn new<I, S>(entries: I, marker: impl Into<String>) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let marker = marker.into();
        if marker.is_empty() || marker.contains('`') {
            return Err(AppError::Config(
                "redaction marker must be non-empty and must not contain backticks".into(),
            ));
        }
        let marker_lower = marker.to_lowercase();

        let mut cleaned: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                return Err(AppError::Config("denylist entries must be non-empty".into()));
            }
            if entry.contains(['`', '[', ']']) {
                return Err(AppError::Config(format!(
                    "denylist entry '{entry}' must not contain backticks or square brackets"
                )));
            }
            let entry_lower = entry.to_lowercase();
            if marker_lower.contains(&entry_lower) {
                return Err(AppError::Config(format!(
                    "denylist entry '{entry}' occurs inside the redaction marker"
                )));
            }
            if straddles_marker(&entry_lower, &marker_lower) {
                return Err(AppError::Config(format!(
                    "denylist entry '{entry}' can match across the edge of the redaction marker"
                )));
            }
            if !cleaned.iter().any(|existing| existing == entry) {
                cleaned.push(entry.to_string());
            }
        }

        let fence = Regex::new(FENCE_PATTERN)
            .map_err(|e| AppError::InternalError(format!("fence pattern: {e}")))?;

        let denylist = if cleaned.is_empty() {
            None
        } else {
            // Longest entries first so overlapping entries redact the widest span.
            let mut ordered: Vec<&String> = cleaned.iter().collect();
            ordered.sort_by_key(|entry| std::cmp::Reverse(entry.len()));
            let alternation = ordered
                .iter()
                .map(|entry| regex::escape(entry))
                .collect::<Vec<_>>()
                .join("|");
            let compiled = RegexBuilder::new(&alternation)
                .case_insensitive(true)
                .build()
                .map_err(|e| AppError::Config(format!("denylist pattern: {e}")))?;
            Some(compiled)
        };

        Ok(Self {
            fence,
            denylist,
            entries: cleaned,
            marker,
        })
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// True when the text contains any denylisted entry, case-insensitively.
    pub fn is_denied(&self, text: &str) -> bool {
        self.denylist
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text))
    }

    /// Sanitises one unit of output.
    pub fn filter(&self, text: &str) -> String {
        let without_fences = self.strip_fences(text);
        match &self.denylist {
            Some(pattern) => pattern
                .replace_all(&without_fences, self.marker.as_str())
                .into_owned(),
            None => without_fences.into_owned(),
        }
    }

    // Removing one block can splice stray backticks into a fresh delimiter,
    // so strip until nothing matches. Each round shrinks the text.
    fn strip_fences<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(text);
        while self.fence.is_match(&current) {
            current = Cow::Owned(self.fence.replace_all(&current, "").into_owned());
        }
        current
    }
}

// A match on a second pass would need to start or end inside an inserted
// marker: an entry prefix equal to a marker suffix, or an entry suffix equal
// to a marker prefix. Both inputs are lowercased.
fn straddles_marker(entry: &str, marker: &str) -> bool {
    if entry.contains(marker) {
        return true;
    }
    entry
        .char_indices()
        .skip(1)
        .filter_map(|(split, _)| entry.get(..split).zip(entry.get(split..)))
        .any(|(head, tail)| marker.ends_with(head) || marker.starts_with(tail))
}
