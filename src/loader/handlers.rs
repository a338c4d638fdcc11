//! Turning extension handlers into registry commands.

use crate::plugins::Handler;
use crate::registry::Command;

/// Longest description sent to the registry, in characters.
pub const MAX_DESCRIPTION_LENGTH: usize = 100;

/// Stands in for a missing description and marks a truncated one.
pub const PLACEHOLDER: char = '…';

const TAB_SIZE: usize = 8;

/// Handlers whose name starts with `_` stay internal.
pub fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

/// Normalize documentation text the way docstrings are usually cleaned:
/// tabs are expanded, the first line is left-stripped, the indentation
/// shared by the remaining lines is removed and blank lines at either end
/// are dropped.
pub fn clean_doc(doc: &str) -> String {
    let lines: Vec<String> = doc.lines().map(expand_tabs).collect();
    let Some((first, rest)) = lines.split_first() else {
        return String::new();
    };

    let margin = rest
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().take_while(|c| c.is_whitespace()).count())
        .min();

    let mut cleaned = Vec::with_capacity(lines.len());
    cleaned.push(first.trim_start().to_string());
    for line in rest {
        let line = match margin {
            Some(margin) => line.chars().skip(margin).collect(),
            None => line.clone(),
        };
        cleaned.push(line);
    }

    while cleaned.last().is_some_and(|line| line.trim().is_empty()) {
        cleaned.pop();
    }
    let start = cleaned
        .iter()
        .position(|line| !line.trim().is_empty())
        .unwrap_or(cleaned.len());
    cleaned[start..].join("\n")
}

fn expand_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut column = 0;
    for c in line.chars() {
        if c == '\t' {
            let width = TAB_SIZE - column % TAB_SIZE;
            out.extend(std::iter::repeat(' ').take(width));
            column += width;
        } else {
            out.push(c);
            column += 1;
        }
    }
    out
}

/// Registry description for a handler's documentation.
pub fn describe(doc: Option<&str>) -> String {
    let cleaned = doc.map(clean_doc).unwrap_or_default();
    if cleaned.trim().is_empty() {
        return PLACEHOLDER.to_string();
    }
    if cleaned.chars().count() > MAX_DESCRIPTION_LENGTH {
        let mut truncated: String = cleaned.chars().take(MAX_DESCRIPTION_LENGTH - 1).collect();
        truncated.push(PLACEHOLDER);
        return truncated;
    }
    cleaned
}

pub fn build_command(handler: Handler) -> Command {
    Command {
        description: describe(handler.doc.as_deref()),
        name: handler.name,
        callback: handler.callback,
    }
}
