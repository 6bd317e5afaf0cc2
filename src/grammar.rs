//! Directive grammar and extractor.
//!
//! Directives are plain-text regions delimited by a kind-specific marker pair:
//!
//! ```text
//! [WORKSPACE_ACTION]
//! ACTION: CreateFile
//! NAME: main.py
//! CONTENT: print("hi")
//! [/WORKSPACE_ACTION]
//! ```
//!
//! Payload lines have the shape `KEY: value` where `KEY` is upper-case ASCII,
//! digits, or underscores.  A line that is not shaped like a key continues the
//! previous field, which is how multi-line `CONTENT` is carried.  Lines before
//! the first key form the free-form body, e.g. a bare search query.
//!
//! Extraction never reports errors.  A block without its closing marker is
//! invisible, and a structurally malformed block is skipped.

use std::collections::BTreeMap;

use crate::types::{Directive, DirectiveKind};

/// Every complete, well-formed block of `kind` in `buffer`, in order.
pub fn extract_all(buffer: &str, kind: DirectiveKind) -> Vec<Directive> {
    let start_marker = kind.start_marker();
    let end_marker = kind.end_marker();
    let mut directives = Vec::new();
    let mut cursor = 0;
    while let Some(found) = buffer[cursor..].find(start_marker) {
        let mut start = cursor + found;
        let inner_start = start + start_marker.len();
        let Some(end_found) = buffer[inner_start..].find(end_marker) else {
            break;
        };
        let end = inner_start + end_found + end_marker.len();
        // An unterminated opener followed by a complete block: keep the last opener.
        if let Some(reopen) = buffer[inner_start..inner_start + end_found].rfind(start_marker) {
            start = inner_start + reopen;
        }
        let raw = &buffer[start..end];
        let inner = &raw[start_marker.len()..raw.len() - end_marker.len()];
        if let Some(directive) = parse_block(kind, raw, inner) {
            directives.push(directive);
        }
        cursor = end;
    }
    directives
}

/// The first complete, well-formed block of `kind` in `buffer`.
pub fn extract_first(buffer: &str, kind: DirectiveKind) -> Option<Directive> {
    extract_all(buffer, kind).into_iter().next()
}

/// The first complete block of every kind present in `buffer`.
pub fn scan(buffer: &str) -> Vec<Directive> {
    DirectiveKind::ALL
        .iter()
        .filter_map(|kind| extract_first(buffer, *kind))
        .collect()
}

/// Remove the first occurrence of `raw` from `text`.
///
/// Returns `None` when the block is no longer present.
pub fn strip_block(text: &str, raw: &str) -> Option<String> {
    replace_block(text, raw, "")
}

/// Replace the first occurrence of `raw` in `text` with `replacement`.
///
/// Returns `None` when the block is no longer present.
pub fn replace_block(text: &str, raw: &str, replacement: &str) -> Option<String> {
    let index = text.find(raw)?;
    let mut out = String::with_capacity(text.len() - raw.len() + replacement.len());
    out.push_str(&text[..index]);
    out.push_str(replacement);
    out.push_str(&text[index + raw.len()..]);
    Some(out)
}

fn parse_block(kind: DirectiveKind, raw: &str, inner: &str) -> Option<Directive> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut body = String::new();
    let mut current: Option<String> = None;
    for line in inner.lines() {
        if let Some((key, value)) = split_key_line(line) {
            fields.insert(key.to_string(), value.trim().to_string());
            current = Some(key.to_string());
        } else if let Some(key) = &current {
            if let Some(value) = fields.get_mut(key) {
                value.push('\n');
                value.push_str(line);
            }
        } else {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(line);
        }
    }
    for value in fields.values_mut() {
        let trimmed = value.trim_end().len();
        value.truncate(trimmed);
    }
    let directive = Directive {
        kind,
        raw: raw.to_string(),
        fields,
        body: body.trim().to_string(),
    };
    if is_well_formed(&directive) {
        Some(directive)
    } else {
        None
    }
}

fn split_key_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let (key, value) = line.split_once(':')?;
    let mut chars = key.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return None;
    }
    Some((key, value))
}

fn is_well_formed(directive: &Directive) -> bool {
    match directive.kind {
        DirectiveKind::Search => directive.field_or_body("QUERY").is_some(),
        DirectiveKind::Image => directive.field_or_body("PROMPT").is_some(),
        DirectiveKind::Workspace => directive.field("ACTION").is_some(),
        DirectiveKind::ModeSwitch => directive.field_or_body("MODE").is_some(),
        DirectiveKind::Lookup => directive.field("ACTION").is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_search_body() {
        let buffer = "Let me check. [SEARCH_QUERY]weather Hanoi[/SEARCH_QUERY] One moment.";
        let directive = extract_first(buffer, DirectiveKind::Search).unwrap();
        assert_eq!(directive.raw, "[SEARCH_QUERY]weather Hanoi[/SEARCH_QUERY]");
        assert_eq!(directive.field_or_body("QUERY"), Some("weather Hanoi"));
        assert!(directive.fields.is_empty());
    }

    #[test]
    fn partial_block_is_invisible() {
        let buffer = "[SEARCH_QUERY]weather Ha";
        assert!(extract_first(buffer, DirectiveKind::Search).is_none());
        let buffer = "[SEARCH_QUERY]weather Hanoi[/SEARCH_QU";
        assert!(extract_first(buffer, DirectiveKind::Search).is_none());
    }

    #[test]
    fn fields_and_continuation_lines() {
        let buffer = "[WORKSPACE_ACTION]\nACTION: CreateFile\nNAME: main.py\nCONTENT: def main():\n    print(\"hi\")\n\n[/WORKSPACE_ACTION]";
        let directive = extract_first(buffer, DirectiveKind::Workspace).unwrap();
        assert_eq!(directive.field("action"), Some("CreateFile"));
        assert_eq!(directive.field("NAME"), Some("main.py"));
        assert_eq!(
            directive.field("CONTENT"),
            Some("def main():\n    print(\"hi\")")
        );
        assert!(directive.body.is_empty());
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        assert!(extract_first("[SEARCH_QUERY]   [/SEARCH_QUERY]", DirectiveKind::Search).is_none());
        assert!(
            extract_first(
                "[WORKSPACE_ACTION]NAME: a.txt[/WORKSPACE_ACTION]",
                DirectiveKind::Workspace
            )
            .is_none()
        );
    }

    #[test]
    fn extract_all_in_order() {
        let buffer = "[SEARCH_QUERY]a[/SEARCH_QUERY] text [SEARCH_QUERY]b[/SEARCH_QUERY] [SEARCH_QUERY]c";
        let found: Vec<_> = extract_all(buffer, DirectiveKind::Search)
            .into_iter()
            .map(|d| d.body)
            .collect();
        assert_eq!(found, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn dangling_opener_before_complete_block() {
        let buffer = "[SEARCH_QUERY]oops [SEARCH_QUERY]real query[/SEARCH_QUERY]";
        let directive = extract_first(buffer, DirectiveKind::Search).unwrap();
        assert_eq!(directive.body, "real query");
    }

    #[test]
    fn scan_returns_first_block_per_kind() {
        let buffer = "[IMAGE_PROMPT]a red fox[/IMAGE_PROMPT][SEARCH_QUERY]foxes[/SEARCH_QUERY][IMAGE_PROMPT]a blue fox[/IMAGE_PROMPT]";
        let found = scan(buffer);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, DirectiveKind::Search);
        assert_eq!(found[1].kind, DirectiveKind::Image);
        assert_eq!(found[1].body, "a red fox");
    }

    #[test]
    fn identical_blocks_share_a_key() {
        let block = "[WORKSPACE_ACTION]\nACTION: CreateFile\nNAME: a.txt\n[/WORKSPACE_ACTION]";
        let buffer = format!("{block}\n{block}");
        let found = extract_all(&buffer, DirectiveKind::Workspace);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].key(), found[1].key());
    }

    #[test]
    fn lowercase_prefixes_stay_in_body() {
        let buffer = "[IMAGE_PROMPT]note: a cat wearing a hat[/IMAGE_PROMPT]";
        let directive = extract_first(buffer, DirectiveKind::Image).unwrap();
        assert!(directive.fields.is_empty());
        assert_eq!(directive.body, "note: a cat wearing a hat");
    }

    #[test]
    fn replace_and_strip() {
        let raw = "[MODE_SWITCH]workspace[/MODE_SWITCH]";
        let text = format!("Switching.{raw} Done.");
        assert_eq!(strip_block(&text, raw).unwrap(), "Switching. Done.");
        assert_eq!(
            replace_block(&text, raw, "(ok)").unwrap(),
            "Switching.(ok) Done."
        );
        assert!(strip_block("nothing here", raw).is_none());
    }

    #[test]
    fn text_outside_blocks_is_untouched() {
        let buffer = "before [DATA_LOOKUP]\nACTION: schedule\nDATE: 2024-05-01\n[/DATA_LOOKUP] after";
        let directive = extract_first(buffer, DirectiveKind::Lookup).unwrap();
        assert!(buffer.starts_with("before "));
        assert_eq!(directive.field("DATE"), Some("2024-05-01"));
    }
}
