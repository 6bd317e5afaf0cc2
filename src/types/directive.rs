use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The kinds of directive the pipeline understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    /// Web search.
    Search,

    /// Image synthesis.
    Image,

    /// Workspace file or folder mutation.
    Workspace,

    /// UI mode switch.
    ModeSwitch,

    /// Structured schedule/catalog lookup.
    Lookup,
}

impl DirectiveKind {
    /// Every kind, in scan order.
    pub const ALL: [DirectiveKind; 5] = [
        DirectiveKind::Search,
        DirectiveKind::Image,
        DirectiveKind::Workspace,
        DirectiveKind::ModeSwitch,
        DirectiveKind::Lookup,
    ];

    /// The marker that opens a block of this kind.
    pub fn start_marker(self) -> &'static str {
        match self {
            DirectiveKind::Search => "[SEARCH_QUERY]",
            DirectiveKind::Image => "[IMAGE_PROMPT]",
            DirectiveKind::Workspace => "[WORKSPACE_ACTION]",
            DirectiveKind::ModeSwitch => "[MODE_SWITCH]",
            DirectiveKind::Lookup => "[DATA_LOOKUP]",
        }
    }

    /// The marker that closes a block of this kind.
    pub fn end_marker(self) -> &'static str {
        match self {
            DirectiveKind::Search => "[/SEARCH_QUERY]",
            DirectiveKind::Image => "[/IMAGE_PROMPT]",
            DirectiveKind::Workspace => "[/WORKSPACE_ACTION]",
            DirectiveKind::ModeSwitch => "[/MODE_SWITCH]",
            DirectiveKind::Lookup => "[/DATA_LOOKUP]",
        }
    }

    /// Human-readable label used in inline annotations.
    pub fn label(self) -> &'static str {
        match self {
            DirectiveKind::Search => "Search",
            DirectiveKind::Image => "Image generation",
            DirectiveKind::Workspace => "Workspace",
            DirectiveKind::ModeSwitch => "Mode switch",
            DirectiveKind::Lookup => "Lookup",
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A complete directive block recognized in a text buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Kind of the directive.
    pub kind: DirectiveKind,

    /// The raw block, start marker through end marker inclusive.
    pub raw: String,

    /// Parsed `KEY: value` fields, keyed by upper-case name.
    pub fields: BTreeMap<String, String>,

    /// Text between the markers that did not belong to any field.
    pub body: String,
}

impl Directive {
    /// The dedupe key: kind plus exact raw block content.
    pub fn key(&self) -> String {
        format!("{:?}:{}", self.kind, self.raw)
    }

    /// Look up a field by name, case-insensitively.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The named field, or the free-form body when the field is absent.
    pub fn field_or_body(&self, name: &str) -> Option<&str> {
        self.field(name)
            .or_else(|| Some(self.body.trim()).filter(|b| !b.is_empty()))
    }
}
