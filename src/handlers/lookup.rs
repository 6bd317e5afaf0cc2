use std::sync::Arc;

use time::OffsetDateTime;
use time::macros::format_description;

use crate::collaborators::{LookupRequest, LookupResponse, LookupService};
use crate::handlers::{DirectiveHandler, HandlerOutput, SessionContext};
use crate::types::{Attachment, Directive, DirectiveKind};
use crate::{Error, Result};

/// Runs schedule/catalog lookups.
///
/// The rendered result always begins with a `### <Action> for <date>` header
/// line; readers of the persisted text locate results by that header.
pub struct LookupHandler {
    service: Arc<dyn LookupService>,
}

impl LookupHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: Arc<dyn LookupService>) -> Self {
        Self { service }
    }
}

fn today() -> String {
    let format = format_description!("[year]-[month]-[day]");
    OffsetDateTime::now_utc()
        .date()
        .format(format)
        .unwrap_or_default()
}

fn title_case(action: &str) -> String {
    let mut chars = action.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn render(response: &LookupResponse) -> String {
    if response.entries.is_empty() {
        return "No entries found.".to_string();
    }
    response
        .entries
        .iter()
        .map(|entry| {
            if entry.detail.is_empty() {
                format!("- {}", entry.label)
            } else {
                format!("- {}: {}", entry.label, entry.detail)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait::async_trait]
impl DirectiveHandler for LookupHandler {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::Lookup
    }

    async fn handle(
        &self,
        directive: &Directive,
        context: &SessionContext,
    ) -> Result<HandlerOutput> {
        let action = directive.field("ACTION").ok_or_else(|| {
            Error::validation("lookup directive has no action", Some("ACTION".to_string()))
        })?;
        let token = context.credentials.lookup()?;
        let date = directive
            .field("DATE")
            .map(String::from)
            .unwrap_or_else(today);
        let request = LookupRequest {
            action: action.to_string(),
            date: Some(date.clone()),
            query: directive.field("QUERY").map(String::from),
        };
        let response = self.service.lookup(&request, token).await?;
        let title = format!("{} for {date}", title_case(action));
        let body = render(&response);
        Ok(HandlerOutput::replace(format!("### {title}\n{body}\n"))
            .with_attachment(Attachment::Structured { title, body }))
    }
}
