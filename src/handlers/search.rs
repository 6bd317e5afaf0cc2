use std::sync::Arc;

use tracing::{debug, info};

use crate::collaborators::{SearchResult, SearchService};
use crate::handlers::{DirectiveHandler, HandlerOutput, SessionContext};
use crate::types::{Directive, DirectiveKind};
use crate::{Error, Result};

/// Injected once the per-turn search budget is exhausted.
pub const SEARCH_LIMIT_NOTICE: &str = "[SYSTEM NOTICE] The search limit for this turn has been reached. Do not issue any more searches. Conclude your answer using the information you already have.";

/// Runs web searches and seeds a follow-up with the results.
pub struct SearchHandler {
    service: Arc<dyn SearchService>,
}

impl SearchHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: Arc<dyn SearchService>) -> Self {
        Self { service }
    }
}

fn format_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No search results found for \"{query}\".");
    }
    let mut out = format!("Search results for \"{query}\":\n");
    for (index, result) in results.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} ({})\n   {}\n",
            index + 1,
            result.title,
            result.source_domain,
            result.snippet
        ));
    }
    out
}

#[async_trait::async_trait]
impl DirectiveHandler for SearchHandler {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::Search
    }

    async fn handle(
        &self,
        directive: &Directive,
        context: &SessionContext,
    ) -> Result<HandlerOutput> {
        let query = directive
            .field_or_body("QUERY")
            .ok_or_else(|| Error::validation("search directive has no query", Some("QUERY".to_string())))?;
        let credentials = context.credentials.search()?;
        let count = match context.search_budget.try_acquire() {
            Ok(count) => count,
            Err(used) => {
                crate::observability::SEARCH_REFUSED.click();
                info!(query, used, cap = context.search_budget.cap(), "search refused");
                return Ok(HandlerOutput::append(format!("\n\n{SEARCH_LIMIT_NOTICE}"))
                    .with_follow_up(SEARCH_LIMIT_NOTICE));
            }
        };
        debug!(query, count, "searching");
        let results = self
            .service
            .search(query, &credentials, context.search_results)
            .await?;
        let formatted = format_results(query, &results);
        let prompt = format!(
            "{formatted}\nUse these results to answer the user's question. Cite the source domains you rely on."
        );
        Ok(HandlerOutput::replace(formatted).with_follow_up(prompt))
    }
}
