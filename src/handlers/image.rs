use std::sync::Arc;

use tracing::warn;

use crate::collaborators::{ImageRequest, ImageService};
use crate::handlers::{DirectiveHandler, HandlerOutput, SessionContext};
use crate::types::{Attachment, Directive, DirectiveKind};
use crate::{Error, Result};

/// Synthesizes images and attaches them to the message.
///
/// Rate-limit failures are swallowed: the block is stripped and nothing is
/// shown.  Every other failure surfaces as an inline error, including an
/// exhausted quota.
pub struct ImageHandler {
    service: Arc<dyn ImageService>,
}

impl ImageHandler {
    /// Create a handler backed by `service`.
    pub fn new(service: Arc<dyn ImageService>) -> Self {
        Self { service }
    }
}

fn dimension(directive: &Directive, name: &str, default: u32) -> u32 {
    directive
        .field(name)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| (64..=2048).contains(v))
        .unwrap_or(default)
}

#[async_trait::async_trait]
impl DirectiveHandler for ImageHandler {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::Image
    }

    async fn handle(
        &self,
        directive: &Directive,
        context: &SessionContext,
    ) -> Result<HandlerOutput> {
        let prompt = directive.field_or_body("PROMPT").ok_or_else(|| {
            Error::validation("image directive has no prompt", Some("PROMPT".to_string()))
        })?;
        let request = ImageRequest {
            prompt: prompt.to_string(),
            width: dimension(directive, "WIDTH", context.image.width),
            height: dimension(directive, "HEIGHT", context.image.height),
            steps: context.image.steps,
        };
        match self.service.synthesize(&request).await {
            Ok(image) => Ok(HandlerOutput::strip().with_attachment(Attachment::Image {
                mime: image.mime,
                data: image.data,
            })),
            Err(err) if err.is_rate_limit() => {
                warn!(prompt, error = %err, "image synthesis rate limited; dropping request");
                Ok(HandlerOutput::strip())
            }
            Err(err) => Err(err),
        }
    }
}
