use tracing::info;

use crate::handlers::{DirectiveHandler, HandlerOutput, SessionContext};
use crate::types::{Directive, DirectiveKind, UiEvent, UiMode};
use crate::{Error, Result};

/// Flips the session's UI mode.  The message text is left as-is.
#[derive(Debug, Default)]
pub struct ModeSwitchHandler;

#[async_trait::async_trait]
impl DirectiveHandler for ModeSwitchHandler {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::ModeSwitch
    }

    async fn handle(
        &self,
        directive: &Directive,
        context: &SessionContext,
    ) -> Result<HandlerOutput> {
        let requested = directive.field_or_body("MODE").unwrap_or_default();
        let mode: UiMode = requested.parse().map_err(|_| {
            Error::validation(
                format!("unknown mode {requested:?}; expected chat or workspace"),
                Some("MODE".to_string()),
            )
        })?;
        if context.set_ui_mode(mode) {
            info!(?mode, "ui mode changed");
        }
        context.emit(UiEvent::ModeChanged(mode));
        Ok(HandlerOutput::leave())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{context, directive};

    #[tokio::test]
    async fn switches_and_notifies() {
        let context = context();
        let mut events = context.subscribe();
        let output = ModeSwitchHandler
            .handle(&directive(DirectiveKind::ModeSwitch, "workspace"), &context)
            .await
            .unwrap();
        assert_eq!(output, HandlerOutput::leave());
        assert_eq!(context.ui_mode(), UiMode::Workspace);
        assert_eq!(
            events.recv().await.unwrap(),
            UiEvent::ModeChanged(UiMode::Workspace)
        );

        ModeSwitchHandler
            .handle(&directive(DirectiveKind::ModeSwitch, "\nMODE: exit\n"), &context)
            .await
            .unwrap();
        assert_eq!(context.ui_mode(), UiMode::Chat);
    }

    #[tokio::test]
    async fn unknown_mode_is_an_error() {
        let context = context();
        let err = ModeSwitchHandler
            .handle(&directive(DirectiveKind::ModeSwitch, "fullscreen"), &context)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(context.ui_mode(), UiMode::Chat);
    }
}
