//! Slash command parsing for the chat application.
//!
//! This module handles parsing of special commands that start with `/`,
//! allowing users to control the chat session without sending messages
//! to the backend.

use crate::types::{ConversationId, UiMode};

/// A parsed chat command.
///
/// These commands control the chat session and are not sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Start a new conversation.
    Clear,

    /// Regenerate the last bot message.
    Regenerate,

    /// Delete the message at this 1-based position.
    Delete(usize),

    /// Switch the UI mode; `None` toggles it.
    Mode(Option<UiMode>),

    /// Save the conversation as JSON.  `None` saves into the transcript
    /// directory.
    Save(Option<String>),

    /// Load a persisted conversation.
    Load(ConversationId),

    /// List persisted conversations.
    List,

    /// Delete the current conversation from the store.
    Forget,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Display session statistics.
    Stats,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a valid command,
/// or `None` if it should be treated as a regular message.
///
/// # Examples
///
/// ```
/// # use directive_chat::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/delete 2").is_some());
/// assert!(parse_command("What's the weather?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "clear" | "new" => ChatCommand::Clear,
        "regenerate" | "regen" | "retry" => ChatCommand::Regenerate,
        "delete" | "del" => match argument.map(str::parse::<usize>) {
            Some(Ok(position)) if position > 0 => ChatCommand::Delete(position),
            Some(_) => ChatCommand::Invalid("/delete expects a message number".to_string()),
            None => ChatCommand::Invalid("/delete requires a message number".to_string()),
        },
        "mode" => match argument {
            None => ChatCommand::Mode(None),
            Some(arg) => match arg.parse::<UiMode>() {
                Ok(mode) => ChatCommand::Mode(Some(mode)),
                Err(()) => {
                    ChatCommand::Invalid("/mode expects 'chat' or 'workspace'".to_string())
                }
            },
        },
        "save" => ChatCommand::Save(argument.map(String::from)),
        "load" => match argument.map(str::parse::<ConversationId>) {
            Some(Ok(id)) => ChatCommand::Load(id),
            Some(Err(_)) => ChatCommand::Invalid("/load expects a conversation id".to_string()),
            None => ChatCommand::Invalid("/load requires a conversation id".to_string()),
        },
        "list" | "conversations" => ChatCommand::List,
        "forget" => ChatCommand::Forget,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "stats" | "status" => ChatCommand::Stats,
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /clear                 Start a new conversation
  /regenerate            Regenerate the last reply
  /delete <n>            Delete message number n
  /mode [chat|workspace] Switch (or toggle) the UI mode
  /save [file]           Save the conversation as JSON
  /load <id>             Load a saved conversation
  /list                  List saved conversations
  /forget                Delete the current conversation
  /stats                 Show session statistics
  /help                  Show this help message
  /quit                  Exit the chat

Press Ctrl-C while a reply streams to cancel it."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quit_commands() {
        assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/exit"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/q"), Some(ChatCommand::Quit));
        assert_eq!(parse_command("  /quit  "), Some(ChatCommand::Quit));
    }

    #[test]
    fn parse_clear() {
        assert_eq!(parse_command("/clear"), Some(ChatCommand::Clear));
        assert_eq!(parse_command("/CLEAR"), Some(ChatCommand::Clear));
    }

    #[test]
    fn parse_delete() {
        assert_eq!(parse_command("/delete 3"), Some(ChatCommand::Delete(3)));
        assert!(matches!(
            parse_command("/delete 0"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("expects")
        ));
        assert!(matches!(
            parse_command("/delete"),
            Some(ChatCommand::Invalid(msg)) if msg.contains("requires")
        ));
    }

    #[test]
    fn parse_mode() {
        assert_eq!(parse_command("/mode"), Some(ChatCommand::Mode(None)));
        assert_eq!(
            parse_command("/mode workspace"),
            Some(ChatCommand::Mode(Some(UiMode::Workspace)))
        );
        assert!(matches!(
            parse_command("/mode sideways"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parse_save_and_load() {
        assert_eq!(parse_command("/save"), Some(ChatCommand::Save(None)));
        assert_eq!(
            parse_command("/save chat.json"),
            Some(ChatCommand::Save(Some("chat.json".to_string())))
        );
        let id = ConversationId::generate();
        assert_eq!(
            parse_command(&format!("/load {id}")),
            Some(ChatCommand::Load(id))
        );
        assert!(matches!(
            parse_command("/load nope"),
            Some(ChatCommand::Invalid(_))
        ));
    }

    #[test]
    fn parse_misc() {
        assert_eq!(parse_command("/regenerate"), Some(ChatCommand::Regenerate));
        assert_eq!(parse_command("/stats"), Some(ChatCommand::Stats));
        assert_eq!(parse_command("/list"), Some(ChatCommand::List));
        assert_eq!(parse_command("/forget"), Some(ChatCommand::Forget));
        assert!(matches!(
            parse_command("/model x"),
            Some(ChatCommand::Invalid(msg)) if msg == "Unknown command: /model"
        ));
    }

    #[test]
    fn non_commands() {
        assert_eq!(parse_command("Hello there!"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("  "), None);
    }

    #[test]
    fn help_text_not_empty() {
        let help = help_text();
        assert!(help.contains("/quit"));
        assert!(help.contains("/regenerate"));
        assert!(help.contains("/delete"));
        assert!(help.contains("/mode"));
    }
}
