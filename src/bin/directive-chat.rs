//! Interactive chat with a streaming backend that can issue directives.
//!
//! This binary provides a streaming REPL.  Directive blocks the model writes
//! into its replies (searches, images, workspace edits, mode switches, data
//! lookups) are dispatched as soon as they are complete.
//!
//! # Usage
//!
//! ```bash
//! # Talk to an SSE backend
//! directive-chat --endpoint http://localhost:8080/v1/stream
//!
//! # Load settings and credentials from YAML, persist conversations
//! directive-chat --config chat.yaml --transcript-dir ~/.directive-chat
//!
//! # Disable colors (useful for piping output)
//! directive-chat --no-color
//! ```
//!
//! Credentials may also come from `DIRECTIVE_CHAT_*` environment variables.
//! Set `DIRECTIVE_CHAT_LOG` (e.g. `debug`) to see dispatcher logs on stderr.

use std::sync::Arc;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use directive_chat::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatSession, PlainTextRenderer, Renderer, forward_events,
    help_text, parse_command,
};
use directive_chat::collaborators::{
    ConversationStore, GoogleSearch, HttpImageService, HttpLookupService, JsonFileStore,
    MemoryStore, MemoryWorkspace, SseModel,
};
use directive_chat::handlers::{
    HandlerRegistry, ImageHandler, LookupHandler, ModeSwitchHandler, SearchHandler,
    WorkspaceHandler,
};
use directive_chat::{Error, TurnOutcome, UiMode};

/// Main entry point for the directive-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_env("DIRECTIVE_CHAT_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("directive-chat [OPTIONS]");
    let base = match args.config.as_deref() {
        Some(path) => ChatConfig::from_yaml_file(path)?,
        None => ChatConfig::default(),
    };
    let mut config = base.with_args(args);
    config.credentials = config.credentials.with_env();
    let use_color = config.use_color;

    let endpoint = config.endpoint.clone().ok_or_else(|| {
        Error::validation(
            "no backend endpoint configured; pass --endpoint or set endpoint in --config",
            Some("endpoint".to_string()),
        )
    })?;
    let model = SseModel::new(
        endpoint,
        config.credentials.api_key.clone(),
        config.history_shape,
    )?;

    let workspace = Arc::new(MemoryWorkspace::new());
    let mut registry = HandlerRegistry::new()
        .with_handler(SearchHandler::new(Arc::new(GoogleSearch::new()?)))
        .with_handler(ModeSwitchHandler)
        .with_handler(WorkspaceHandler::new(workspace.clone()));
    if let Some(endpoint) = config.image_endpoint.clone() {
        let service = HttpImageService::new(endpoint, config.credentials.image_token.clone())?;
        registry = registry.with_handler(ImageHandler::new(Arc::new(service)));
    }
    if let Some(endpoint) = config.lookup_endpoint.as_deref() {
        let service = HttpLookupService::new(endpoint)?;
        registry = registry.with_handler(LookupHandler::new(Arc::new(service)));
    }
    let store: Arc<dyn ConversationStore> = match config.transcript_dir.as_deref() {
        Some(dir) => Arc::new(JsonFileStore::open(dir).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let transcript_dir = config.transcript_dir.clone();

    let session = ChatSession::builder(Arc::new(model), config)
        .with_handlers(registry)
        .with_store(store)
        .with_workspace(workspace)
        .build();
    let mut renderer = PlainTextRenderer::with_color(use_color);
    let mut rl = DefaultEditor::new()?;

    // Ctrl+C cancels the in-flight stream; handlers already running finish.
    let cancel = session.cancel_handle();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })?;

    let events = session.events();
    tokio::spawn(async move {
        let mut renderer = PlainTextRenderer::with_color(use_color);
        forward_events(events, &mut renderer).await;
    });

    println!("Directive Chat");
    println!("Type /help for commands, /quit to exit\n");

    loop {
        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Clear => {
                            session.clear().await;
                            renderer.print_info("Started a new conversation.");
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {line}");
                            }
                        }
                        ChatCommand::Regenerate => {
                            let conversation = session.conversation().await;
                            match conversation.messages.iter().rev().find(|m| m.is_bot()) {
                                Some(message) => {
                                    println!("Assistant:");
                                    let result = session
                                        .regenerate_streaming(message.id, &mut renderer)
                                        .await;
                                    report_turn(result, &mut renderer);
                                }
                                None => renderer.print_error("Nothing to regenerate."),
                            }
                        }
                        ChatCommand::Delete(position) => {
                            let conversation = session.conversation().await;
                            match conversation.messages.get(position - 1) {
                                Some(message) => {
                                    session.delete_message(message.id).await;
                                    renderer.print_info(&format!("Deleted message {position}."));
                                }
                                None => renderer.print_error(&format!(
                                    "There is no message {position}; the conversation has {}.",
                                    conversation.messages.len()
                                )),
                            }
                        }
                        ChatCommand::Mode(mode) => {
                            let mode = mode.unwrap_or(match session.ui_mode() {
                                UiMode::Chat => UiMode::Workspace,
                                UiMode::Workspace => UiMode::Chat,
                            });
                            session.set_ui_mode(mode);
                        }
                        ChatCommand::Save(path) => {
                            let path = match (path, transcript_dir.as_deref()) {
                                (Some(path), _) => Some(path),
                                (None, Some(dir)) => {
                                    let id = session.conversation().await.id;
                                    Some(
                                        utf8path::Path::from(dir)
                                            .join(format!("{id}.export.json").as_str())
                                            .as_str()
                                            .to_string(),
                                    )
                                }
                                (None, None) => None,
                            };
                            match path {
                                Some(path) => match session.save_transcript_to(&path).await {
                                    Ok(()) => renderer
                                        .print_info(&format!("Conversation saved to {path}")),
                                    Err(err) => renderer.print_error(&format!(
                                        "Failed to save conversation: {err}"
                                    )),
                                },
                                None => renderer.print_error(
                                    "/save needs a file path when no --transcript-dir is set",
                                ),
                            }
                        }
                        ChatCommand::Load(id) => match session.load(id).await {
                            Ok(true) => {
                                renderer.print_info(&format!("Loaded conversation {id}."));
                                print_conversation(&session).await;
                            }
                            Ok(false) => {
                                renderer.print_error(&format!("No conversation {id}."))
                            }
                            Err(err) => renderer
                                .print_error(&format!("Failed to load conversation: {err}")),
                        },
                        ChatCommand::List => match session.conversations().await {
                            Ok(ids) if ids.is_empty() => {
                                renderer.print_info("No saved conversations.")
                            }
                            Ok(ids) => {
                                for id in ids {
                                    println!("    {id}");
                                }
                            }
                            Err(err) => renderer
                                .print_error(&format!("Failed to list conversations: {err}")),
                        },
                        ChatCommand::Forget => match session.delete_conversation().await {
                            Ok(()) => renderer.print_info("Conversation deleted."),
                            Err(err) => renderer
                                .print_error(&format!("Failed to delete conversation: {err}")),
                        },
                        ChatCommand::Stats => {
                            print_stats(&session).await;
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                        }
                    }
                    continue;
                }

                println!("Assistant:");
                let result = session.submit_streaming(line, &mut renderer).await;
                report_turn(result, &mut renderer);
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {err}"));
                break;
            }
        }
    }

    Ok(())
}

fn report_turn(
    result: directive_chat::Result<directive_chat::TurnReport>,
    renderer: &mut PlainTextRenderer,
) {
    match result {
        Ok(report) => {
            if report.outcome == TurnOutcome::Completed && report.messages.len() > 1 {
                renderer.print_info(&format!("[{} replies]", report.messages.len()));
            }
        }
        Err(err) => renderer.print_error(&err.to_string()),
    }
}

async fn print_conversation(session: &ChatSession) {
    let conversation = session.conversation().await;
    for (index, message) in conversation.messages.iter().enumerate() {
        let who = if message.is_bot() { "Assistant" } else { "You" };
        println!("{:>3}. {who}: {}", index + 1, message.text);
    }
}

async fn print_stats(session: &ChatSession) {
    let stats = session.stats().await;
    println!("    Session Statistics:");
    println!("      Conversation: {}", stats.conversation_id);
    if !stats.title.is_empty() {
        println!("      Title: {}", stats.title);
    }
    println!("      Messages: {}", stats.message_count);
    println!("      Revision: {}", stats.revision);
    println!(
        "      Searches this turn: {}/{}",
        stats.searches_used, stats.search_cap
    );
    println!("      Follow-up limit: {}", stats.follow_up_limit);
    println!("      Mode: {:?}", stats.ui_mode);
    println!("      Debounce: {} ms", stats.debounce.as_millis());
    if let Some(prompt) = stats.system_prompt.as_deref() {
        println!("      System prompt: {prompt}");
    } else {
        println!("      System prompt: (none)");
    }
}
