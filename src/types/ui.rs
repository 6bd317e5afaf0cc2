use serde::{Deserialize, Serialize};

/// Session-scoped UI mode toggled by mode-switch directives.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    /// The ordinary chat view.
    #[default]
    Chat,

    /// The specialized workspace view.
    Workspace,
}

impl std::str::FromStr for UiMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" | "exit" | "off" => Ok(UiMode::Chat),
            "workspace" | "enter" | "on" | "code" => Ok(UiMode::Workspace),
            _ => Err(()),
        }
    }
}

/// Notifications emitted to the UI layer by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// The workspace tree changed and should be reloaded.
    WorkspaceReload,

    /// The session's UI mode changed.
    ModeChanged(UiMode),

    /// A workspace file should be opened in an editor.
    OpenFile {
        /// Workspace id of the file.
        file_id: String,
        /// Display name of the file.
        name: String,
    },

    /// A workspace media file should be opened in a viewer.
    OpenMedia {
        /// Workspace id of the file.
        file_id: String,
        /// Display name of the file.
        name: String,
    },
}
