//! Workspace mutations.
//!
//! Every mutation is two-phase: it is committed to the workspace store first,
//! then mirrored to the sandbox if one is configured.  Mirror failures are
//! logged and counted but never rolled back or reported to the user.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::collaborators::{EntryKind, Project, Sandbox, WorkspaceEntry, WorkspaceStore, path_segments};
use crate::handlers::{DirectiveHandler, HandlerOutput, SessionContext};
use crate::types::{Directive, DirectiveKind, UiEvent};
use crate::{Error, Result};

/// The workspace sub-directives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkspaceAction {
    /// Create a file, or replace the content of an existing one.
    CreateFile,
    /// Create a folder and any missing parents.
    CreateFolder,
    /// Rename a file in place.
    RenameFile,
    /// Rename a folder in place.
    RenameFolder,
    /// Delete a file.
    DeleteFile,
    /// Delete a folder and everything beneath it.
    DeleteFolder,
    /// Ask the UI to open a file in an editor.
    OpenFile,
    /// Ask the UI to open a file in a media viewer.
    OpenMedia,
}

impl FromStr for WorkspaceAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "createfile" => Ok(Self::CreateFile),
            "createfolder" => Ok(Self::CreateFolder),
            "renamefile" => Ok(Self::RenameFile),
            "renamefolder" => Ok(Self::RenameFolder),
            "deletefile" => Ok(Self::DeleteFile),
            "deletefolder" => Ok(Self::DeleteFolder),
            "openfile" => Ok(Self::OpenFile),
            "openmedia" => Ok(Self::OpenMedia),
            _ => Err(Error::validation(
                format!("unknown workspace action {s:?}"),
                Some("ACTION".to_string()),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MirrorOp {
    CreateDir(String),
    Upload { path: String, content: String },
    Delete(String),
}

struct Applied {
    summary: Option<String>,
    mirror: Vec<MirrorOp>,
    events: Vec<UiEvent>,
}

/// Applies workspace directives to a [`WorkspaceStore`], optionally
/// mirroring them to a [`Sandbox`].
pub struct WorkspaceHandler {
    store: Arc<dyn WorkspaceStore>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl WorkspaceHandler {
    /// Create a handler without a sandbox mirror.
    pub fn new(store: Arc<dyn WorkspaceStore>) -> Self {
        Self {
            store,
            sandbox: None,
        }
    }

    /// Mirror every committed mutation to `sandbox`.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    async fn project(&self, name: &str) -> Result<Project> {
        match self.store.project_by_name(name).await? {
            Some(project) => Ok(project),
            None => self.store.create_project(name).await,
        }
    }

    async fn require(
        &self,
        project: &Project,
        path: &str,
        kind: EntryKind,
    ) -> Result<WorkspaceEntry> {
        let entry = self
            .store
            .find(&project.id, path)
            .await?
            .ok_or_else(|| Error::not_found(format!("`{path}` does not exist"), Some("PATH".to_string())))?;
        if entry.kind != kind {
            let expected = match kind {
                EntryKind::File => "a file",
                EntryKind::Folder => "a folder",
            };
            return Err(Error::validation(
                format!("`{path}` is not {expected}"),
                Some("PATH".to_string()),
            ));
        }
        Ok(entry)
    }

    /// Find or create every folder along `segments`, returning the id of the last.
    async fn ensure_folders(&self, project: &Project, segments: &[String]) -> Result<Option<String>> {
        let mut parent: Option<String> = None;
        for depth in 1..=segments.len() {
            let path = segments[..depth].join("/");
            let entry = match self.store.find(&project.id, &path).await? {
                Some(entry) if entry.is_folder() => entry,
                Some(_) => {
                    return Err(Error::validation(
                        format!("`{path}` is a file, not a folder"),
                        Some("PATH".to_string()),
                    ));
                }
                None => {
                    self.store
                        .create_folder(&project.id, parent.as_deref(), &segments[depth - 1])
                        .await?
                }
            };
            parent = Some(entry.id);
        }
        Ok(parent)
    }

    async fn create_file(&self, project: &Project, path: &str, content: &str) -> Result<Applied> {
        let segments = path_segments(path)?;
        let path = segments.join("/");
        let (name, dirs) = segments
            .split_last()
            .ok_or_else(|| Error::validation("empty path", Some("PATH".to_string())))?;
        let parent = self.ensure_folders(project, dirs).await?;
        let verb = match self.store.find(&project.id, &path).await? {
            Some(existing) if existing.is_folder() => {
                return Err(Error::validation(
                    format!("`{path}` is a folder"),
                    Some("PATH".to_string()),
                ));
            }
            Some(existing) => {
                self.store.write_file(&existing.id, content).await?;
                "Updated"
            }
            None => {
                self.store
                    .create_file(&project.id, parent.as_deref(), name, content)
                    .await?;
                "Created"
            }
        };
        let mut mirror = Vec::new();
        if !dirs.is_empty() {
            mirror.push(MirrorOp::CreateDir(dirs.join("/")));
        }
        mirror.push(MirrorOp::Upload {
            path: path.clone(),
            content: content.to_string(),
        });
        Ok(Applied {
            summary: Some(format!("{verb} file `{path}`.")),
            mirror,
            events: vec![UiEvent::WorkspaceReload],
        })
    }

    async fn create_folder(&self, project: &Project, path: &str) -> Result<Applied> {
        let segments = path_segments(path)?;
        self.ensure_folders(project, &segments).await?;
        let path = segments.join("/");
        Ok(Applied {
            summary: Some(format!("Created folder `{path}`.")),
            mirror: vec![MirrorOp::CreateDir(path)],
            events: vec![UiEvent::WorkspaceReload],
        })
    }

    async fn rename(
        &self,
        project: &Project,
        path: &str,
        new_name: &str,
        kind: EntryKind,
    ) -> Result<Applied> {
        let old_path = path_segments(path)?.join("/");
        let entry = self.require(project, &old_path, kind).await?;
        let renamed = self.store.rename(&entry.id, new_name).await?;
        let new_path = self.store.path_of(&renamed.id).await?;
        let mut mirror = Vec::new();
        match kind {
            EntryKind::File => mirror.push(MirrorOp::Upload {
                path: new_path.clone(),
                content: renamed.content.clone(),
            }),
            EntryKind::Folder => {
                mirror.push(MirrorOp::CreateDir(new_path.clone()));
                let prefix = format!("{new_path}/");
                for entry in self.store.list_tree(&project.id).await? {
                    let entry_path = self.store.path_of(&entry.id).await?;
                    if !entry_path.starts_with(&prefix) {
                        continue;
                    }
                    mirror.push(match entry.kind {
                        EntryKind::Folder => MirrorOp::CreateDir(entry_path),
                        EntryKind::File => MirrorOp::Upload {
                            path: entry_path,
                            content: entry.content,
                        },
                    });
                }
            }
        }
        mirror.push(MirrorOp::Delete(old_path.clone()));
        Ok(Applied {
            summary: Some(format!("Renamed `{old_path}` to `{new_path}`.")),
            mirror,
            events: vec![UiEvent::WorkspaceReload],
        })
    }

    async fn delete(&self, project: &Project, path: &str, kind: EntryKind) -> Result<Applied> {
        let path = path_segments(path)?.join("/");
        let entry = self.require(project, &path, kind).await?;
        let removed = self.store.delete(&entry.id).await?;
        debug!(path, removed = removed.len(), "workspace entries deleted");
        Ok(Applied {
            summary: Some(format!("Deleted `{path}`.")),
            mirror: vec![MirrorOp::Delete(path)],
            events: vec![UiEvent::WorkspaceReload],
        })
    }

    async fn open(&self, project: &Project, path: &str, media: bool) -> Result<Applied> {
        let path = path_segments(path)?.join("/");
        let entry = self.require(project, &path, EntryKind::File).await?;
        let event = if media {
            UiEvent::OpenMedia {
                file_id: entry.id,
                name: entry.name,
            }
        } else {
            UiEvent::OpenFile {
                file_id: entry.id,
                name: entry.name,
            }
        };
        Ok(Applied {
            summary: None,
            mirror: Vec::new(),
            events: vec![event],
        })
    }

    async fn mirror(&self, project: &Project, ops: Vec<MirrorOp>) {
        let Some(sandbox) = &self.sandbox else {
            return;
        };
        for op in ops {
            let result = match &op {
                MirrorOp::CreateDir(path) => sandbox.create_dir(&project.name, path).await,
                MirrorOp::Upload { path, content } => {
                    sandbox.upload_file(&project.name, path, content).await
                }
                MirrorOp::Delete(path) => sandbox.delete_path(&project.name, path).await,
            };
            if let Err(err) = result {
                crate::observability::MIRROR_FAILURES.click();
                warn!(project = %project.name, ?op, error = %err, "sandbox mirror failed");
            }
        }
    }
}

fn required<'a>(directive: &'a Directive, names: &[&str]) -> Result<&'a str> {
    names
        .iter()
        .find_map(|name| directive.field(name))
        .ok_or_else(|| {
            Error::validation(
                format!("workspace directive is missing {}", names.join(" or ")),
                names.first().map(|n| n.to_string()),
            )
        })
}

fn new_name(directive: &Directive) -> Result<String> {
    if let Some(name) = directive.field("NEW_NAME") {
        return Ok(name.to_string());
    }
    let new_path = required(directive, &["NEW_PATH"])
        .map_err(|_| Error::validation("rename needs NEW_NAME", Some("NEW_NAME".to_string())))?;
    path_segments(new_path)?
        .pop()
        .ok_or_else(|| Error::validation("empty NEW_PATH", Some("NEW_PATH".to_string())))
}

#[async_trait::async_trait]
impl DirectiveHandler for WorkspaceHandler {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::Workspace
    }

    async fn handle(
        &self,
        directive: &Directive,
        context: &SessionContext,
    ) -> Result<HandlerOutput> {
        let action: WorkspaceAction = required(directive, &["ACTION"])?.parse()?;
        let path = required(directive, &["PATH", "NAME"])?;
        let project = self.project(&context.project).await?;
        let applied = match action {
            WorkspaceAction::CreateFile => {
                let content = directive.field("CONTENT").unwrap_or_default();
                self.create_file(&project, path, content).await?
            }
            WorkspaceAction::CreateFolder => self.create_folder(&project, path).await?,
            WorkspaceAction::RenameFile => {
                self.rename(&project, path, &new_name(directive)?, EntryKind::File)
                    .await?
            }
            WorkspaceAction::RenameFolder => {
                self.rename(&project, path, &new_name(directive)?, EntryKind::Folder)
                    .await?
            }
            WorkspaceAction::DeleteFile => self.delete(&project, path, EntryKind::File).await?,
            WorkspaceAction::DeleteFolder => {
                self.delete(&project, path, EntryKind::Folder).await?
            }
            WorkspaceAction::OpenFile => self.open(&project, path, false).await?,
            WorkspaceAction::OpenMedia => self.open(&project, path, true).await?,
        };
        self.mirror(&project, applied.mirror).await;
        for event in applied.events {
            context.emit(event);
        }
        Ok(match applied.summary {
            Some(summary) => HandlerOutput::replace(summary),
            None => HandlerOutput::leave(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;
    use crate::collaborators::MemoryWorkspace;
    use crate::handlers::SpliceMode;
    use crate::handlers::testing::{context, directive};

    #[derive(Default)]
    struct RecordingSandbox {
        ops: Mutex<Vec<MirrorOp>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Sandbox for RecordingSandbox {
        async fn create_dir(&self, _: &str, path: &str) -> Result<()> {
            self.record(MirrorOp::CreateDir(path.to_string())).await
        }

        async fn delete_path(&self, _: &str, path: &str) -> Result<()> {
            self.record(MirrorOp::Delete(path.to_string())).await
        }

        async fn upload_file(&self, _: &str, path: &str, content: &str) -> Result<()> {
            self.record(MirrorOp::Upload {
                path: path.to_string(),
                content: content.to_string(),
            })
            .await
        }
    }

    impl RecordingSandbox {
        async fn record(&self, op: MirrorOp) -> Result<()> {
            if self.fail {
                return Err(Error::connection("sandbox offline", None));
            }
            self.ops.lock().await.push(op);
            Ok(())
        }
    }

    fn block(inner: &str) -> Directive {
        directive(DirectiveKind::Workspace, inner)
    }

    fn setup() -> (Arc<MemoryWorkspace>, Arc<RecordingSandbox>, WorkspaceHandler) {
        let store = Arc::new(MemoryWorkspace::new());
        let sandbox = Arc::new(RecordingSandbox::default());
        let handler = WorkspaceHandler::new(store.clone()).with_sandbox(sandbox.clone());
        (store, sandbox, handler)
    }

    async fn project_id(store: &MemoryWorkspace) -> String {
        store.project_by_name("demo").await.unwrap().unwrap().id
    }

    #[test]
    fn action_names() {
        assert_eq!("CreateFile".parse::<WorkspaceAction>().unwrap(), WorkspaceAction::CreateFile);
        assert_eq!("delete_folder".parse::<WorkspaceAction>().unwrap(), WorkspaceAction::DeleteFolder);
        assert!("Explode".parse::<WorkspaceAction>().is_err());
    }

    #[tokio::test]
    async fn create_file_commits_then_mirrors() {
        let (store, sandbox, handler) = setup();
        let context = context();
        let mut events = context.subscribe();
        let output = handler
            .handle(
                &block("\nACTION: CreateFile\nPATH: src/main.py\nCONTENT: def main():\n    print(\"hi\")\n"),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(output.splice, SpliceMode::ReplaceBlock);
        assert_eq!(output.text, "Created file `src/main.py`.");
        let project = project_id(&store).await;
        let file = store.find(&project, "src/main.py").await.unwrap().unwrap();
        assert_eq!(file.content, "def main():\n    print(\"hi\")");
        assert_eq!(
            *sandbox.ops.lock().await,
            vec![
                MirrorOp::CreateDir("src".to_string()),
                MirrorOp::Upload {
                    path: "src/main.py".to_string(),
                    content: file.content.clone(),
                },
            ]
        );
        assert_eq!(events.recv().await.unwrap(), UiEvent::WorkspaceReload);
    }

    #[tokio::test]
    async fn create_file_twice_updates() {
        let (store, _, handler) = setup();
        let context = context();
        let first = block("\nACTION: CreateFile\nNAME: a.txt\nCONTENT: one\n");
        handler.handle(&first, &context).await.unwrap();
        let output = handler
            .handle(&block("\nACTION: CreateFile\nNAME: a.txt\nCONTENT: two\n"), &context)
            .await
            .unwrap();
        assert_eq!(output.text, "Updated file `a.txt`.");
        let project = project_id(&store).await;
        assert_eq!(store.list_tree(&project).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mirror_failure_keeps_local_commit() {
        let store = Arc::new(MemoryWorkspace::new());
        let sandbox = Arc::new(RecordingSandbox {
            fail: true,
            ..RecordingSandbox::default()
        });
        let handler = WorkspaceHandler::new(store.clone()).with_sandbox(sandbox);
        let output = handler
            .handle(&block("\nACTION: CreateFolder\nPATH: assets/img\n"), &context())
            .await
            .unwrap();
        assert_eq!(output.text, "Created folder `assets/img`.");
        let project = project_id(&store).await;
        assert!(store.find(&project, "assets/img").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rename_folder_mirrors_contents() {
        let (store, sandbox, handler) = setup();
        let context = context();
        handler
            .handle(&block("\nACTION: CreateFile\nPATH: src/lib.rs\nCONTENT: // lib\n"), &context)
            .await
            .unwrap();
        sandbox.ops.lock().await.clear();
        let output = handler
            .handle(
                &block("\nACTION: RenameFolder\nPATH: src\nNEW_NAME: source\n"),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(output.text, "Renamed `src` to `source`.");
        let project = project_id(&store).await;
        assert!(store.find(&project, "source/lib.rs").await.unwrap().is_some());
        assert_eq!(
            *sandbox.ops.lock().await,
            vec![
                MirrorOp::CreateDir("source".to_string()),
                MirrorOp::Upload {
                    path: "source/lib.rs".to_string(),
                    content: "// lib".to_string(),
                },
                MirrorOp::Delete("src".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn rename_file_by_new_path() {
        let (store, _, handler) = setup();
        let context = context();
        handler
            .handle(&block("\nACTION: CreateFile\nPATH: a.txt\n"), &context)
            .await
            .unwrap();
        handler
            .handle(
                &block("\nACTION: RenameFile\nPATH: a.txt\nNEW_PATH: b.txt\n"),
                &context,
            )
            .await
            .unwrap();
        let project = project_id(&store).await;
        assert!(store.find(&project, "b.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_checks_kind() {
        let (store, sandbox, handler) = setup();
        let context = context();
        handler
            .handle(&block("\nACTION: CreateFile\nPATH: docs/readme.md\n"), &context)
            .await
            .unwrap();
        let err = handler
            .handle(&block("\nACTION: DeleteFile\nPATH: docs\n"), &context)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        handler
            .handle(&block("\nACTION: DeleteFolder\nPATH: docs\n"), &context)
            .await
            .unwrap();
        let project = project_id(&store).await;
        assert!(store.list_tree(&project).await.unwrap().is_empty());
        assert_eq!(
            sandbox.ops.lock().await.last(),
            Some(&MirrorOp::Delete("docs".to_string()))
        );
    }

    #[tokio::test]
    async fn open_emits_event_and_leaves_block() {
        let (store, sandbox, handler) = setup();
        let context = context();
        handler
            .handle(&block("\nACTION: CreateFile\nPATH: logo.png\n"), &context)
            .await
            .unwrap();
        let mut events = context.subscribe();
        sandbox.ops.lock().await.clear();
        let output = handler
            .handle(&block("\nACTION: OpenMedia\nPATH: logo.png\n"), &context)
            .await
            .unwrap();
        assert_eq!(output, HandlerOutput::leave());
        let project = project_id(&store).await;
        let file = store.find(&project, "logo.png").await.unwrap().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            UiEvent::OpenMedia {
                file_id: file.id,
                name: "logo.png".to_string(),
            }
        );
        assert!(sandbox.ops.lock().await.is_empty());
    }

    #[tokio::test]
    async fn missing_entries_and_parent_escapes_fail() {
        let (_, _, handler) = setup();
        let context = context();
        let err = handler
            .handle(&block("\nACTION: OpenFile\nPATH: nope.txt\n"), &context)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = handler
            .handle(&block("\nACTION: CreateFile\nPATH: ../escape.txt\n"), &context)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
