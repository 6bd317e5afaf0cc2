//! The virtual workspace: projects holding a tree of folders and files.
//!
//! Entries are keyed by id and linked to their parent folder by id.  Paths are
//! a convenience computed from that linkage; they are never stored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utf8path::{Component, Path};
use uuid::Uuid;

use crate::{Error, Result};

/// A workspace project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique id.
    pub id: String,

    /// Logical name; also the sandbox key.
    pub name: String,
}

/// Whether an entry is a file or a folder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A regular file with text content.
    File,

    /// A folder that may hold other entries.
    Folder,
}

/// A file or folder inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Unique id.
    pub id: String,

    /// Id of the owning project.
    pub project: String,

    /// Name within the parent folder.
    pub name: String,

    /// Id of the parent folder, or `None` at the project root.
    pub parent: Option<String>,

    /// File or folder.
    pub kind: EntryKind,

    /// File content; empty for folders.
    #[serde(default)]
    pub content: String,
}

impl WorkspaceEntry {
    /// Returns true if this entry is a folder.
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// CRUD over projects, folders, and files.
#[async_trait::async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Create a new, empty project.
    async fn create_project(&self, name: &str) -> Result<Project>;

    /// Find a project by its logical name.
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>>;

    /// Create a folder under `parent` (or the project root).
    async fn create_folder(
        &self,
        project: &str,
        parent: Option<&str>,
        name: &str,
    ) -> Result<WorkspaceEntry>;

    /// Create a file under `parent` (or the project root).
    async fn create_file(
        &self,
        project: &str,
        parent: Option<&str>,
        name: &str,
        content: &str,
    ) -> Result<WorkspaceEntry>;

    /// Replace a file's content.
    async fn write_file(&self, id: &str, content: &str) -> Result<WorkspaceEntry>;

    /// Rename an entry in place.
    async fn rename(&self, id: &str, new_name: &str) -> Result<WorkspaceEntry>;

    /// Delete an entry and, for folders, everything beneath it.
    ///
    /// Returns the removed entries, the named entry first.
    async fn delete(&self, id: &str) -> Result<Vec<WorkspaceEntry>>;

    /// Resolve a `/`-separated path within a project.
    async fn find(&self, project: &str, path: &str) -> Result<Option<WorkspaceEntry>>;

    /// Every entry of a project.
    async fn list_tree(&self, project: &str) -> Result<Vec<WorkspaceEntry>>;

    /// The `/`-separated path of an entry relative to its project root.
    async fn path_of(&self, id: &str) -> Result<String>;
}

/// Split a workspace path into its segments.
///
/// Leading and trailing slashes and `.` segments are ignored.  `..` and
/// empty paths are rejected.
pub fn path_segments(path: &str) -> Result<Vec<String>> {
    let parsed = Path::from(path.trim());
    if parsed
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::AppDefined))
    {
        return Err(Error::validation(
            format!("path may not contain `..`: {path}"),
            Some("PATH".to_string()),
        ));
    }
    let segments: Vec<String> = parsed
        .as_str()
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(String::from)
        .collect();
    if segments.is_empty() {
        return Err(Error::validation(
            format!("empty workspace path: {path:?}"),
            Some("PATH".to_string()),
        ));
    }
    Ok(segments)
}

/// Render a project's entries as an indented tree, folders first.
pub fn render_tree(project: &Project, entries: &[WorkspaceEntry]) -> String {
    fn walk<'a>(
        out: &mut String,
        children: &HashMap<Option<&'a str>, Vec<&'a WorkspaceEntry>>,
        parent: Option<&'a str>,
        depth: usize,
    ) {
        let Some(list) = children.get(&parent) else {
            return;
        };
        for entry in list {
            out.push_str(&"  ".repeat(depth + 1));
            out.push_str(&entry.name);
            if entry.is_folder() {
                out.push('/');
            }
            out.push('\n');
            if entry.is_folder() {
                walk(out, children, Some(entry.id.as_str()), depth + 1);
            }
        }
    }

    let mut children: HashMap<Option<&str>, Vec<&WorkspaceEntry>> = HashMap::new();
    for entry in entries {
        children
            .entry(entry.parent.as_deref())
            .or_default()
            .push(entry);
    }
    for list in children.values_mut() {
        list.sort_by(|a, b| {
            b.is_folder()
                .cmp(&a.is_folder())
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    let mut out = format!("{}/\n", project.name);
    walk(&mut out, &children, None, 0);
    out
}

#[derive(Debug, Default)]
struct WorkspaceState {
    projects: HashMap<String, Project>,
    entries: HashMap<String, WorkspaceEntry>,
}

impl WorkspaceState {
    fn entry(&self, id: &str) -> Result<&WorkspaceEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::not_found(format!("no workspace entry {id}"), Some("entry".to_string())))
    }

    fn check_project(&self, project: &str) -> Result<()> {
        if self.projects.contains_key(project) {
            Ok(())
        } else {
            Err(Error::not_found(
                format!("no project {project}"),
                Some("project".to_string()),
            ))
        }
    }

    fn check_parent(&self, project: &str, parent: Option<&str>) -> Result<()> {
        if let Some(parent) = parent {
            let entry = self.entry(parent)?;
            if entry.project != project || !entry.is_folder() {
                return Err(Error::validation(
                    format!("{} is not a folder in this project", entry.name),
                    Some("parent".to_string()),
                ));
            }
        }
        Ok(())
    }

    fn sibling(&self, project: &str, parent: Option<&str>, name: &str) -> Option<&WorkspaceEntry> {
        self.entries
            .values()
            .find(|e| e.project == project && e.parent.as_deref() == parent && e.name == name)
    }

    fn insert(
        &mut self,
        project: &str,
        parent: Option<&str>,
        name: &str,
        kind: EntryKind,
        content: &str,
    ) -> Result<WorkspaceEntry> {
        self.check_project(project)?;
        self.check_parent(project, parent)?;
        check_name(name)?;
        if self.sibling(project, parent, name).is_some() {
            return Err(Error::validation(
                format!("{name} already exists"),
                Some("NAME".to_string()),
            ));
        }
        let entry = WorkspaceEntry {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            name: name.to_string(),
            parent: parent.map(String::from),
            kind,
            content: content.to_string(),
        };
        self.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::validation(
            format!("invalid entry name: {name:?}"),
            Some("NAME".to_string()),
        ));
    }
    Ok(())
}

/// An in-memory [`WorkspaceStore`].
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    state: Mutex<WorkspaceState>,
}

impl MemoryWorkspace {
    /// Create an empty workspace.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WorkspaceStore for MemoryWorkspace {
    async fn create_project(&self, name: &str) -> Result<Project> {
        check_name(name)?;
        let mut state = self.state.lock().await;
        if state.projects.values().any(|p| p.name == name) {
            return Err(Error::validation(
                format!("project {name} already exists"),
                Some("PROJECT".to_string()),
            ));
        }
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let state = self.state.lock().await;
        Ok(state.projects.values().find(|p| p.name == name).cloned())
    }

    async fn create_folder(
        &self,
        project: &str,
        parent: Option<&str>,
        name: &str,
    ) -> Result<WorkspaceEntry> {
        let mut state = self.state.lock().await;
        state.insert(project, parent, name, EntryKind::Folder, "")
    }

    async fn create_file(
        &self,
        project: &str,
        parent: Option<&str>,
        name: &str,
        content: &str,
    ) -> Result<WorkspaceEntry> {
        let mut state = self.state.lock().await;
        state.insert(project, parent, name, EntryKind::File, content)
    }

    async fn write_file(&self, id: &str, content: &str) -> Result<WorkspaceEntry> {
        let mut state = self.state.lock().await;
        if state.entry(id)?.is_folder() {
            return Err(Error::validation("cannot write to a folder", None));
        }
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no workspace entry {id}"), None))?;
        entry.content = content.to_string();
        Ok(entry.clone())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<WorkspaceEntry> {
        check_name(new_name)?;
        let mut state = self.state.lock().await;
        let current = state.entry(id)?.clone();
        if let Some(other) =
            state.sibling(&current.project, current.parent.as_deref(), new_name)
            && other.id != id
        {
            return Err(Error::validation(
                format!("{new_name} already exists"),
                Some("NEW_NAME".to_string()),
            ));
        }
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no workspace entry {id}"), None))?;
        entry.name = new_name.to_string();
        Ok(entry.clone())
    }

    async fn delete(&self, id: &str) -> Result<Vec<WorkspaceEntry>> {
        let mut state = self.state.lock().await;
        state.entry(id)?;
        let mut doomed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = doomed[cursor].clone();
            doomed.extend(
                state
                    .entries
                    .values()
                    .filter(|e| e.parent.as_deref() == Some(parent.as_str()))
                    .map(|e| e.id.clone()),
            );
            cursor += 1;
        }
        Ok(doomed
            .iter()
            .filter_map(|id| state.entries.remove(id))
            .collect())
    }

    async fn find(&self, project: &str, path: &str) -> Result<Option<WorkspaceEntry>> {
        let segments = path_segments(path)?;
        let state = self.state.lock().await;
        state.check_project(project)?;
        let mut parent: Option<String> = None;
        let mut found = None;
        for segment in &segments {
            match state.sibling(project, parent.as_deref(), segment) {
                Some(entry) => {
                    parent = Some(entry.id.clone());
                    found = Some(entry);
                }
                None => return Ok(None),
            }
        }
        Ok(found.cloned())
    }

    async fn list_tree(&self, project: &str) -> Result<Vec<WorkspaceEntry>> {
        let state = self.state.lock().await;
        state.check_project(project)?;
        Ok(state
            .entries
            .values()
            .filter(|e| e.project == project)
            .cloned()
            .collect())
    }

    async fn path_of(&self, id: &str) -> Result<String> {
        let state = self.state.lock().await;
        let mut names = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(id) = cursor {
            let entry = state.entry(&id)?;
            names.push(entry.name.clone());
            cursor = entry.parent.clone();
        }
        names.reverse();
        Ok(names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments() {
        assert_eq!(path_segments("/src/./main.py").unwrap(), vec!["src", "main.py"]);
        assert!(path_segments("src/../../etc/passwd").unwrap_err().is_validation());
        assert!(path_segments("  ").unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn create_find_and_path() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        let src = ws.create_folder(&project.id, None, "src").await.unwrap();
        let main = ws
            .create_file(&project.id, Some(&src.id), "main.py", "print()")
            .await
            .unwrap();
        let found = ws.find(&project.id, "src/main.py").await.unwrap().unwrap();
        assert_eq!(found.id, main.id);
        assert_eq!(ws.path_of(&main.id).await.unwrap(), "src/main.py");
        assert!(ws.find(&project.id, "src/other.py").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        ws.create_file(&project.id, None, "a.txt", "").await.unwrap();
        let err = ws
            .create_file(&project.id, None, "a.txt", "")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(ws.create_project("demo").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn files_cannot_parent_entries() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        let file = ws.create_file(&project.id, None, "a.txt", "").await.unwrap();
        let err = ws
            .create_file(&project.id, Some(&file.id), "b.txt", "")
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn rename_and_write() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        let file = ws.create_file(&project.id, None, "a.txt", "1").await.unwrap();
        ws.rename(&file.id, "b.txt").await.unwrap();
        let updated = ws.write_file(&file.id, "2").await.unwrap();
        assert_eq!(updated.name, "b.txt");
        assert_eq!(updated.content, "2");
        assert!(ws.find(&project.id, "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_recursive() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        let src = ws.create_folder(&project.id, None, "src").await.unwrap();
        let nested = ws.create_folder(&project.id, Some(&src.id), "util").await.unwrap();
        ws.create_file(&project.id, Some(&nested.id), "x.rs", "").await.unwrap();
        ws.create_file(&project.id, None, "README", "").await.unwrap();
        let removed = ws.delete(&src.id).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0].id, src.id);
        assert_eq!(ws.list_tree(&project.id).await.unwrap().len(), 1);
        assert!(ws.delete(&src.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn tree_rendering() {
        let ws = MemoryWorkspace::new();
        let project = ws.create_project("demo").await.unwrap();
        let src = ws.create_folder(&project.id, None, "src").await.unwrap();
        ws.create_file(&project.id, Some(&src.id), "main.py", "").await.unwrap();
        ws.create_file(&project.id, None, "README.md", "").await.unwrap();
        let entries = ws.list_tree(&project.id).await.unwrap();
        assert_eq!(
            render_tree(&project, &entries),
            "demo/\n  src/\n    main.py\n  README.md\n"
        );
    }
}
