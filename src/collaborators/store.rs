use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use utf8path::Path;

use crate::types::{Conversation, ConversationId};
use crate::{Error, Result};

/// Persistence for conversations: one record per conversation.
///
/// Writes are fire-and-forget and may arrive out of order, so `save` must
/// ignore a record whose `revision` is older than the one already stored, and
/// must never resurrect a deleted conversation.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Store `conversation` unless a newer revision is already stored.
    ///
    /// Returns false when the write was ignored as stale.
    async fn save(&self, conversation: &Conversation) -> Result<bool>;

    /// Load a conversation.
    async fn load(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// Delete a conversation.  Later saves for the same id are ignored.
    async fn delete(&self, id: ConversationId) -> Result<()>;

    /// Ids of every stored conversation.
    async fn list(&self) -> Result<Vec<ConversationId>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    deleted: HashSet<ConversationId>,
}

/// An in-memory [`ConversationStore`].
///
/// ```
/// # tokio_test::block_on(async {
/// use directive_chat::Conversation;
/// use directive_chat::collaborators::{ConversationStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// let conversation = Conversation::new();
/// assert!(store.save(&conversation).await.unwrap());
/// store.delete(conversation.id).await.unwrap();
/// assert!(!store.save(&conversation).await.unwrap());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryStore {
    async fn save(&self, conversation: &Conversation) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.deleted.contains(&conversation.id) {
            return Ok(false);
        }
        if let Some(existing) = state.conversations.get(&conversation.id)
            && existing.revision > conversation.revision
        {
            return Ok(false);
        }
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(true)
    }

    async fn load(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let state = self.state.lock().await;
        Ok(state.conversations.get(&id).cloned())
    }

    async fn delete(&self, id: ConversationId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.conversations.remove(&id);
        state.deleted.insert(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationId>> {
        let state = self.state.lock().await;
        Ok(state.conversations.keys().copied().collect())
    }
}

#[derive(Debug, Default)]
struct FileState {
    revisions: HashMap<ConversationId, u64>,
    deleted: HashSet<ConversationId>,
}

/// A [`ConversationStore`] that keeps one pretty-printed JSON file per
/// conversation under a directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: Path<'static>,
    state: Mutex<FileState>,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: &str) -> Result<Self> {
        let dir = Path::from(dir).into_owned();
        tokio::fs::create_dir_all(dir.as_str())
            .await
            .map_err(|e| Error::io(format!("cannot create {}", dir.as_str()), e))?;
        Ok(Self {
            dir,
            state: Mutex::new(FileState::default()),
        })
    }

    fn record_path(&self, id: ConversationId) -> Path<'static> {
        self.dir.join(format!("{id}.json").as_str()).into_owned()
    }

    async fn stored_revision(&self, id: ConversationId) -> Result<Option<u64>> {
        Ok(self.load(id).await?.map(|c| c.revision))
    }
}

#[async_trait::async_trait]
impl ConversationStore for JsonFileStore {
    async fn save(&self, conversation: &Conversation) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.deleted.contains(&conversation.id) {
            return Ok(false);
        }
        let known = match state.revisions.get(&conversation.id) {
            Some(revision) => Some(*revision),
            None => self.stored_revision(conversation.id).await?,
        };
        if known.is_some_and(|revision| revision > conversation.revision) {
            return Ok(false);
        }
        let path = self.record_path(conversation.id);
        let tmp = format!("{}.tmp", path.as_str());
        let json = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::io(format!("cannot write {tmp}"), e))?;
        tokio::fs::rename(&tmp, path.as_str())
            .await
            .map_err(|e| Error::io(format!("cannot replace {}", path.as_str()), e))?;
        state
            .revisions
            .insert(conversation.id, conversation.revision);
        Ok(true)
    }

    async fn load(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let path = self.record_path(id);
        match tokio::fs::read(path.as_str()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("cannot read {}", path.as_str()), e)),
        }
    }

    async fn delete(&self, id: ConversationId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.deleted.insert(id);
        state.revisions.remove(&id);
        let path = self.record_path(id);
        match tokio::fs::remove_file(path.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("cannot remove {}", path.as_str()), e)),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationId>> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(self.dir.as_str())
            .await
            .map_err(|e| Error::io(format!("cannot list {}", self.dir.as_str()), e))?;
        while let Some(dirent) = dir
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("cannot list {}", self.dir.as_str()), e))?
        {
            let name = dirent.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json"))
                && let Ok(id) = stem.parse::<ConversationId>()
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
