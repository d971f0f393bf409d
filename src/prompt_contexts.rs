//! Named prompt contexts.
//!
//! A user keeps any number of named contexts (free text plus uploaded
//! reference files) and marks one active. The list and the active id are
//! two synced keys; every mutation goes through `write_with` so concurrent
//! edits in one context compose instead of overwriting each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cell::SyncedCell;
use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::schema::keys;

/// File uploaded to the assistant backend for retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFile {
    pub id: String,
    pub name: String,
    /// Id assigned by the backend after upload
    pub remote_file_id: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl ContextFile {
    pub fn new(name: impl Into<String>, remote_file_id: impl Into<String>, size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            remote_file_id: remote_file_id.into(),
            size,
            uploaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptContext {
    pub id: String,
    pub name: String,
    /// Text included in prompts
    pub text_content: String,
    pub files: Vec<ContextFile>,
    /// Backend vector store used for file search
    pub vector_store_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromptContext {
    /// Empty context named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            text_content: String::new(),
            files: Vec::new(),
            vector_store_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The context list and active selection of one execution context.
pub struct PromptContexts {
    contexts: SyncedCell<Vec<PromptContext>>,
    active_id: SyncedCell<Option<String>>,
}

impl PromptContexts {
    pub fn bind(ctx: &Arc<SyncContext>) -> SyncResult<Self> {
        Ok(Self {
            contexts: keys::PROMPT_CONTEXTS.bind(ctx)?,
            active_id: keys::ACTIVE_CONTEXT_ID.bind(ctx)?,
        })
    }

    pub async fn hydrated(&self) {
        tokio::join!(self.contexts.hydrated(), self.active_id.hydrated());
    }

    pub fn list(&self) -> Vec<PromptContext> {
        self.contexts.read()
    }

    pub fn get(&self, id: &str) -> Option<PromptContext> {
        self.contexts.read().into_iter().find(|c| c.id == id)
    }

    pub fn active_id(&self) -> Option<String> {
        self.active_id.read()
    }

    /// The active context, if one is selected and still exists.
    pub fn active(&self) -> Option<PromptContext> {
        self.active_id().and_then(|id| self.get(&id))
    }

    pub fn set_active(&self, id: Option<String>) -> bool {
        self.active_id.write(id)
    }

    /// Create a context and make it active. `None` if the cells have not
    /// hydrated yet.
    pub fn add(&self, name: impl Into<String>) -> Option<PromptContext> {
        let created = PromptContext::new(name);
        let entry = created.clone();
        if !self.contexts.write_with(move |prev| {
            let mut next = prev.clone();
            next.push(entry);
            next
        }) {
            return None;
        }
        self.active_id.write(Some(created.id.clone()));
        Some(created)
    }

    /// Remove a context, clearing the active selection if it pointed there.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.contexts.write_with(|prev| {
            prev.iter().filter(|c| c.id != id).cloned().collect()
        });
        if removed {
            self.active_id.write_with(|active| match active {
                Some(current) if current == id => None,
                other => other.clone(),
            });
        }
        removed
    }

    pub fn rename(&self, id: &str, name: impl Into<String>) -> bool {
        let name = name.into();
        self.modify(id, move |c| c.name = name)
    }

    pub fn set_text(&self, id: &str, text: impl Into<String>) -> bool {
        let text = text.into();
        self.modify(id, move |c| c.text_content = text)
    }

    pub fn add_file(&self, id: &str, file: ContextFile) -> bool {
        self.modify(id, move |c| c.files.push(file))
    }

    pub fn remove_file(&self, id: &str, file_id: &str) -> bool {
        self.modify(id, |c| c.files.retain(|f| f.id != file_id))
    }

    pub fn set_vector_store(&self, id: &str, vector_store_id: Option<String>) -> bool {
        self.modify(id, move |c| c.vector_store_id = vector_store_id)
    }

    fn modify<F>(&self, id: &str, change: F) -> bool
    where
        F: FnOnce(&mut PromptContext),
    {
        self.contexts.write_with(|prev| {
            let mut next = prev.clone();
            if let Some(target) = next.iter_mut().find(|c| c.id == id) {
                change(target);
                target.updated_at = Utc::now();
            }
            next
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ContextKind;
    use crate::store::InMemoryStore;

    async fn contexts() -> (Arc<SyncContext>, PromptContexts) {
        let ctx = SyncContext::builder(Arc::new(InMemoryStore::new()))
            .kind(ContextKind::InteractiveSurface)
            .build()
            .unwrap();
        let contexts = PromptContexts::bind(&ctx).unwrap();
        contexts.hydrated().await;
        (ctx, contexts)
    }

    #[tokio::test]
    async fn test_add_activates_new_context() {
        let (_ctx, contexts) = contexts().await;

        let biology = contexts.add("Biology").unwrap();
        let history = contexts.add("History").unwrap();

        assert_eq!(contexts.list().len(), 2);
        assert_eq!(contexts.active_id(), Some(history.id.clone()));
        assert_eq!(contexts.get(&biology.id).unwrap().name, "Biology");
    }

    #[tokio::test]
    async fn test_delete_active_clears_selection() {
        let (_ctx, contexts) = contexts().await;
        let keep = contexts.add("Keep").unwrap();
        let drop_me = contexts.add("Drop").unwrap();

        assert!(contexts.delete(&drop_me.id));
        assert_eq!(contexts.active_id(), None);

        contexts.set_active(Some(keep.id.clone()));
        assert!(contexts.delete("missing"));
        assert_eq!(contexts.active_id(), Some(keep.id));
    }

    #[tokio::test]
    async fn test_edits_bump_updated_at() {
        let (_ctx, contexts) = contexts().await;
        let created = contexts.add("Notes").unwrap();

        contexts.rename(&created.id, "Lecture notes");
        contexts.set_text(&created.id, "Chapter 3 only");
        contexts.set_vector_store(&created.id, Some("vs_1".to_string()));

        let edited = contexts.active().unwrap();
        assert_eq!(edited.name, "Lecture notes");
        assert_eq!(edited.text_content, "Chapter 3 only");
        assert_eq!(edited.vector_store_id.as_deref(), Some("vs_1"));
        assert!(edited.updated_at >= created.updated_at);
        assert_eq!(edited.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_files_add_and_remove() {
        let (_ctx, contexts) = contexts().await;
        let created = contexts.add("Papers").unwrap();
        let first = ContextFile::new("a.pdf", "file-a", 1024);
        let second = ContextFile::new("b.pdf", "file-b", 2048);

        contexts.add_file(&created.id, first.clone());
        contexts.add_file(&created.id, second.clone());
        contexts.remove_file(&created.id, &first.id);

        let files = contexts.get(&created.id).unwrap().files;
        assert_eq!(files, vec![second]);
    }

    #[tokio::test]
    async fn test_add_before_hydration_is_dropped() {
        let ctx = SyncContext::builder(Arc::new(InMemoryStore::new()))
            .kind(ContextKind::InteractiveSurface)
            .build()
            .unwrap();
        let contexts = PromptContexts::bind(&ctx).unwrap();

        assert!(contexts.add("Too early").is_none());
        contexts.hydrated().await;
        assert!(contexts.list().is_empty());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let context = PromptContext::new("x");
        let encoded = serde_json::to_value(&context).unwrap();
        assert!(encoded.get("textContent").is_some());
        assert!(encoded.get("vectorStoreId").is_some());
    }
}
