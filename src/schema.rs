//! Canonical configuration schema.
//!
//! Flat keys, one per logical value, namespaced under a versioned prefix.
//! There is no migration step: changing the shape of a value means bumping
//! [`SCHEMA_VERSION`], which moves every key to a new prefix. The version in
//! use is stamped into the store so a context running an older build fails
//! loudly instead of silently reading the other shape.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::cell::{CellValue, SyncedCell};
use crate::config::DebounceClass;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};

/// Version of the key layout below.
pub const SCHEMA_VERSION: u32 = 1;

/// Prefix shared by every key of [`SCHEMA_VERSION`].
pub const KEY_PREFIX: &str = "synced-state.v1";

/// Store key holding the schema version. Deliberately unversioned.
pub const SCHEMA_VERSION_KEY: &str = "synced-state.schema-version";

/// Typed descriptor of one configuration key.
pub struct KeySpec<T> {
    pub name: &'static str,
    pub class: DebounceClass,
    pub default: fn() -> T,
}

impl<T: CellValue> KeySpec<T> {
    /// Full store key, including the versioned prefix.
    pub fn key(&self) -> String {
        format!("{KEY_PREFIX}.{}", self.name)
    }

    /// Bind a cell for this key in `ctx`.
    pub fn bind(&self, ctx: &Arc<SyncContext>) -> SyncResult<SyncedCell<T>> {
        SyncedCell::create_with_class(ctx, self.key(), (self.default)(), self.class)
    }
}

/// Model the assistant backend is asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssistantModel {
    #[serde(rename = "gpt-4-turbo")]
    Gpt4Turbo,
    #[default]
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
    #[serde(rename = "gpt-4o")]
    Gpt4o,
}

/// How prominently embedded pages show the solve button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonVisibility {
    #[default]
    Visible,
    BarelyVisible,
    NotVisible,
}

pub mod keys {
    use super::*;
    use crate::prompt_contexts::PromptContext;

    pub const API_KEY: KeySpec<String> = KeySpec {
        name: "api-key",
        class: DebounceClass::FreeText,
        default: String::new,
    };

    pub const ASSISTANT_MODEL: KeySpec<AssistantModel> = KeySpec {
        name: "assistant-model",
        class: DebounceClass::Discrete,
        default: Default::default,
    };

    pub const ADDITIONAL_CONTEXT: KeySpec<String> = KeySpec {
        name: "additional-context",
        class: DebounceClass::FreeText,
        default: String::new,
    };

    pub const BUTTON_VISIBILITY: KeySpec<ButtonVisibility> = KeySpec {
        name: "button-visibility",
        class: DebounceClass::Discrete,
        default: Default::default,
    };

    /// Counter-measure against test portals that detect tab switches.
    pub const ANTI_TAMPERING: KeySpec<bool> = KeySpec {
        name: "anti-anti-tampering",
        class: DebounceClass::Discrete,
        default: Default::default,
    };

    pub const PROMPT_CONTEXTS: KeySpec<Vec<PromptContext>> = KeySpec {
        name: "prompt-contexts",
        class: DebounceClass::FreeText,
        default: Vec::new,
    };

    pub const ACTIVE_CONTEXT_ID: KeySpec<Option<String>> = KeySpec {
        name: "active-context-id",
        class: DebounceClass::Discrete,
        default: Default::default,
    };
}

/// Record the schema version in the store, or fail if a different one is
/// already there.
pub async fn stamp(ctx: &SyncContext) -> SyncResult<()> {
    match ctx.persistence().get(SCHEMA_VERSION_KEY).await? {
        None => {
            ctx.persistence()
                .enqueue_set(SCHEMA_VERSION_KEY, json!(SCHEMA_VERSION));
            info!(version = SCHEMA_VERSION, "Schema version stamped");
            Ok(())
        }
        Some(stored) => {
            let stored = stored
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            if stored == SCHEMA_VERSION {
                Ok(())
            } else {
                Err(SyncError::SchemaMismatch {
                    stored,
                    expected: SCHEMA_VERSION,
                })
            }
        }
    }
}

/// The extension's settings, one cell per key.
pub struct PluginConfig {
    pub api_key: SyncedCell<String>,
    pub assistant_model: SyncedCell<AssistantModel>,
    pub additional_context: SyncedCell<String>,
    pub button_visibility: SyncedCell<ButtonVisibility>,
    pub anti_tampering: SyncedCell<bool>,
}

/// Point-in-time copy of [`PluginConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfigSnapshot {
    pub api_key: String,
    pub assistant_model: AssistantModel,
    pub additional_context: String,
    pub button_visibility: ButtonVisibility,
    pub anti_tampering: bool,
}

impl PluginConfig {
    pub fn bind(ctx: &Arc<SyncContext>) -> SyncResult<Self> {
        Ok(Self {
            api_key: keys::API_KEY.bind(ctx)?,
            assistant_model: keys::ASSISTANT_MODEL.bind(ctx)?,
            additional_context: keys::ADDITIONAL_CONTEXT.bind(ctx)?,
            button_visibility: keys::BUTTON_VISIBILITY.bind(ctx)?,
            anti_tampering: keys::ANTI_TAMPERING.bind(ctx)?,
        })
    }

    /// Wait for every cell to hydrate.
    pub async fn hydrated(&self) {
        tokio::join!(
            self.api_key.hydrated(),
            self.assistant_model.hydrated(),
            self.additional_context.hydrated(),
            self.button_visibility.hydrated(),
            self.anti_tampering.hydrated(),
        );
    }

    pub fn snapshot(&self) -> PluginConfigSnapshot {
        PluginConfigSnapshot {
            api_key: self.api_key.read(),
            assistant_model: self.assistant_model.read(),
            additional_context: self.additional_context.read(),
            button_visibility: self.button_visibility.read(),
            anti_tampering: self.anti_tampering.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ContextKind;
    use crate::store::{InMemoryStore, PersistentStore};

    fn context(store: &InMemoryStore) -> Arc<SyncContext> {
        SyncContext::builder(Arc::new(store.clone()))
            .kind(ContextKind::SettingsSurface)
            .build()
            .unwrap()
    }

    #[test]
    fn test_keys_are_versioned() {
        assert_eq!(keys::API_KEY.key(), "synced-state.v1.api-key");
        assert_eq!(
            keys::BUTTON_VISIBILITY.key(),
            "synced-state.v1.button-visibility"
        );
        assert_eq!(
            keys::ANTI_TAMPERING.key(),
            "synced-state.v1.anti-anti-tampering"
        );
    }

    #[test]
    fn test_enum_wire_values() {
        assert_eq!(
            serde_json::to_value(AssistantModel::Gpt35Turbo).unwrap(),
            json!("gpt-3.5-turbo")
        );
        assert_eq!(
            serde_json::to_value(ButtonVisibility::BarelyVisible).unwrap(),
            json!("barely_visible")
        );
    }

    #[tokio::test]
    async fn test_plugin_config_defaults() {
        let store = InMemoryStore::new();
        let ctx = context(&store);
        let config = PluginConfig::bind(&ctx).unwrap();
        config.hydrated().await;

        let snapshot = config.snapshot();
        assert_eq!(snapshot.api_key, "");
        assert_eq!(snapshot.assistant_model, AssistantModel::Gpt35Turbo);
        assert_eq!(snapshot.button_visibility, ButtonVisibility::Visible);
        assert!(!snapshot.anti_tampering);
        assert_eq!(config.anti_tampering.class(), DebounceClass::Discrete);
    }

    #[tokio::test]
    async fn test_plugin_config_reads_stored_values() {
        let store = InMemoryStore::new();
        store
            .set(&keys::ASSISTANT_MODEL.key(), json!("gpt-4o"))
            .await
            .unwrap();
        let ctx = context(&store);
        let config = PluginConfig::bind(&ctx).unwrap();
        config.hydrated().await;

        assert_eq!(config.assistant_model.read(), AssistantModel::Gpt4o);
        assert_eq!(config.assistant_model.class(), DebounceClass::Discrete);
    }

    #[tokio::test]
    async fn test_stamp_writes_then_accepts_version() {
        let store = InMemoryStore::new();
        let ctx = context(&store);

        stamp(&ctx).await.unwrap();
        ctx.flush().await.unwrap();
        assert_eq!(
            store.get(SCHEMA_VERSION_KEY).await.unwrap(),
            Some(json!(SCHEMA_VERSION))
        );

        stamp(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_stamp_rejects_other_version() {
        let store = InMemoryStore::new();
        store.set(SCHEMA_VERSION_KEY, json!(2)).await.unwrap();
        let ctx = context(&store);

        let err = stamp(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::SchemaMismatch {
                stored: 2,
                expected: SCHEMA_VERSION
            }
        ));
    }
}
