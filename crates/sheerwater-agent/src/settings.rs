//! Model and system-prompt settings, layered by scope

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StoreError;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant for meteorologists and forecasters. You have access to the Sheerwater \
benchmarking platform through various tools.

Your capabilities include:
1. **Forecast evaluation**: Compare forecast models against ground truth using metrics (MAE, RMSE, bias, etc.)
2. **Data discovery**: List available forecast models, metrics, and ground truth datasets
3. **Visualization**: Create ANY chart, map, or plot using `tool_render_plotly`

## Visualization — IMPORTANT

You have full Plotly flexibility via `tool_render_plotly`. When a user asks you to create a chart, \
map, or visualization of ANY kind, use this tool. Do not refuse visualization requests — construct \
the best Plotly figure specification you can. You can create bar charts, line charts, scatter plots, \
choropleth maps, geographic scatter maps, heatmaps, and anything else Plotly supports.

If you need data to populate a visualization, use the evaluation tools to fetch it first, \
then pass the results to `tool_render_plotly`. If the user provides their own data, use it directly.

Be concise and helpful. When presenting data, format it clearly.";

/// Settings in effect for a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub model: String,
    pub system_prompt: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Where a settings layer applies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettingsScope {
    Global,
    User(String),
    Conversation(String),
}

/// A partial settings layer; `None` fields fall through to the next scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.system_prompt.is_none()
    }

    /// Overlay the provided fields of `other` onto this layer
    pub fn merge(&mut self, other: SettingsUpdate) {
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.system_prompt.is_some() {
            self.system_prompt = other.system_prompt;
        }
    }

    /// Override the fields this layer provides
    fn apply_to(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            settings.system_prompt = prompt.clone();
        }
    }
}

/// Persistent settings layers
pub trait SettingsStore: Send + Sync {
    /// The stored layer for one scope (empty if nothing stored)
    fn layer(&self, scope: &SettingsScope) -> Result<SettingsUpdate, StoreError>;

    /// Replace the stored layer for one scope
    fn set_layer(&self, scope: &SettingsScope, layer: SettingsUpdate) -> Result<(), StoreError>;

    /// Effective settings: conversation, then user, then global, then defaults
    fn get(&self, user_id: &str, conversation_id: Option<&str>) -> Result<Settings, StoreError> {
        let mut settings = Settings::default();
        self.layer(&SettingsScope::Global)?.apply_to(&mut settings);
        self.layer(&SettingsScope::User(user_id.to_string()))?
            .apply_to(&mut settings);
        if let Some(id) = conversation_id {
            self.layer(&SettingsScope::Conversation(id.to_string()))?
                .apply_to(&mut settings);
        }
        Ok(settings)
    }

    /// Apply a partial update to one scope, keeping fields it leaves out
    fn put(&self, scope: &SettingsScope, update: SettingsUpdate) -> Result<(), StoreError> {
        let mut layer = self.layer(scope)?;
        layer.merge(update);
        self.set_layer(scope, layer)
    }
}

/// Type alias for a shared settings store
pub type SharedSettingsStore = Arc<dyn SettingsStore>;

/// All stored layers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Layers {
    #[serde(default)]
    global: SettingsUpdate,
    #[serde(default)]
    users: HashMap<String, SettingsUpdate>,
    #[serde(default)]
    conversations: HashMap<String, SettingsUpdate>,
}

impl Layers {
    fn get(&self, scope: &SettingsScope) -> SettingsUpdate {
        match scope {
            SettingsScope::Global => self.global.clone(),
            SettingsScope::User(id) => self.users.get(id).cloned().unwrap_or_default(),
            SettingsScope::Conversation(id) => self.conversations.get(id).cloned().unwrap_or_default(),
        }
    }

    fn set(&mut self, scope: &SettingsScope, layer: SettingsUpdate) {
        match scope {
            SettingsScope::Global => self.global = layer,
            SettingsScope::User(id) => {
                if layer.is_empty() {
                    self.users.remove(id);
                } else {
                    self.users.insert(id.clone(), layer);
                }
            }
            SettingsScope::Conversation(id) => {
                if layer.is_empty() {
                    self.conversations.remove(id);
                } else {
                    self.conversations.insert(id.clone(), layer);
                }
            }
        }
    }
}

/// Settings held in memory
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    layers: RwLock<Layers>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn layer(&self, scope: &SettingsScope) -> Result<SettingsUpdate, StoreError> {
        Ok(self.layers.read().get(scope))
    }

    fn set_layer(&self, scope: &SettingsScope, layer: SettingsUpdate) -> Result<(), StoreError> {
        self.layers.write().set(scope, layer);
        Ok(())
    }
}

/// Settings persisted to a single JSON file
pub struct FileSettingsStore {
    path: PathBuf,
    layers: Mutex<Layers>,
}

impl FileSettingsStore {
    /// Open the file at `path`, starting empty if it does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let layers = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Layers::default()
        };
        Ok(Self {
            path,
            layers: Mutex::new(layers),
        })
    }

    /// Write to a sibling temp file then rename over the settings file
    fn persist(&self, layers: &Layers) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(layers)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn layer(&self, scope: &SettingsScope) -> Result<SettingsUpdate, StoreError> {
        Ok(self.layers.lock().get(scope))
    }

    fn set_layer(&self, scope: &SettingsScope, layer: SettingsUpdate) -> Result<(), StoreError> {
        let mut layers = self.layers.lock();
        let mut updated = layers.clone();
        updated.set(scope, layer);
        self.persist(&updated)?;
        *layers = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> SettingsUpdate {
        SettingsUpdate {
            model: Some(name.to_string()),
            system_prompt: None,
        }
    }

    #[test]
    fn test_defaults_when_nothing_stored() {
        let store = MemorySettingsStore::new();
        let settings = store.get("alice", None).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert!(settings.system_prompt.contains("meteorologists"));
    }

    #[test]
    fn test_default_prompt_text() {
        let lines: Vec<&str> = DEFAULT_SYSTEM_PROMPT.lines().collect();
        assert_eq!(
            lines[0],
            "You are a helpful assistant for meteorologists and forecasters. You have access to the \
             Sheerwater benchmarking platform through various tools."
        );
        assert!(lines.contains(&"## Visualization \u{2014} IMPORTANT"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains(
            "Do not refuse visualization requests \u{2014} construct the best Plotly figure"
        ));
        assert_eq!(
            lines.last().copied(),
            Some("Be concise and helpful. When presenting data, format it clearly.")
        );
    }

    #[test]
    fn test_resolution_order() {
        let store = MemorySettingsStore::new();
        store.put(&SettingsScope::Global, model("global-model")).unwrap();
        store
            .put(
                &SettingsScope::Global,
                SettingsUpdate {
                    model: None,
                    system_prompt: Some("global prompt".into()),
                },
            )
            .unwrap();
        store.put(&SettingsScope::User("alice".into()), model("alice-model")).unwrap();
        store
            .put(&SettingsScope::Conversation("c1".into()), model("c1-model"))
            .unwrap();

        let c1 = store.get("alice", Some("c1")).unwrap();
        assert_eq!(c1.model, "c1-model");
        assert_eq!(c1.system_prompt, "global prompt");

        assert_eq!(store.get("alice", Some("c2")).unwrap().model, "alice-model");
        assert_eq!(store.get("bob", None).unwrap().model, "global-model");
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let store = MemorySettingsStore::new();
        let scope = SettingsScope::User("alice".into());
        store
            .put(
                &scope,
                SettingsUpdate {
                    model: Some("m1".into()),
                    system_prompt: Some("p1".into()),
                },
            )
            .unwrap();
        store.put(&scope, model("m2")).unwrap();

        let layer = store.layer(&scope).unwrap();
        assert_eq!(layer.model.as_deref(), Some("m2"));
        assert_eq!(layer.system_prompt.as_deref(), Some("p1"));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileSettingsStore::open(&path).unwrap();
        store.put(&SettingsScope::User("alice".into()), model("saved-model")).unwrap();
        drop(store);

        let reopened = FileSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get("alice", None).unwrap().model, "saved-model");
        assert_eq!(reopened.get("bob", None).unwrap().model, DEFAULT_MODEL);
    }
}
