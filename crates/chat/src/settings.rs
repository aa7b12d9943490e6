use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use nook_llm::{DEFAULT_ENDPOINT, ModelRegistry, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{
    CreateDirSnafu, RenameTempFileSnafu, SerializeConfigSnafu, SettingsError, WriteFileSnafu,
};
use crate::orchestrator::GenerationOptions;

pub const SETTINGS_DIRECTORY_NAME: &str = "nook";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "NOOK_";

pub const DEFAULT_API_KEY: &str = "local";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely.";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_GEN_LEN: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeChoice {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_gen_len")]
    pub max_gen_len: u64,
    #[serde(default = "default_use_persistent_cache")]
    pub use_persistent_cache: bool,
    #[serde(default)]
    pub theme: ThemeChoice,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: default_api_key(),
            default_model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: DEFAULT_TEMPERATURE,
            max_gen_len: DEFAULT_MAX_GEN_LEN,
            use_persistent_cache: true,
            theme: ThemeChoice::default(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self, registry: &ModelRegistry) -> Self {
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        if self.endpoint.is_empty() {
            self.endpoint = default_endpoint();
        }
        self.api_key = self.api_key.trim().to_string();
        self.system_prompt = self.system_prompt.trim().to_string();

        self.default_model = self.default_model.trim().to_string();
        if !registry.contains(&self.default_model) {
            self.default_model = registry.default_model_id().to_string();
        }

        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, 2.0)
        } else {
            DEFAULT_TEMPERATURE
        };
        self.max_gen_len = self.max_gen_len.max(1);

        self
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.endpoint, &self.api_key)
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            system_prompt: (!self.system_prompt.is_empty()).then(|| self.system_prompt.clone()),
            temperature: self.temperature,
            max_gen_len: self.max_gen_len,
        }
    }
}

/// Settings persisted as JSON, overridable through `NOOK_*` environment variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
    registry: ModelRegistry,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".nook"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf, registry: ModelRegistry) -> Self {
        let settings = Self::load_from_disk(&config_path, &registry);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            registry,
        }
    }

    pub fn load(registry: ModelRegistry) -> Self {
        Self::new(Self::default_config_path(), registry)
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn update(&self, settings: ChatSettings) -> Result<Arc<ChatSettings>, SettingsError> {
        let normalized = Arc::new(settings.normalized(&self.registry));
        self.persist(&normalized)?;
        self.settings.store(normalized.clone());
        Ok(normalized)
    }

    fn load_from_disk(path: &Path, registry: &ModelRegistry) -> ChatSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(registry),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ChatSettings::default().normalized(registry)
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_api_key() -> String {
    DEFAULT_API_KEY.to_string()
}

fn default_model() -> String {
    ModelRegistry::builtin().default_model_id().to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_gen_len() -> u64 {
    DEFAULT_MAX_GEN_LEN
}

fn default_use_persistent_cache() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(dir.path().join("settings.json"), ModelRegistry::builtin());

        let settings = store.settings();
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(settings.max_gen_len, DEFAULT_MAX_GEN_LEN);
        assert!(settings.use_persistent_cache);
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone(), ModelRegistry::builtin());

        let saved = store
            .update(ChatSettings {
                endpoint: " http://10.0.0.2:8000/v1/ ".to_string(),
                default_model: "not-a-model".to_string(),
                temperature: 9.0,
                max_gen_len: 0,
                use_persistent_cache: false,
                theme: ThemeChoice::Dark,
                ..ChatSettings::default()
            })
            .expect("update succeeds");

        assert_eq!(saved.endpoint, "http://10.0.0.2:8000/v1");
        assert_eq!(
            saved.default_model,
            ModelRegistry::builtin().default_model_id()
        );
        assert_eq!(saved.temperature, 2.0);
        assert_eq!(saved.max_gen_len, 1);

        let reloaded = SettingsStore::new(path, ModelRegistry::builtin());
        assert_eq!(*reloaded.settings(), *saved);
        assert_eq!(reloaded.settings().theme, ThemeChoice::Dark);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write garbage");

        let store = SettingsStore::new(path, ModelRegistry::builtin());

        assert_eq!(
            *store.settings(),
            ChatSettings::default().normalized(&ModelRegistry::builtin())
        );
    }

    #[test]
    fn blank_system_prompt_is_omitted_from_generation_options() {
        let settings = ChatSettings {
            system_prompt: "   ".to_string(),
            ..ChatSettings::default()
        }
        .normalized(&ModelRegistry::builtin());

        let options = settings.generation_options();
        assert_eq!(options.system_prompt, None);
        assert_eq!(options.max_gen_len, DEFAULT_MAX_GEN_LEN);
    }
}
