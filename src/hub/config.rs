//! Model configurations and the store which provides them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::env::env_flag;
use crate::errors::HubError;

/// Configuration of a model, as found in a `config.json` file.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ModelConfig(Map<String, JsonValue>);

/// An attribute requirement for [`ModelConfig::check_hasattr`].
#[derive(Copy, Clone, Debug)]
pub enum Attr<'a> {
    /// The attribute must be present.
    Name(&'a str),

    /// At least one of the alternatives must be present, where an alternative
    /// is present if all of its attributes are.
    AnyOf(&'a [&'a [&'a str]]),
}

impl ModelConfig {
    pub fn new(entries: Map<String, JsonValue>) -> ModelConfig {
        ModelConfig(entries)
    }

    /// Create a configuration from a JSON value, which must be an object.
    pub fn from_json(name: &str, value: JsonValue) -> Result<ModelConfig, HubError> {
        match value {
            JsonValue::Object(entries) => Ok(ModelConfig(entries)),
            _ => Err(HubError::InvalidConfig(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name)
    }

    /// Return true if the configuration has a non-null attribute `name`.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|value| !value.is_null())
    }

    pub fn set(&mut self, name: &str, value: JsonValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn entries(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Return the value of attribute `name`, or `default` if it is absent or
    /// does not have the expected type.
    pub fn pick<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or(default)
    }

    /// Return the value of a required attribute.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, HubError> {
        self.get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .ok_or_else(|| HubError::MissingAttribute {
                attr: name.to_string(),
                config: self.to_string(),
            })
    }

    /// Check that the configuration has every attribute in `attrs`.
    pub fn check_hasattr(&self, attrs: &[Attr]) -> Result<(), HubError> {
        for attr in attrs {
            let (present, desc) = match attr {
                Attr::Name(name) => (self.has(name), name.to_string()),
                Attr::AnyOf(alternatives) => (
                    alternatives
                        .iter()
                        .any(|names| names.iter().all(|name| self.has(name))),
                    format!("{:?}", alternatives),
                ),
            };
            if !present {
                return Err(HubError::MissingAttribute {
                    attr: desc,
                    config: self.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Update the configuration with different values.
    ///
    /// Object values are merged into existing objects recursively, and
    /// replace absent or null attributes. `attn_implementation` sets the
    /// private `_attn_implementation` attribute and disables its automatic
    /// selection.
    pub fn update(&mut self, updates: &Map<String, JsonValue>) {
        update_map(&mut self.0, updates);
    }

    /// Return the model class names declared by the configuration.
    pub fn architectures(&self) -> Vec<String> {
        if let Some(arch) = self.get("architecture").and_then(|a| a.as_str()) {
            return vec![arch.to_string()];
        }
        if let Some(class_name) = self.get("_class_name").and_then(|a| a.as_str()) {
            return vec![class_name.to_string()];
        }
        self.pick::<Option<Vec<String>>>("architectures", None)
            .unwrap_or_default()
    }
}

fn update_map(config: &mut Map<String, JsonValue>, updates: &Map<String, JsonValue>) {
    for (key, value) in updates {
        if key == "attn_implementation" {
            config.insert("_attn_implementation".to_string(), value.clone());
            if config
                .get("_attn_implementation_autoset")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                config.insert("_attn_implementation_autoset".to_string(), false.into());
            }
            continue;
        }
        match (config.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(nested)) => {
                update_map(existing, nested);
            }
            _ => {
                config.insert(key.clone(), value.clone());
            }
        }
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Fetches configurations which are not preinstalled, eg. over the network.
pub trait ConfigSource {
    fn fetch(&self, model_id: &str, subfolder: Option<&str>) -> Result<ModelConfig, HubError>;
}

/// Options for [`ConfigStore::get_pretrained_config`].
#[derive(Clone, Debug)]
pub struct ConfigOptions {
    /// Look for a preinstalled configuration first.
    pub use_preinstalled: bool,

    /// Fail if the configuration is not preinstalled.
    pub use_only_preinstalled: bool,

    pub subfolder: Option<String>,
}

impl Default for ConfigOptions {
    fn default() -> ConfigOptions {
        ConfigOptions {
            use_preinstalled: true,
            use_only_preinstalled: false,
            subfolder: None,
        }
    }
}

/// Provides model configurations from a preinstalled set, falling back to a
/// [`ConfigSource`].
///
/// Fetched configurations are cached for the lifetime of the store.
pub struct ConfigStore {
    preinstalled: BTreeMap<String, ModelConfig>,
    source: Option<Box<dyn ConfigSource>>,
    fetched: RefCell<FxHashMap<String, ModelConfig>>,

    /// Forbids fetching configurations which are not preinstalled.
    nohttp: bool,
}

impl Default for ConfigStore {
    fn default() -> ConfigStore {
        ConfigStore::new()
    }
}

impl ConfigStore {
    /// Create a store with the built-in preinstalled configurations and no
    /// source.
    pub fn new() -> ConfigStore {
        ConfigStore {
            preinstalled: preinstalled_configs(),
            source: None,
            fetched: RefCell::new(FxHashMap::default()),
            nohttp: false,
        }
    }

    /// Create a store which honors the `NOHTTP` environment variable.
    pub fn from_env() -> ConfigStore {
        let mut store = ConfigStore::new();
        store.nohttp = env_flag("NOHTTP", false);
        store
    }

    pub fn with_source(mut self, source: impl ConfigSource + 'static) -> ConfigStore {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_nohttp(mut self, nohttp: bool) -> ConfigStore {
        self.nohttp = nohttp;
        self
    }

    /// Add or replace a preinstalled configuration.
    pub fn preinstall(&mut self, name: impl Into<String>, config: ModelConfig) {
        self.preinstalled.insert(name.into(), config);
    }

    /// Return the names of the preinstalled configurations, sorted.
    pub fn preinstalled(&self) -> Vec<String> {
        self.preinstalled.keys().cloned().collect()
    }

    /// Return a copy of a preinstalled configuration, updated with
    /// `overrides`.
    ///
    /// Returns `Ok(None)` if `name` is not preinstalled, unless `exc` is set
    /// or fetching is forbidden, in which case this is an error.
    pub fn get_cached_configuration(
        &self,
        name: &str,
        exc: bool,
        overrides: &Map<String, JsonValue>,
    ) -> Result<Option<ModelConfig>, HubError> {
        if let Some(config) = self.preinstalled.get(name) {
            let mut config = config.clone();
            if !overrides.is_empty() {
                config.update(overrides);
            }
            return Ok(Some(config));
        }
        if exc || self.nohttp {
            return Err(HubError::NotPreinstalled {
                name: name.to_string(),
                exc,
                nohttp: self.nohttp,
                available: self.preinstalled(),
            });
        }
        Ok(None)
    }

    /// Return the configuration of `model_id`.
    ///
    /// The preinstalled set is searched first if `options.use_preinstalled`
    /// is set. Other configurations are fetched from the source once and then
    /// cached.
    pub fn get_pretrained_config(
        &self,
        model_id: &str,
        options: &ConfigOptions,
        overrides: &Map<String, JsonValue>,
    ) -> Result<ModelConfig, HubError> {
        if options.use_preinstalled || options.use_only_preinstalled {
            if let Some(config) =
                self.get_cached_configuration(model_id, options.use_only_preinstalled, overrides)?
            {
                return Ok(config);
            }
        }
        if self.nohttp {
            return Err(HubError::NotPreinstalled {
                name: model_id.to_string(),
                exc: false,
                nohttp: true,
                available: self.preinstalled(),
            });
        }

        let key = match &options.subfolder {
            Some(subfolder) => format!("{}/{}", model_id, subfolder),
            None => model_id.to_string(),
        };
        let cached = self.fetched.borrow().get(&key).cloned();
        let mut config = match cached {
            Some(config) => config,
            None => {
                let source = self
                    .source
                    .as_ref()
                    .ok_or_else(|| HubError::NoSource(model_id.to_string()))?;
                debug!(model_id, subfolder = ?options.subfolder, "fetching configuration");
                let config = source.fetch(model_id, options.subfolder.as_deref())?;
                self.fetched.borrow_mut().insert(key, config.clone());
                config
            }
        };
        if !overrides.is_empty() {
            config.update(overrides);
        }
        Ok(config)
    }
}

fn json_config(value: JsonValue) -> ModelConfig {
    match value {
        JsonValue::Object(entries) => ModelConfig(entries),
        _ => ModelConfig::default(),
    }
}

/// Configurations available without fetching anything.
fn preinstalled_configs() -> BTreeMap<String, ModelConfig> {
    let mut configs = BTreeMap::new();
    configs.insert(
        "arnir0/Tiny-LLM".to_string(),
        json_config(serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 192,
            "intermediate_size": 1024,
            "num_attention_heads": 2,
            "num_hidden_layers": 1,
            "num_key_value_heads": 1,
            "max_position_embeddings": 1024,
            "vocab_size": 32000,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "_attn_implementation_autoset": true
        })),
    );
    configs.insert(
        "hustvl/yolos-tiny".to_string(),
        json_config(serde_json::json!({
            "architectures": ["YolosForObjectDetection"],
            "model_type": "yolos",
            "hidden_size": 192,
            "num_attention_heads": 3,
            "num_hidden_layers": 12,
            "image_size": [800, 1333],
            "num_detection_tokens": 100,
            "bbox_loss_coefficient": 5,
            "giou_loss_coefficient": 2
        })),
    );
    configs.insert(
        "google-bert/bert-base-uncased".to_string(),
        json_config(serde_json::json!({
            "architectures": ["BertForMaskedLM"],
            "model_type": "bert",
            "hidden_size": 768,
            "num_attention_heads": 12,
            "num_hidden_layers": 12,
            "vocab_size": 30522
        })),
    );
    configs
}
