use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::config::ModelConfig;
use super::llm::TinyCausalLm;
use crate::errors::HubError;
use crate::model::Model;

/// Function which creates an untrained model from a configuration.
pub type ModelConstructor = Rc<dyn Fn(&ModelConfig) -> Result<Rc<dyn Model>, HubError>>;

/// Provides implementations of architectures which are not registered, eg.
/// by loading code published with a model.
pub trait ArchitectureResolver {
    /// Return a constructor for `arch`, or `None` if the resolver does not
    /// know it.
    fn resolve(&self, model_id: &str, arch: &str) -> Result<Option<ModelConstructor>, HubError>;
}

/// Map of architecture (model class) names to model constructors.
#[derive(Default)]
pub struct ArchitectureRegistry {
    constructors: FxHashMap<String, ModelConstructor>,
    resolver: Option<Box<dyn ArchitectureResolver>>,
}

impl ArchitectureRegistry {
    pub fn new() -> ArchitectureRegistry {
        ArchitectureRegistry::default()
    }

    /// Create a registry with the architectures implemented by this crate.
    pub fn with_builtins() -> ArchitectureRegistry {
        let mut registry = ArchitectureRegistry::new();
        for arch in ["LlamaForCausalLM", "MistralForCausalLM"] {
            registry.register(arch, |config| {
                let model: Rc<dyn Model> = Rc::new(TinyCausalLm::from_config(config)?);
                Ok(model)
            });
        }
        registry
    }

    pub fn register(
        &mut self,
        arch: impl Into<String>,
        constructor: impl Fn(&ModelConfig) -> Result<Rc<dyn Model>, HubError> + 'static,
    ) {
        self.constructors.insert(arch.into(), Rc::new(constructor));
    }

    pub fn with_resolver(mut self, resolver: impl ArchitectureResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn contains(&self, arch: &str) -> bool {
        self.constructors.contains_key(arch)
    }

    /// Return the constructor for `arch`, asking the resolver if it is not
    /// registered.
    pub fn get(&self, model_id: &str, arch: &str) -> Result<ModelConstructor, HubError> {
        if let Some(constructor) = self.constructors.get(arch) {
            return Ok(constructor.clone());
        }
        if let Some(resolver) = &self.resolver {
            debug!(model_id, arch, "resolving architecture");
            if let Some(constructor) = resolver.resolve(model_id, arch)? {
                return Ok(constructor);
            }
        }
        Err(HubError::MissingImplementation {
            model_id: model_id.to_string(),
            arch: arch.to_string(),
        })
    }
}
