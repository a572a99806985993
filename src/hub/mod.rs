//! Untrained models created from the configurations of hub models.
//!
//! The [`Hub`] combines a [`ConfigStore`], which provides model
//! configurations, with an [`ArchitectureRegistry`], which maps the
//! architecture declared by a configuration to a model constructor.
//! [`get_untrained_model_with_inputs`] uses both to create a reduced,
//! randomly initialized version of a model along with inputs and dynamic
//! shapes for its task.

mod config;
mod llm;
mod registry;
mod tasks;
mod untrained;

pub use config::{Attr, ConfigOptions, ConfigSource, ConfigStore, ModelConfig};
pub use llm::{LmDims, TinyCausalLm};
pub use registry::{ArchitectureRegistry, ArchitectureResolver, ModelConstructor};
pub use tasks::{
    guess_task_from_config, make_task_inputs, random_input_kwargs, reduce_model_config,
    task_from_arch, task_from_config, TaskInputs, TextGenerationInputs, ARCHITECTURE_TASKS,
    TEXT_GENERATION,
};
pub use untrained::{
    compute_model_size, filter_out_unexpected_inputs, get_untrained_model_with_inputs, ModelData,
    UntrainedOptions,
};

/// Sources of model configurations and implementations.
pub struct Hub {
    pub configs: ConfigStore,
    pub architectures: ArchitectureRegistry,
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

impl Hub {
    /// Create a hub with the preinstalled configurations and the built-in
    /// architectures.
    pub fn new() -> Hub {
        Hub {
            configs: ConfigStore::new(),
            architectures: ArchitectureRegistry::with_builtins(),
        }
    }

    /// Create a hub which honors the `NOHTTP` environment variable.
    pub fn from_env() -> Hub {
        Hub {
            configs: ConfigStore::from_env(),
            architectures: ArchitectureRegistry::with_builtins(),
        }
    }

    pub fn with_nohttp(mut self, nohttp: bool) -> Hub {
        self.configs = self.configs.with_nohttp(nohttp);
        self
    }
}
