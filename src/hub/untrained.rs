use std::rc::Rc;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use super::config::{ConfigOptions, ModelConfig};
use super::tasks::{make_task_inputs, random_input_kwargs, reduce_model_config, task_from_arch, task_from_config};
use super::Hub;
use crate::dynamic_shapes::InputShapes;
use crate::errors::HubError;
use crate::model::{Model, ModelCase};
use crate::tree::ExampleInput;

/// Options for [`get_untrained_model_with_inputs`].
#[derive(Clone, Debug)]
pub struct UntrainedOptions {
    /// Configuration to use instead of the one of the model.
    pub config: Option<ModelConfig>,

    /// Task of the model. Determined from the configuration if absent.
    pub task: Option<String>,

    /// Overrides for the parameters of the input generator.
    pub input_kwargs: Map<String, JsonValue>,

    /// Overrides for the configuration. Object values are merged into the
    /// configuration changes which reduce the model size.
    pub model_kwargs: Map<String, JsonValue>,

    /// Keep the pretrained model size instead of reducing it.
    pub same_as_pretrained: bool,

    pub use_preinstalled: bool,
    pub use_only_preinstalled: bool,
    pub subfolder: Option<String>,

    /// Enable (`Some(true)`) or disable dynamic rotary embedding scaling.
    pub dynamic_rope: Option<bool>,

    /// Generate a second example with different sizes.
    pub add_second_input: bool,

    /// Seed for random inputs.
    pub seed: u64,

    pub verbose: u32,
}

impl Default for UntrainedOptions {
    fn default() -> UntrainedOptions {
        UntrainedOptions {
            config: None,
            task: None,
            input_kwargs: Map::new(),
            model_kwargs: Map::new(),
            same_as_pretrained: false,
            use_preinstalled: true,
            use_only_preinstalled: false,
            subfolder: None,
            dynamic_rope: None,
            add_second_input: true,
            seed: 0,
            verbose: 0,
        }
    }
}

/// An untrained model with inputs to run it on.
pub struct ModelData {
    pub model_id: String,
    pub model: Rc<dyn Model>,
    pub inputs: ExampleInput,
    pub inputs2: Option<ExampleInput>,
    pub dynamic_shapes: InputShapes,
    pub configuration: ModelConfig,

    /// Size of the weights in bytes.
    pub size: usize,
    pub n_weights: usize,
    pub task: String,

    /// Parameters used to generate the inputs.
    pub input_kwargs: Map<String, JsonValue>,

    /// Changes applied to the configuration.
    pub model_kwargs: Map<String, JsonValue>,
}

impl ModelData {
    /// Convert into a case for the exporter evaluation.
    ///
    /// Every build of the case shares the same model, which does not keep
    /// state between calls.
    pub fn into_case(self, name: impl Into<String>) -> ModelCase {
        let model = self.model;
        let mut inputs = vec![self.inputs];
        inputs.extend(self.inputs2);
        ModelCase::new(name, move || model.clone(), inputs).with_dynamic_shapes(self.dynamic_shapes)
    }
}

/// Return the size in bytes and the number of elements of the weights of
/// `model`.
pub fn compute_model_size(model: &dyn Model) -> (usize, usize) {
    model
        .parameters()
        .iter()
        .fold((0, 0), |(size, count), param| {
            (
                size + param.len() * param.dtype().size() as usize,
                count + param.len(),
            )
        })
}

/// Remove keyword entries which `model` does not accept.
///
/// Models which accept any input keep every entry.
pub fn filter_out_unexpected_inputs<T>(
    model: &dyn Model,
    kwargs: Vec<(String, T)>,
) -> Vec<(String, T)> {
    let Some(allowed) = model.input_names() else {
        return kwargs;
    };
    let (kept, removed): (Vec<_>, Vec<_>) = kwargs
        .into_iter()
        .partition(|(name, _)| allowed.iter().any(|a| a == name));
    if !removed.is_empty() {
        let names: Vec<&str> = removed.iter().map(|(name, _)| name.as_str()).collect();
        debug!(model = model.name(), ?names, "removed unexpected inputs");
    }
    kept
}

fn merge_model_kwargs(reduced: &mut Map<String, JsonValue>, model_kwargs: &Map<String, JsonValue>) {
    for (key, value) in model_kwargs {
        match (reduced.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(nested)) => {
                existing.extend(nested.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                reduced.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Create an untrained model similar to `model_id`, but smaller unless
/// `options.same_as_pretrained` is set, along with inputs for its task.
///
/// No weights are downloaded. The configuration is preinstalled or fetched
/// through the hub's configuration store.
pub fn get_untrained_model_with_inputs(
    hub: &Hub,
    model_id: &str,
    options: &UntrainedOptions,
) -> Result<ModelData, HubError> {
    let mut config = match &options.config {
        Some(config) => config.clone(),
        None => hub.configs.get_pretrained_config(
            model_id,
            &ConfigOptions {
                use_preinstalled: options.use_preinstalled,
                use_only_preinstalled: options.use_only_preinstalled,
                subfolder: options.subfolder.clone(),
            },
            &Map::new(),
        )?,
    };

    let archs = config.architectures();
    let task = match (&options.task, archs.as_slice()) {
        (Some(task), _) => task.clone(),
        (None, []) => task_from_config(model_id, &config)?,
        (None, [arch]) => {
            task_from_arch(arch, None).or_else(|_| task_from_config(model_id, &config))?
        }
        (None, _) => {
            return Err(HubError::Architecture {
                model_id: model_id.to_string(),
                architectures: archs.clone(),
            })
        }
    };
    if options.verbose > 0 {
        info!(model_id, ?archs, task = task.as_str(), "resolved model");
    }

    if let Some(dynamic_rope) = options.dynamic_rope {
        if config.get("rope_scaling").is_none() {
            return Err(HubError::MissingAttribute {
                attr: "rope_scaling".to_string(),
                config: config.to_string(),
            });
        }
        let rope_scaling = if dynamic_rope {
            serde_json::json!({"rope_type": "dynamic", "factor": 10.0})
        } else {
            JsonValue::Null
        };
        config.set("rope_scaling", rope_scaling);
    }

    let mut model_kwargs = if options.same_as_pretrained {
        Map::new()
    } else {
        reduce_model_config(&config, &task)?
    };
    merge_model_kwargs(&mut model_kwargs, &options.model_kwargs);
    if !model_kwargs.is_empty() {
        config.update(&model_kwargs);
    }

    let arch = archs.first().ok_or_else(|| HubError::Architecture {
        model_id: model_id.to_string(),
        architectures: Vec::new(),
    })?;
    let constructor = hub.architectures.get(model_id, arch)?;
    let model = constructor(&config)?;

    let mut input_kwargs = random_input_kwargs(&config, &task)?;
    input_kwargs.extend(
        options
            .input_kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    let generated = make_task_inputs(
        model_id,
        &task,
        &input_kwargs,
        options.add_second_input,
        options.seed,
    )?;

    let (size, n_weights) = compute_model_size(model.as_ref());
    if options.verbose > 0 {
        info!(model_id, size, n_weights, "created untrained model");
    }

    let filter = |mut inputs: ExampleInput| {
        inputs.kwargs = filter_out_unexpected_inputs(model.as_ref(), inputs.kwargs);
        inputs
    };
    let inputs = filter(generated.inputs);
    let inputs2 = generated.inputs2.map(filter);
    let mut dynamic_shapes = generated.dynamic_shapes;
    dynamic_shapes.kwargs = filter_out_unexpected_inputs(model.as_ref(), dynamic_shapes.kwargs);

    Ok(ModelData {
        model_id: model_id.to_string(),
        model,
        inputs,
        inputs2,
        dynamic_shapes,
        configuration: config,
        size,
        n_weights,
        task,
        input_kwargs,
        model_kwargs,
    })
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use serde_json::{json, Map};

    use super::{
        compute_model_size, filter_out_unexpected_inputs, get_untrained_model_with_inputs,
        UntrainedOptions,
    };
    use crate::errors::{HubError, RunError};
    use crate::hub::config::ModelConfig;
    use crate::hub::Hub;
    use crate::model::Model;
    use crate::tree::{ExampleInput, Node};

    fn map(value: serde_json::Value) -> Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_tiny_llm() {
        let hub = Hub::new();
        let options = UntrainedOptions {
            input_kwargs: map(json!({"sequence_length": 5, "sequence_length2": 2})),
            ..Default::default()
        };
        let data = get_untrained_model_with_inputs(&hub, "arnir0/Tiny-LLM", &options).unwrap();

        assert_eq!(data.task, "text-generation");
        assert_eq!(data.model_kwargs["num_hidden_layers"], json!(1));
        assert_eq!(data.model_kwargs["head_dim"], json!(96));
        assert_eq!(data.configuration.pick("head_dim", 0), 96);
        assert_eq!(data.input_kwargs["sequence_length"], json!(5));
        assert_eq!(data.input_kwargs["dummy_max_token_id"], json!(31999));

        // Embedding plus one layer of attention and MLP weights.
        let attention = 192 * 192 + 2 * 192 * 96 + 192 * 192;
        let mlp = 2 * 192 * 1024;
        assert_eq!(data.n_weights, 32000 * 192 + attention + mlp);
        assert_eq!(data.size, data.n_weights * 4);

        let output = data.model.forward(data.inputs.clone()).unwrap();
        let logits = output.tensors()[0].shape().to_vec();
        assert_eq!(logits, [2, 2, 32000]);

        let case = data.into_case("tiny-llm");
        assert_eq!(case.inputs.len(), 2);
        assert!(case.dynamic_shapes.is_some());
    }

    #[test]
    fn test_options() {
        let hub = Hub::new();

        let options = UntrainedOptions {
            model_kwargs: map(json!({"num_hidden_layers": 2, "attn_implementation": "eager"})),
            dynamic_rope: Some(true),
            add_second_input: false,
            input_kwargs: map(json!({"sequence_length": 2, "sequence_length2": 1, "batch_size": 1})),
            config: Some(
                ModelConfig::from_json(
                    "small",
                    json!({
                        "architectures": ["MistralForCausalLM"],
                        "vocab_size": 64,
                        "hidden_size": 8,
                        "intermediate_size": 16,
                        "num_attention_heads": 2,
                        "num_hidden_layers": 4,
                        "rope_scaling": null
                    }),
                )
                .unwrap(),
            ),
            ..Default::default()
        };
        let data = get_untrained_model_with_inputs(&hub, "small", &options).unwrap();
        assert_eq!(data.configuration.pick("num_hidden_layers", 0), 2);
        assert_eq!(data.configuration.get("_attn_implementation"), Some(&json!("eager")));
        assert_eq!(
            data.configuration.get("rope_scaling"),
            Some(&json!({"rope_type": "dynamic", "factor": 10.0}))
        );
        assert!(data.inputs2.is_none());

        let missing_rope = UntrainedOptions {
            dynamic_rope: Some(false),
            ..Default::default()
        };
        assert!(matches!(
            get_untrained_model_with_inputs(&hub, "arnir0/Tiny-LLM", &missing_rope),
            Err(HubError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_unsupported_models() {
        let hub = Hub::new();
        let options = UntrainedOptions::default();

        // Known task but no implementation of the architecture.
        let err = get_untrained_model_with_inputs(&hub, "google-bert/bert-base-uncased", &options)
            .err()
            .unwrap();
        assert!(matches!(err, HubError::MissingImplementation { .. }));

        let offline = Hub::new().with_nohttp(true);
        let err = get_untrained_model_with_inputs(&offline, "unknown/model", &options)
            .err()
            .unwrap();
        assert!(matches!(err, HubError::NotPreinstalled { nohttp: true, .. }));
    }

    struct Named;

    impl Model for Named {
        fn name(&self) -> &str {
            "Named"
        }

        fn forward(&self, _inputs: ExampleInput) -> Result<Node, RunError> {
            Ok(Node::none())
        }

        fn input_names(&self) -> Option<Vec<String>> {
            Some(vec!["input_ids".to_string()])
        }
    }

    #[test]
    fn test_filter_out_unexpected_inputs() {
        let model: Rc<dyn Model> = Rc::new(Named);
        let kwargs = vec![
            ("input_ids".to_string(), 1),
            ("token_type_ids".to_string(), 2),
        ];
        let kept = filter_out_unexpected_inputs(model.as_ref(), kwargs);
        assert_eq!(kept, [("input_ids".to_string(), 1)]);
        assert_eq!(compute_model_size(model.as_ref()), (0, 0));
    }
}
