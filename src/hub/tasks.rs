//! Tasks of hub models and the generators of their dummy inputs.

use rten_tensor::Tensor;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};

use super::config::{Attr, ModelConfig};
use crate::dynamic_shapes::{DynamicShapes, InputShapes, ShapeLeaf};
use crate::errors::HubError;
use crate::rng::WeightRng;
use crate::tree::{ExampleInput, Node, RecordKind, SeqKind, Tree};
use crate::value::Value;

pub const TEXT_GENERATION: &str = "text-generation";

/// Known tasks of model architectures.
pub const ARCHITECTURE_TASKS: &[(&str, &str)] = &[
    ("BertForMaskedLM", "fill-mask"),
    ("CLIPModel", "zero-shot-image-classification"),
    ("GPT2LMHeadModel", TEXT_GENERATION),
    ("GemmaForCausalLM", TEXT_GENERATION),
    ("LlamaForCausalLM", TEXT_GENERATION),
    ("MistralForCausalLM", TEXT_GENERATION),
    ("Phi3ForCausalLM", TEXT_GENERATION),
    ("Qwen2ForCausalLM", TEXT_GENERATION),
    ("T5ForConditionalGeneration", "text2text-generation"),
    ("ViTForImageClassification", "image-classification"),
    ("WhisperForConditionalGeneration", "automatic-speech-recognition"),
    ("YolosForObjectDetection", "object-detection"),
];

/// Return the task of an architecture.
///
/// Unknown architectures resolve to `default` if given, and are an error
/// otherwise.
pub fn task_from_arch(arch: &str, default: Option<&str>) -> Result<String, HubError> {
    ARCHITECTURE_TASKS
        .iter()
        .find(|(name, _)| *name == arch)
        .map(|(_, task)| *task)
        .or(default)
        .map(|task| task.to_string())
        .ok_or_else(|| HubError::UnknownArchitecture(arch.to_string()))
}

/// Infer a task from attributes of a configuration which only some tasks
/// use.
pub fn guess_task_from_config(config: &ModelConfig) -> Option<String> {
    if config.has("bbox_loss_coefficient") && config.has("giou_loss_coefficient") {
        return Some("object-detection".to_string());
    }
    let arch = config.get("architecture").and_then(|a| a.as_str())?;
    task_from_arch(arch, None).ok()
}

/// Determine the task of `model_id` from its configuration.
///
/// An explicit `pipeline_tag` wins, then [`guess_task_from_config`], then the
/// task of the single declared architecture.
pub fn task_from_config(model_id: &str, config: &ModelConfig) -> Result<String, HubError> {
    if let Some(tag) = config.get("pipeline_tag").and_then(|t| t.as_str()) {
        return Ok(tag.to_string());
    }
    if let Some(task) = guess_task_from_config(config) {
        return Ok(task);
    }
    match config.architectures().as_slice() {
        [arch] => task_from_arch(arch, None),
        architectures => Err(HubError::Architecture {
            model_id: model_id.to_string(),
            architectures: architectures.to_vec(),
        }),
    }
}

/// Return the configuration changes which make an untrained model of `task`
/// smaller than the pretrained one.
pub fn reduce_model_config(
    config: &ModelConfig,
    task: &str,
) -> Result<Map<String, JsonValue>, HubError> {
    if task != TEXT_GENERATION {
        return Ok(Map::new());
    }
    config.check_hasattr(&[
        Attr::AnyOf(&[&["head_dim"], &["hidden_size", "num_attention_heads"]]),
        Attr::Name("num_hidden_layers"),
        Attr::Name("hidden_size"),
    ])?;
    let hidden_size: usize = config.require("hidden_size")?;
    let num_attention_heads: usize = config.pick("num_attention_heads", 1);
    let num_hidden_layers: usize = config.require("num_hidden_layers")?;
    let head_dim: usize = config.pick("head_dim", hidden_size / num_attention_heads.max(1));
    let num_key_value_heads: usize = config.pick("num_key_value_heads", num_attention_heads);

    let mut reduced = Map::new();
    reduced.insert("head_dim".into(), json!(head_dim));
    reduced.insert("num_hidden_layers".into(), json!(num_hidden_layers.min(2)));
    reduced.insert("num_key_value_heads".into(), json!(num_key_value_heads));
    if let Some(intermediate_size) = config.get("intermediate_size").and_then(|v| v.as_u64()) {
        let reduced_size = if intermediate_size % 4 == 0 {
            intermediate_size.min(24576 / 4)
        } else {
            intermediate_size
        };
        reduced.insert("intermediate_size".into(), json!(reduced_size));
    }
    let hidden_size = if hidden_size % 4 == 0 {
        hidden_size.min(3072 / 4)
    } else {
        hidden_size
    };
    reduced.insert("hidden_size".into(), json!(hidden_size));
    Ok(reduced)
}

/// Return the default parameters of the input generator for `task`.
pub fn random_input_kwargs(
    config: &ModelConfig,
    task: &str,
) -> Result<Map<String, JsonValue>, HubError> {
    if task != TEXT_GENERATION {
        return Err(HubError::UnsupportedTask(task.to_string()));
    }
    config.check_hasattr(&[
        Attr::Name("vocab_size"),
        Attr::Name("num_hidden_layers"),
        Attr::AnyOf(&[&["head_dim"], &["hidden_size", "num_attention_heads"]]),
    ])?;
    let num_attention_heads: usize = config.pick("num_attention_heads", 1);
    let head_dim = match config.get("head_dim").and_then(|v| v.as_u64()) {
        Some(head_dim) => head_dim as usize,
        None => config.require::<usize>("hidden_size")? / num_attention_heads.max(1),
    };
    let vocab_size: usize = config.require("vocab_size")?;

    let mut kwargs = Map::new();
    kwargs.insert("batch_size".into(), json!(2));
    kwargs.insert("sequence_length".into(), json!(30));
    kwargs.insert("sequence_length2".into(), json!(3));
    kwargs.insert("head_dim".into(), json!(head_dim));
    kwargs.insert("dummy_max_token_id".into(), json!(vocab_size.saturating_sub(1)));
    kwargs.insert(
        "num_hidden_layers".into(),
        json!(config.require::<usize>("num_hidden_layers")?),
    );
    kwargs.insert(
        "num_key_value_heads".into(),
        json!(config.pick("num_key_value_heads", num_attention_heads)),
    );
    Ok(kwargs)
}

/// Inputs produced by a task's input generator.
#[derive(Clone, Debug)]
pub struct TaskInputs {
    pub inputs: ExampleInput,

    /// A second example with different sizes along every dynamic axis.
    pub inputs2: Option<ExampleInput>,

    pub dynamic_shapes: InputShapes,
}

/// Parameters of the text generation input generator.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TextGenerationInputs {
    pub batch_size: usize,
    /// Length of the cached sequence.
    pub sequence_length: usize,
    /// Number of new tokens.
    pub sequence_length2: usize,
    pub head_dim: usize,
    pub dummy_max_token_id: usize,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
}

impl TextGenerationInputs {
    /// Generate one example: new tokens following a cached sequence.
    pub fn example(&self, rng: &mut WeightRng) -> ExampleInput {
        let &TextGenerationInputs {
            batch_size,
            sequence_length,
            sequence_length2,
            head_dim,
            dummy_max_token_id,
            num_hidden_layers,
            num_key_value_heads,
        } = self;

        let input_ids = rng.ids(&[batch_size, sequence_length2], dummy_max_token_id);
        let attention_mask =
            Tensor::<i32>::full(&[batch_size, sequence_length + sequence_length2], 1);
        let positions: Vec<i32> = (0..batch_size)
            .flat_map(|_| (sequence_length..sequence_length + sequence_length2).map(|p| p as i32))
            .collect();
        let position_ids = Tensor::from_data(&[batch_size, sequence_length2], positions);

        let cache_shape = [batch_size, num_key_value_heads, sequence_length, head_dim];
        let mut cache = || -> Vec<Value> {
            (0..num_hidden_layers)
                .map(|_| rng.tensor(&cache_shape, 1.).into())
                .collect()
        };
        let key_cache = cache();
        let value_cache = cache();

        ExampleInput::from_kwargs([
            ("input_ids", Node::tensor(input_ids)),
            ("attention_mask", Node::tensor(attention_mask)),
            ("position_ids", Node::tensor(position_ids)),
            ("past_key_values", Node::dynamic_cache(key_cache, value_cache)),
        ])
    }

    /// Return the dynamic shapes matching [`example`](Self::example).
    pub fn dynamic_shapes(&self) -> InputShapes {
        let leaf = |axes: [(usize, &str); 2]| -> DynamicShapes { Tree::Leaf(ShapeLeaf::axes(axes)) };
        let layers = || {
            Tree::Sequence(
                SeqKind::List,
                (0..self.num_hidden_layers)
                    .map(|_| leaf([(0, "batch"), (2, "cache_length")]))
                    .collect(),
            )
        };
        InputShapes {
            args: Vec::new(),
            kwargs: vec![
                ("input_ids".into(), leaf([(0, "batch"), (1, "seq_length")])),
                ("attention_mask".into(), leaf([(0, "batch"), (1, "cache+seq")])),
                ("position_ids".into(), leaf([(0, "batch"), (1, "seq_length")])),
                (
                    "past_key_values".into(),
                    Tree::Record(RecordKind::DynamicCache, vec![layers(), layers()]),
                ),
            ],
        }
    }

    /// Return the parameters of a second example, one larger along every
    /// dynamic axis.
    pub fn grown(&self) -> TextGenerationInputs {
        TextGenerationInputs {
            batch_size: self.batch_size + 1,
            sequence_length: self.sequence_length + 1,
            sequence_length2: self.sequence_length2 + 1,
            ..self.clone()
        }
    }
}

/// Generate the inputs of a model for `task` from the parameters returned by
/// [`random_input_kwargs`], possibly modified by the caller.
pub fn make_task_inputs(
    model_id: &str,
    task: &str,
    kwargs: &Map<String, JsonValue>,
    add_second_input: bool,
    seed: u64,
) -> Result<TaskInputs, HubError> {
    if task != TEXT_GENERATION {
        return Err(HubError::UnsupportedTask(task.to_string()));
    }
    let params: TextGenerationInputs = serde_json::from_value(JsonValue::Object(kwargs.clone()))
        .map_err(|err| HubError::Options {
            model_id: model_id.to_string(),
            message: err.to_string(),
        })?;
    let mut rng = WeightRng::new(seed);
    let inputs = params.example(&mut rng);
    let inputs2 = add_second_input.then(|| params.grown().example(&mut rng));
    Ok(TaskInputs {
        inputs,
        inputs2,
        dynamic_shapes: params.dynamic_shapes(),
    })
}

#[cfg(test)]
mod tests {
    use rten_diagnostic_testing::TestCases;
    use serde_json::json;

    use super::{
        guess_task_from_config, make_task_inputs, random_input_kwargs, reduce_model_config,
        task_from_arch, task_from_config, TEXT_GENERATION,
    };
    use crate::errors::HubError;
    use crate::hub::config::ModelConfig;

    fn config(value: serde_json::Value) -> ModelConfig {
        ModelConfig::from_json("test", value).unwrap()
    }

    #[test]
    fn test_task_from_arch() {
        assert_eq!(task_from_arch("LlamaForCausalLM", None).unwrap(), TEXT_GENERATION);
        assert_eq!(task_from_arch("NewModel", Some("feature-extraction")).unwrap(), "feature-extraction");
        assert!(matches!(
            task_from_arch("NewModel", None),
            Err(HubError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn test_task_from_config() {
        #[derive(Debug)]
        struct Case {
            config: serde_json::Value,
            task: Option<&'static str>,
        }

        let cases = [
            Case {
                config: json!({"pipeline_tag": "summarization", "architectures": ["LlamaForCausalLM"]}),
                task: Some("summarization"),
            },
            Case {
                config: json!({"bbox_loss_coefficient": 5, "giou_loss_coefficient": 2}),
                task: Some("object-detection"),
            },
            Case {
                config: json!({"architecture": "BertForMaskedLM"}),
                task: Some("fill-mask"),
            },
            Case {
                config: json!({"architectures": ["MistralForCausalLM"]}),
                task: Some(TEXT_GENERATION),
            },
            Case {
                config: json!({"architectures": ["A", "B"]}),
                task: None,
            },
            Case {
                config: json!({}),
                task: None,
            },
        ];

        cases.test_each(|case| {
            let task = task_from_config("model", &config(case.config.clone())).ok();
            assert_eq!(task.as_deref(), case.task);
        })
    }

    #[test]
    fn test_guess_task_needs_both_coefficients() {
        let conf = config(json!({"bbox_loss_coefficient": 5}));
        assert_eq!(guess_task_from_config(&conf), None);
    }

    #[test]
    fn test_reduce_model_config() {
        let conf = config(json!({
            "hidden_size": 4096,
            "intermediate_size": 14336,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "num_hidden_layers": 32
        }));
        let reduced = reduce_model_config(&conf, TEXT_GENERATION).unwrap();
        assert_eq!(reduced["head_dim"], json!(128));
        assert_eq!(reduced["num_hidden_layers"], json!(2));
        assert_eq!(reduced["num_key_value_heads"], json!(8));
        assert_eq!(reduced["intermediate_size"], json!(6144));
        assert_eq!(reduced["hidden_size"], json!(768));

        assert!(reduce_model_config(&conf, "fill-mask").unwrap().is_empty());
        assert!(reduce_model_config(&config(json!({})), TEXT_GENERATION).is_err());
    }

    #[test]
    fn test_text_generation_inputs() {
        let conf = config(json!({
            "vocab_size": 100,
            "hidden_size": 16,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2
        }));
        let kwargs = random_input_kwargs(&conf, TEXT_GENERATION).unwrap();
        let inputs = make_task_inputs("model", TEXT_GENERATION, &kwargs, true, 0).unwrap();

        let shapes = |example: &crate::tree::ExampleInput| -> Vec<Vec<usize>> {
            example
                .leaves()
                .iter()
                .filter_map(|leaf| leaf.as_value())
                .map(|value| value.shape().to_vec())
                .collect()
        };
        let first = shapes(&inputs.inputs);
        assert_eq!(first[0], [2, 3]);
        assert_eq!(first[1], [2, 33]);
        assert_eq!(first[2], [2, 3]);
        assert_eq!(first[3], [2, 2, 30, 4]);
        assert_eq!(first.len(), 3 + 4);

        let second = shapes(inputs.inputs2.as_ref().unwrap());
        assert_eq!(second[0], [3, 4]);
        assert_eq!(second[1], [3, 35]);
        assert_eq!(second[3], [3, 2, 31, 4]);

        let json = inputs.dynamic_shapes.to_json();
        assert_eq!(json[1]["attention_mask"], json!({"0": "batch", "1": "cache+seq"}));
        assert!(inputs.dynamic_shapes.has_dynamic());

        assert!(inputs.inputs.check_same_signature(inputs.inputs2.as_ref().unwrap()).is_ok());
    }

    #[test]
    fn test_invalid_generator_options() {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("batch_size".into(), json!(2));
        let err = make_task_inputs("model", TEXT_GENERATION, &kwargs, false, 0).unwrap_err();
        assert!(matches!(err, HubError::Options { .. }));
        assert!(matches!(
            make_task_inputs("model", "fill-mask", &kwargs, false, 0),
            Err(HubError::UnsupportedTask(_))
        ));
    }
}
