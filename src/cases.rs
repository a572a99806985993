//! Small eager models which cover the input signatures exporters struggle
//! with.

use std::rc::Rc;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde_json::json;

use crate::errors::{HubError, RunError};
use crate::hub::{get_untrained_model_with_inputs, Hub, ModelConfig, UntrainedOptions};
use crate::model::{Model, ModelCase};
use crate::rng::WeightRng;
use crate::tree::{ExampleInput, Node, Tree};
use crate::value::{Leaf, Value};

fn float_tensor<'a>(node: Option<&'a Node>, name: &str) -> Result<&'a Tensor<f32>, RunError> {
    let value = node
        .and_then(|node| node.as_value())
        .ok_or_else(|| RunError::MissingInput(name.to_string()))?;
    Ok(value.try_into()?)
}

fn zip_map(a: &Tensor<f32>, b: &Tensor<f32>, f: impl Fn(f32, f32) -> f32) -> Result<Tensor<f32>, RunError> {
    if a.shape() != b.shape() {
        return Err(RunError::Failed(format!(
            "cannot combine tensors of shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let data: Vec<f32> = a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
    Ok(Tensor::from_data(a.shape(), data))
}

/// Fully connected layer, `x @ weight + bias`.
pub struct Linear {
    weight: Value,
    bias: Value,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Linear {
        let mut rng = WeightRng::new(seed);
        Linear {
            weight: rng.tensor(&[in_features, out_features], 0.5).into(),
            bias: rng.tensor(&[out_features], 0.5).into(),
            in_features,
            out_features,
        }
    }
}

impl Model for Linear {
    fn name(&self) -> &str {
        "Linear"
    }

    fn parameters(&self) -> Vec<&Value> {
        vec![&self.weight, &self.bias]
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let x = float_tensor(inputs.get(0, "x"), "x")?;
        let &[rows, features] = x.shape() else {
            return Err(RunError::ShapeMismatch {
                name: "x".into(),
                expected: format!("[batch, {}]", self.in_features),
                actual: x.shape().to_vec(),
            });
        };
        if features != self.in_features {
            return Err(RunError::ShapeMismatch {
                name: "x".into(),
                expected: format!("[batch, {}]", self.in_features),
                actual: x.shape().to_vec(),
            });
        }
        let weight: &Tensor<f32> = (&self.weight).try_into()?;
        let bias: &Tensor<f32> = (&self.bias).try_into()?;
        let (x, weight, bias) = (x.to_vec(), weight.to_vec(), bias.to_vec());

        let mut out = Vec::with_capacity(rows * self.out_features);
        for r in 0..rows {
            for c in 0..self.out_features {
                let dot: f32 = (0..features)
                    .map(|k| x[r * features + k] * weight[k * self.out_features + c])
                    .sum();
                out.push(dot + bias[c]);
            }
        }
        Ok(Node::tensor(Tensor::from_data(&[rows, self.out_features], out)))
    }
}

/// Model which increments its input in place before using it.
pub struct InplaceAdd;

impl Model for InplaceAdd {
    fn name(&self) -> &str {
        "InplaceAdd"
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let x = match inputs.args.into_iter().next() {
            Some(Tree::Leaf(Leaf::Tensor(x))) => x,
            _ => return Err(RunError::MissingInput("x".into())),
        };
        let mut x: Tensor<f32> = x.try_into()?;
        for v in x.iter_mut() {
            *v += 1.;
        }
        let squared = x.map(|v| v * v);
        Ok(Node::tuple(vec![Node::tensor(x), Node::tensor(squared)]))
    }
}

/// Model which sums a list of tensors.
pub struct ListSum;

impl Model for ListSum {
    fn name(&self) -> &str {
        "ListSum"
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let items = match inputs.get(0, "xs") {
            Some(Tree::Sequence(_, items)) if !items.is_empty() => items,
            _ => return Err(RunError::MissingInput("xs".into())),
        };
        let mut sum = float_tensor(items.first(), "xs")?.clone();
        for item in &items[1..] {
            sum = zip_map(&sum, float_tensor(Some(item), "xs")?, |a, b| a + b)?;
        }
        Ok(Node::tensor(sum))
    }
}

/// Model which scales a tensor by a scalar argument.
pub struct Scale;

impl Model for Scale {
    fn name(&self) -> &str {
        "Scale"
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let x = float_tensor(inputs.get(0, "x"), "x")?;
        let alpha = match inputs.get(1, "alpha") {
            Some(Tree::Leaf(Leaf::Scalar(alpha))) => alpha.as_f64() as f32,
            _ => return Err(RunError::MissingInput("alpha".into())),
        };
        Ok(Node::tensor(x.map(|v| v * alpha)))
    }
}

/// Model whose computation depends on the sign of the sum of its input.
pub struct SignBranch;

impl Model for SignBranch {
    fn name(&self) -> &str {
        "SignBranch"
    }

    fn data_dependent_control_flow(&self) -> bool {
        true
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let x = float_tensor(inputs.get(0, "x"), "x")?;
        let y = float_tensor(inputs.get(1, "y"), "y")?;
        let out = if x.iter().sum::<f32>() > 0. {
            zip_map(x, y, |a, b| a * b)?
        } else {
            zip_map(x, y, |a, b| a - b)?
        };
        Ok(Node::tensor(out))
    }
}

/// Configuration of the causal language model case.
fn tiny_llm_config() -> Result<ModelConfig, HubError> {
    ModelConfig::from_json(
        "tiny-llm",
        json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "vocab_size": 128,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2,
            "rms_norm_eps": 1e-6
        }),
    )
}

fn tiny_llm_case(hub: &Hub) -> Result<ModelCase, HubError> {
    let mut input_kwargs = serde_json::Map::new();
    input_kwargs.insert("sequence_length".into(), json!(6));
    let options = UntrainedOptions {
        config: Some(tiny_llm_config()?),
        input_kwargs,
        ..Default::default()
    };
    let data = get_untrained_model_with_inputs(hub, "tiny-llm", &options)?;
    Ok(data.into_case("tiny_llm"))
}

/// Return the built-in model cases. Each has two examples with different
/// sizes.
pub fn builtin_cases(hub: &Hub) -> Result<Vec<ModelCase>, HubError> {
    let mut rng = WeightRng::new(42);
    let mut tensor = |shape: &[usize]| Node::tensor(rng.tensor(shape, 1.));

    let linear = ModelCase::new(
        "linear",
        || Rc::new(Linear::new(4, 3, 1)),
        vec![
            ExampleInput::from_args(vec![tensor(&[2, 4])]),
            ExampleInput::from_args(vec![tensor(&[5, 4])]),
        ],
    );
    let inplace = ModelCase::new(
        "inplace_add",
        || Rc::new(InplaceAdd),
        vec![
            ExampleInput::from_args(vec![tensor(&[2, 3])]),
            ExampleInput::from_args(vec![tensor(&[3, 4])]),
        ],
    );
    let list = ModelCase::new(
        "list_inputs",
        || Rc::new(ListSum),
        vec![
            ExampleInput::from_args(vec![Node::list(vec![tensor(&[3, 2]), tensor(&[3, 2])])]),
            ExampleInput::from_args(vec![Node::list(vec![tensor(&[4, 2]), tensor(&[4, 2])])]),
        ],
    );
    let scalar = ModelCase::new(
        "scalar_arg",
        || Rc::new(Scale),
        vec![
            ExampleInput::from_args(vec![tensor(&[2, 5]), Node::float(0.5)]),
            ExampleInput::from_args(vec![tensor(&[3, 5]), Node::float(2.)]),
        ],
    );
    let control_flow = ModelCase::new(
        "control_flow",
        || Rc::new(SignBranch),
        vec![
            ExampleInput::from_kwargs([("x", tensor(&[3])), ("y", tensor(&[3]))]),
            ExampleInput::from_kwargs([("x", tensor(&[5])), ("y", tensor(&[5]))]),
        ],
    );

    Ok(vec![
        linear,
        inplace,
        list,
        scalar,
        control_flow,
        tiny_llm_case(hub)?,
    ])
}
