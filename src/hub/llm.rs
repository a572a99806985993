//! Untrained decoder-only language model with a key/value cache.
//!
//! This is a small Llama-style transformer (embedding, attention with grouped
//! key/value heads, MLP and tied output projection) with random weights. It
//! exists to exercise exporters on the inputs and outputs of a real text
//! generation model: keyword inputs, a `DynamicCache` that grows along the
//! sequence axis and a record-typed output.

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use super::config::{Attr, ModelConfig};
use crate::errors::{HubError, RunError};
use crate::model::Model;
use crate::rng::WeightRng;
use crate::tree::{ExampleInput, Node, RecordKind, Tree};
use crate::value::{Leaf, Value};

/// Sizes of a [`TinyCausalLm`].
#[derive(Clone, Debug, PartialEq)]
pub struct LmDims {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f32,
}

impl LmDims {
    pub fn from_config(config: &ModelConfig) -> Result<LmDims, HubError> {
        config.check_hasattr(&[
            Attr::Name("vocab_size"),
            Attr::Name("hidden_size"),
            Attr::Name("num_hidden_layers"),
            Attr::Name("num_attention_heads"),
        ])?;
        let hidden_size: usize = config.require("hidden_size")?;
        let num_attention_heads: usize = config.require("num_attention_heads")?;
        let dims = LmDims {
            vocab_size: config.require("vocab_size")?,
            hidden_size,
            intermediate_size: config.pick("intermediate_size", hidden_size * 4),
            num_hidden_layers: config.require("num_hidden_layers")?,
            num_attention_heads,
            num_key_value_heads: config.pick("num_key_value_heads", num_attention_heads),
            head_dim: config.pick("head_dim", hidden_size / num_attention_heads.max(1)),
            rms_norm_eps: config.pick("rms_norm_eps", 1e-6),
        };
        if dims.num_key_value_heads == 0
            || dims.num_attention_heads % dims.num_key_value_heads != 0
            || dims.head_dim == 0
        {
            return Err(HubError::MissingAttribute {
                attr: "num_key_value_heads dividing num_attention_heads".to_string(),
                config: config.to_string(),
            });
        }
        Ok(dims)
    }
}

struct Layer {
    wq: Value,
    wk: Value,
    wv: Value,
    wo: Value,
    w_up: Value,
    w_down: Value,
}

/// Untrained causal language model.
///
/// Inputs are the keyword arguments `input_ids` (`[batch, seq]`),
/// `attention_mask` (`[batch, past + seq]`), `position_ids` (`[batch, seq]`)
/// and `past_key_values` (a `DynamicCache` with one `[batch, kv_heads,
/// past, head_dim]` tensor per layer in each field). Only `input_ids` is
/// required. The output is a `CausalLMOutputWithPast` record holding the
/// logits and the updated cache.
pub struct TinyCausalLm {
    dims: LmDims,
    embedding: Value,
    layers: Vec<Layer>,
}

/// Return the contents of a weight as a vector.
fn weight_data(weight: &Value) -> Vec<f32> {
    weight
        .as_tensor::<f32>()
        .map(|t| t.to_vec())
        .unwrap_or_default()
}

/// Multiply `a` (`[rows, k]`) by `b` (`[k, cols]`).
fn matmul(a: &[f32], rows: usize, k: usize, b: &[f32], cols: usize) -> Vec<f32> {
    let mut out = vec![0.; rows * cols];
    for r in 0..rows {
        for i in 0..k {
            let a_ri = a[r * k + i];
            if a_ri == 0. {
                continue;
            }
            let b_row = &b[i * cols..(i + 1) * cols];
            let out_row = &mut out[r * cols..(r + 1) * cols];
            for (o, &b_ic) in out_row.iter_mut().zip(b_row) {
                *o += a_ri * b_ic;
            }
        }
    }
    out
}

/// Normalize each row of `x` (`[rows, cols]`) by its root mean square.
fn rms_norm(x: &[f32], cols: usize, eps: f32) -> Vec<f32> {
    x.chunks(cols)
        .flat_map(|row| {
            let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / cols as f32;
            let scale = 1. / (mean_sq + eps).sqrt();
            row.iter().map(move |v| v * scale)
        })
        .collect()
}

fn float_input(inputs: &ExampleInput, name: &str) -> Result<Option<Vec<f64>>, RunError> {
    match inputs.kwarg(name) {
        None => Ok(None),
        Some(Tree::Leaf(Leaf::None)) => Ok(None),
        Some(Tree::Leaf(Leaf::Tensor(value))) => Ok(Some(value.to_f64_vec())),
        Some(other) => Err(RunError::Failed(format!(
            "expected a tensor for {} but got {}",
            name, other
        ))),
    }
}

fn check_shape(name: &str, actual: &[usize], expected: &[usize]) -> Result<(), RunError> {
    if actual != expected {
        return Err(RunError::ShapeMismatch {
            name: name.to_string(),
            expected: format!("{:?}", expected),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

impl TinyCausalLm {
    pub fn from_config(config: &ModelConfig) -> Result<TinyCausalLm, HubError> {
        Ok(TinyCausalLm::new(LmDims::from_config(config)?, 0))
    }

    /// Create a model with random weights generated from `seed`.
    pub fn new(dims: LmDims, seed: u64) -> TinyCausalLm {
        let mut rng = WeightRng::new(seed);
        let LmDims {
            vocab_size,
            hidden_size,
            intermediate_size,
            num_attention_heads: heads,
            num_key_value_heads: kv_heads,
            head_dim,
            ..
        } = dims;
        let mut weight = |rows: usize, cols: usize| -> Value {
            rng.tensor(&[rows, cols], 1. / (rows as f32).sqrt()).into()
        };
        let embedding = weight(vocab_size, hidden_size);
        let layers = (0..dims.num_hidden_layers)
            .map(|_| Layer {
                wq: weight(hidden_size, heads * head_dim),
                wk: weight(hidden_size, kv_heads * head_dim),
                wv: weight(hidden_size, kv_heads * head_dim),
                wo: weight(heads * head_dim, hidden_size),
                w_up: weight(hidden_size, intermediate_size),
                w_down: weight(intermediate_size, hidden_size),
            })
            .collect();
        TinyCausalLm {
            dims,
            embedding,
            layers,
        }
    }

    pub fn dims(&self) -> &LmDims {
        &self.dims
    }

    /// Return the per-layer key and value tensors of the input cache.
    fn past_cache(&self, inputs: &ExampleInput) -> Result<Option<(Vec<Value>, Vec<Value>)>, RunError> {
        let cache = match inputs.kwarg("past_key_values") {
            None | Some(Tree::Leaf(Leaf::None)) => return Ok(None),
            Some(cache) => cache,
        };
        let (key_cache, value_cache) = match cache {
            Tree::Record(RecordKind::DynamicCache, fields) => match fields.as_slice() {
                [key_cache, value_cache] => (key_cache, value_cache),
                _ => return Err(RunError::Failed("malformed DynamicCache".into())),
            },
            _ => {
                return Err(RunError::Failed(format!(
                    "past_key_values must be a DynamicCache, got {}",
                    cache
                )))
            }
        };
        let layer_values = |field: &Node| -> Vec<Value> {
            field.tensors().into_iter().cloned().collect()
        };
        let keys = layer_values(key_cache);
        let values = layer_values(value_cache);
        if keys.len() != self.dims.num_hidden_layers || values.len() != self.dims.num_hidden_layers {
            return Err(RunError::Failed(format!(
                "cache has {} key and {} value tensors for {} layers",
                keys.len(),
                values.len(),
                self.dims.num_hidden_layers
            )));
        }
        Ok(Some((keys, values)))
    }
}

impl Model for TinyCausalLm {
    fn name(&self) -> &str {
        "TinyCausalLm"
    }

    fn input_names(&self) -> Option<Vec<String>> {
        Some(
            ["input_ids", "attention_mask", "position_ids", "past_key_values"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
        )
    }

    fn parameters(&self) -> Vec<&Value> {
        let mut params = vec![&self.embedding];
        for layer in &self.layers {
            params.extend([
                &layer.wq,
                &layer.wk,
                &layer.wv,
                &layer.wo,
                &layer.w_up,
                &layer.w_down,
            ]);
        }
        params
    }

    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let LmDims {
            vocab_size,
            hidden_size: hidden,
            intermediate_size: inter,
            num_attention_heads: heads,
            num_key_value_heads: kv_heads,
            head_dim,
            rms_norm_eps: eps,
            ..
        } = self.dims;

        let ids: &Tensor<i32> = inputs
            .kwarg("input_ids")
            .or_else(|| inputs.arg(0))
            .and_then(|ids| ids.as_value())
            .ok_or(RunError::MissingInput("input_ids".into()))?
            .try_into()?;
        let &[batch, seq] = ids.shape() else {
            return Err(RunError::ShapeMismatch {
                name: "input_ids".into(),
                expected: "[batch, seq]".into(),
                actual: ids.shape().to_vec(),
            });
        };

        let past = self.past_cache(&inputs)?;
        let past_len = match &past {
            Some((keys, _)) => keys.first().map(|k| k.shape().get(2).copied().unwrap_or(0)).unwrap_or(0),
            None => 0,
        };
        if let Some((keys, values)) = &past {
            for cache in keys.iter().chain(values) {
                check_shape(
                    "past_key_values",
                    cache.shape(),
                    &[batch, kv_heads, past_len, head_dim],
                )?;
            }
        }
        let total = past_len + seq;

        let mask = float_input(&inputs, "attention_mask")?.unwrap_or_else(|| vec![1.; batch * total]);
        if mask.len() != batch * total {
            return Err(RunError::Failed(format!(
                "attention_mask has {} elements, expected {}x{}",
                mask.len(),
                batch,
                total
            )));
        }
        let positions = match float_input(&inputs, "position_ids")? {
            Some(positions) if positions.len() == batch * seq => positions,
            Some(positions) => {
                return Err(RunError::Failed(format!(
                    "position_ids has {} elements, expected {}x{}",
                    positions.len(),
                    batch,
                    seq
                )))
            }
            None => (0..batch)
                .flat_map(|_| (past_len..total).map(|p| p as f64))
                .collect(),
        };

        // Embed tokens and add sinusoidal position information.
        let embedding = weight_data(&self.embedding);
        let mut h = Vec::with_capacity(batch * seq * hidden);
        for (token, &id) in ids.iter().enumerate() {
            let id = usize::try_from(id)
                .ok()
                .filter(|&id| id < vocab_size)
                .ok_or_else(|| RunError::Failed(format!("token id {} out of range", id)))?;
            let pos = positions[token] as f32;
            for j in 0..hidden {
                let freq = 1. / 10000f32.powf((2 * (j / 2)) as f32 / hidden as f32);
                let angle = pos * freq;
                let enc = if j % 2 == 0 { angle.sin() } else { angle.cos() };
                h.push(embedding[id * hidden + j] + 0.1 * enc);
            }
        }

        let rows = batch * seq;
        let group = heads / kv_heads;
        let scale = 1. / (head_dim as f32).sqrt();
        let mut new_keys = Vec::with_capacity(self.layers.len());
        let mut new_values = Vec::with_capacity(self.layers.len());

        for (l, layer) in self.layers.iter().enumerate() {
            let x = rms_norm(&h, hidden, eps);
            let q = matmul(&x, rows, hidden, &weight_data(&layer.wq), heads * head_dim);
            let k = matmul(&x, rows, hidden, &weight_data(&layer.wk), kv_heads * head_dim);
            let v = matmul(&x, rows, hidden, &weight_data(&layer.wv), kv_heads * head_dim);

            // Append the new keys and values to the cache.
            let (past_k, past_v) = match &past {
                Some((keys, values)) => (keys[l].to_f64_vec(), values[l].to_f64_vec()),
                None => (Vec::new(), Vec::new()),
            };
            let mut cache_k = vec![0f32; batch * kv_heads * total * head_dim];
            let mut cache_v = cache_k.clone();
            for b in 0..batch {
                for kv in 0..kv_heads {
                    for t in 0..total {
                        for d in 0..head_dim {
                            let dst = ((b * kv_heads + kv) * total + t) * head_dim + d;
                            if t < past_len {
                                let src = ((b * kv_heads + kv) * past_len + t) * head_dim + d;
                                cache_k[dst] = past_k[src] as f32;
                                cache_v[dst] = past_v[src] as f32;
                            } else {
                                let src = (b * seq + t - past_len) * kv_heads * head_dim + kv * head_dim + d;
                                cache_k[dst] = k[src];
                                cache_v[dst] = v[src];
                            }
                        }
                    }
                }
            }

            let mut attn = vec![0f32; rows * heads * head_dim];
            let mut scores = vec![0f32; total];
            for b in 0..batch {
                for head in 0..heads {
                    let kv = head / group;
                    for i in 0..seq {
                        let q_off = (b * seq + i) * heads * head_dim + head * head_dim;
                        let q_row = &q[q_off..q_off + head_dim];
                        let mut max_score = f32::NEG_INFINITY;
                        for t in 0..total {
                            let visible = t <= past_len + i && mask[b * total + t] != 0.;
                            scores[t] = if visible {
                                let k_off = ((b * kv_heads + kv) * total + t) * head_dim;
                                let dot: f32 = q_row
                                    .iter()
                                    .zip(&cache_k[k_off..k_off + head_dim])
                                    .map(|(a, b)| a * b)
                                    .sum();
                                dot * scale
                            } else {
                                f32::NEG_INFINITY
                            };
                            max_score = max_score.max(scores[t]);
                        }
                        if max_score == f32::NEG_INFINITY {
                            continue;
                        }
                        let mut denom = 0.;
                        for score in scores.iter_mut() {
                            *score = (*score - max_score).exp();
                            denom += *score;
                        }
                        let out = &mut attn[q_off..q_off + head_dim];
                        for t in 0..total {
                            let w = scores[t] / denom;
                            if w == 0. {
                                continue;
                            }
                            let v_off = ((b * kv_heads + kv) * total + t) * head_dim;
                            for (o, &val) in out.iter_mut().zip(&cache_v[v_off..v_off + head_dim]) {
                                *o += w * val;
                            }
                        }
                    }
                }
            }

            let attn_out = matmul(&attn, rows, heads * head_dim, &weight_data(&layer.wo), hidden);
            for (x, a) in h.iter_mut().zip(attn_out) {
                *x += a;
            }

            let x = rms_norm(&h, hidden, eps);
            let mut up = matmul(&x, rows, hidden, &weight_data(&layer.w_up), inter);
            for u in up.iter_mut() {
                *u = u.max(0.);
            }
            let down = matmul(&up, rows, inter, &weight_data(&layer.w_down), hidden);
            for (x, d) in h.iter_mut().zip(down) {
                *x += d;
            }

            let cache_shape = [batch, kv_heads, total, head_dim];
            new_keys.push(Tensor::from_data(&cache_shape, cache_k).into());
            new_values.push(Tensor::from_data(&cache_shape, cache_v).into());
        }

        // Project onto the vocabulary with the embedding matrix.
        let x = rms_norm(&h, hidden, eps);
        let mut logits = Vec::with_capacity(rows * vocab_size);
        for row in x.chunks(hidden) {
            for token in embedding.chunks(hidden) {
                logits.push(row.iter().zip(token).map(|(a, b)| a * b).sum::<f32>());
            }
        }
        let logits = Tensor::from_data(&[batch, seq, vocab_size], logits);

        let output = Tree::record(
            RecordKind::named("CausalLMOutputWithPast", &["logits", "past_key_values"]),
            vec![
                Node::tensor(logits),
                Node::dynamic_cache(new_keys, new_values),
            ],
        )?;
        Ok(output)
    }
}
