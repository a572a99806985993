//! Synthesis of dynamic shape specifications from example inputs.
//!
//! A dynamic shape specification mirrors the structure of a model input.
//! Each tensor leaf is replaced by a map from axis index to a [`DimSpec`], and
//! other leaves by [`ShapeLeaf::Skip`]. Specifications are produced either
//! from a single example, where every axis is dynamic, or by comparing several
//! examples of the same signature, where only the axes whose size varies are
//! dynamic.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::ser::{SerializeMap, SerializeTuple};
use serde::{Serialize, Serializer};
use tracing::debug;

pub use crate::axes::{DimMarker, DimPrefix, DimSpec};
use crate::axes::{classify, classify_all_dynamic, AxisClass, AxisTable, LeafAxes};
use crate::errors::StructuralError;
use crate::tree::{ExampleInput, LeafPath, Node, PathElem, Tree};

/// Map from axis index to the specification of that axis.
pub type AxisMap = BTreeMap<usize, DimSpec>;

/// Leaf of a dynamic shape specification.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ShapeLeaf {
    /// Axis specifications for a tensor leaf. An empty map marks a tensor
    /// with no dynamic axis.
    Axes(AxisMap),
    /// Placeholder for a leaf with no shape (a scalar or `None`) or for a
    /// position kept only to preserve the structure.
    Skip,
}

impl ShapeLeaf {
    /// Create a leaf from `(axis, spec)` pairs.
    pub fn axes<S: Into<DimSpec>>(axes: impl IntoIterator<Item = (usize, S)>) -> ShapeLeaf {
        ShapeLeaf::Axes(axes.into_iter().map(|(i, s)| (i, s.into())).collect())
    }

    /// Return true if this leaf has at least one dynamic axis.
    pub fn is_dynamic(&self) -> bool {
        match self {
            ShapeLeaf::Axes(axes) => axes.values().any(|spec| spec.is_dynamic()),
            ShapeLeaf::Skip => false,
        }
    }
}

impl From<&str> for DimSpec {
    fn from(name: &str) -> DimSpec {
        DimSpec::Named(name.to_string())
    }
}

impl From<DimMarker> for DimSpec {
    fn from(marker: DimMarker) -> DimSpec {
        DimSpec::Marker(marker)
    }
}

impl fmt::Display for ShapeLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeLeaf::Axes(axes) => {
                write!(f, "{{")?;
                for (i, (axis, spec)) in axes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", axis, spec)?;
                }
                write!(f, "}}")
            }
            ShapeLeaf::Skip => write!(f, "None"),
        }
    }
}

/// Dynamic shape specification for one input value.
pub type DynamicShapes = Tree<ShapeLeaf>;

impl DynamicShapes {
    /// Return true if any leaf of this specification has a dynamic axis.
    pub fn has_dynamic(&self) -> bool {
        self.leaves().into_iter().any(|leaf| leaf.is_dynamic())
    }
}

/// Dynamic shape specifications for every input of a model call.
///
/// This mirrors [`ExampleInput`]. It serializes as a pair
/// `[args, kwargs]`, with keyword specifications as an object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputShapes {
    pub args: Vec<DynamicShapes>,
    pub kwargs: Vec<(String, DynamicShapes)>,
}

impl InputShapes {
    pub fn arg(&self, index: usize) -> Option<&DynamicShapes> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&DynamicShapes> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, shapes)| shapes)
    }

    /// Iterate over the specifications of top-level inputs, positional
    /// inputs first.
    pub fn top_level(&self) -> impl Iterator<Item = (PathElem, &DynamicShapes)> {
        let args = self
            .args
            .iter()
            .enumerate()
            .map(|(i, shapes)| (PathElem::Index(i), shapes));
        let kwargs = self
            .kwargs
            .iter()
            .enumerate()
            .map(|(i, (key, shapes))| (PathElem::Key(i, key.clone()), shapes));
        args.chain(kwargs)
    }

    /// Return true if any input has a dynamic axis.
    pub fn has_dynamic(&self) -> bool {
        self.top_level().any(|(_, shapes)| shapes.has_dynamic())
    }

    /// List every symbolic dimension with the location of its axis, in walk
    /// order.
    pub fn symbol_locations(&self) -> Vec<(String, &str)> {
        let mut symbols = Vec::new();
        for (elem, shapes) in self.top_level() {
            for (path, leaf) in shapes.leaves_with_paths() {
                let ShapeLeaf::Axes(axes) = leaf else {
                    continue;
                };
                for (axis, spec) in axes {
                    if let Some(name) = spec.name() {
                        let path = path.prepend(elem.clone());
                        symbols.push((format!("{} axis {}", path, axis), name));
                    }
                }
            }
        }
        symbols
    }

    /// Return every symbolic dimension name in walk order.
    pub fn symbols(&self) -> Vec<&str> {
        self.symbol_locations()
            .into_iter()
            .map(|(_, name)| name)
            .collect()
    }

    /// Check that no symbolic name is used for two different axes.
    pub fn check_unique_symbols(&self) -> Result<(), StructuralError> {
        let mut seen: FxHashMap<&str, String> = FxHashMap::default();
        for (location, name) in self.symbol_locations() {
            if let Some(first) = seen.get(name) {
                return Err(StructuralError::DuplicateSymbol {
                    name: name.to_string(),
                    first: first.clone(),
                    second: location,
                });
            }
            seen.insert(name, location);
        }
        Ok(())
    }

    /// Convert to JSON, in the same layout as the serialized form.
    pub fn to_json(&self) -> serde_json::Value {
        // Specifications only hold strings, integers and containers with
        // string keys, so conversion cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for InputShapes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Kwargs<'a>(&'a [(String, DynamicShapes)]);

        impl Serialize for Kwargs<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (key, shapes) in self.0 {
                    map.serialize_entry(key, shapes)?;
                }
                map.end()
            }
        }

        let mut pair = serializer.serialize_tuple(2)?;
        pair.serialize_element(&self.args)?;
        pair.serialize_element(&Kwargs(&self.kwargs))?;
        pair.end()
    }
}

impl fmt::Display for InputShapes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (elem, shapes)) in self.top_level().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let PathElem::Key(_, key) = elem {
                write!(f, "{}=", key)?;
            }
            write!(f, "{}", shapes)?;
        }
        write!(f, ")")
    }
}

/// Build the specification for `node` from its axis classifications.
///
/// In compact mode static axes are dropped. Mapping entries with no dynamic
/// axis are dropped. Sequence items and record fields with no dynamic axis
/// are kept as placeholders so that positions are preserved: an empty axis
/// map for a tensor and [`ShapeLeaf::Skip`] otherwise. A value with no
/// dynamic axis at all becomes a single placeholder.
///
/// Outside compact mode the specification has exactly the structure of
/// `node`, with static axes given as [`DimSpec::Fixed`].
pub fn synthesize(node: &Node, table: &AxisTable, compact: bool) -> DynamicShapes {
    let mut leaves = table.leaves().iter();
    let full = node.map_ref(|_| match leaves.next() {
        Some(LeafAxes::Tensor(axes)) => ShapeLeaf::Axes(
            axes.iter()
                .enumerate()
                .filter_map(|(axis, class)| match class {
                    AxisClass::Dynamic(spec) => Some((axis, spec.clone())),
                    AxisClass::Static(size) if !compact => Some((axis, DimSpec::Fixed(*size))),
                    AxisClass::Static(_) => None,
                })
                .collect(),
        ),
        Some(LeafAxes::Other) | None => ShapeLeaf::Skip,
    });

    if !compact {
        return full;
    }
    if full.has_dynamic() {
        compact_tree(full)
    } else {
        placeholder(&full)
    }
}

fn placeholder(shapes: &DynamicShapes) -> DynamicShapes {
    match shapes {
        Tree::Leaf(ShapeLeaf::Axes(_)) => Tree::Leaf(ShapeLeaf::Axes(AxisMap::new())),
        _ => Tree::Leaf(ShapeLeaf::Skip),
    }
}

fn compact_tree(shapes: DynamicShapes) -> DynamicShapes {
    let keep_position = |item: DynamicShapes| {
        if item.has_dynamic() {
            compact_tree(item)
        } else {
            placeholder(&item)
        }
    };
    match shapes {
        Tree::Leaf(leaf) => Tree::Leaf(leaf),
        Tree::Sequence(kind, items) => {
            Tree::Sequence(kind, items.into_iter().map(keep_position).collect())
        }
        Tree::Record(kind, fields) => {
            Tree::Record(kind, fields.into_iter().map(keep_position).collect())
        }
        Tree::Mapping(entries) => Tree::Mapping(
            entries
                .into_iter()
                .filter(|(_, value)| value.has_dynamic())
                .map(|(key, value)| (key, compact_tree(value)))
                .collect(),
        ),
    }
}

/// Return a specification for `node` in which every tensor axis is dynamic.
///
/// Tensors are numbered in walk order and axes are named
/// `<prefix>_<tensor>_<axis>`, or all set to the marker if `prefix` is one.
pub fn all_dynamic_shape_from_inputs(node: &Node, prefix: &DimPrefix) -> DynamicShapes {
    let mut counter = 0;
    let table = classify_all_dynamic(node, prefix, &mut counter);
    synthesize(node, &table, false)
}

/// Variant of [`all_dynamic_shape_from_inputs`] for all inputs of a call.
///
/// Tensors are numbered across positional inputs and then keyword inputs in
/// insertion order.
pub fn all_dynamic_shapes_for(example: &ExampleInput, prefix: &DimPrefix) -> InputShapes {
    let mut counter = 0;
    let mut shapes_for = |node: &Node| {
        let table = classify_all_dynamic(node, prefix, &mut counter);
        synthesize(node, &table, false)
    };
    let args = example.args.iter().map(&mut shapes_for).collect();
    let kwargs = example
        .kwargs
        .iter()
        .map(|(key, node)| (key.clone(), shapes_for(node)))
        .collect();
    InputShapes { args, kwargs }
}

/// Guess dynamic shapes by comparing several examples of the same call,
/// in compact mode.
///
/// See [`guess_dynamic_shapes`].
pub fn guess_dynamic_shapes_from_inputs(
    examples: &[ExampleInput],
    prefix: &DimPrefix,
) -> Result<InputShapes, StructuralError> {
    guess_dynamic_shapes(examples, prefix, true, false)
}

/// Guess dynamic shapes by comparing several examples of the same call.
///
/// Axes whose size differs between examples are dynamic, other axes are
/// static unless `force_dynamic` is set. Each top-level input is classified
/// separately. Positional inputs are numbered first, then keyword inputs in
/// sorted key order, so the numbering does not depend on the order in which
/// keyword arguments were supplied. The resulting specification keeps the
/// keyword order of the examples.
///
/// All examples must share the same signature and structure.
pub fn guess_dynamic_shapes(
    examples: &[ExampleInput],
    prefix: &DimPrefix,
    compact: bool,
    force_dynamic: bool,
) -> Result<InputShapes, StructuralError> {
    let Some((first, rest)) = examples.split_first() else {
        return Err(StructuralError::Signature("no example inputs".into()));
    };
    for other in rest {
        first.check_same_signature(other)?;
    }

    let shapes_for = |index: usize, elem: PathElem, values: Vec<&Node>| {
        classify(&values, index, prefix, force_dynamic)
            .map(|table| synthesize(values[0], &table, compact))
            .map_err(|err| err.within(elem))
    };

    let mut args = Vec::with_capacity(first.args.len());
    for i in 0..first.args.len() {
        let values = examples.iter().map(|example| &example.args[i]).collect();
        args.push(shapes_for(i, PathElem::Index(i), values)?);
    }

    let mut sorted_keys: Vec<&str> = first.kwargs.iter().map(|(key, _)| key.as_str()).collect();
    sorted_keys.sort_unstable();

    let mut kwargs = Vec::with_capacity(first.kwargs.len());
    for (pos, (key, _)) in first.kwargs.iter().enumerate() {
        let rank = sorted_keys
            .iter()
            .position(|k| *k == key.as_str())
            .unwrap_or(pos);
        let values = examples
            .iter()
            .map(|example| &example.kwargs[pos].1)
            .collect();
        let shapes = shapes_for(
            first.args.len() + rank,
            PathElem::Key(pos, key.clone()),
            values,
        )?;
        kwargs.push((key.clone(), shapes));
    }

    let shapes = InputShapes { args, kwargs };
    debug!(examples = examples.len(), compact, shapes = %shapes, "guessed dynamic shapes");
    Ok(shapes)
}

/// Return the leaf path and axis of every symbolic dimension in `shapes`.
pub fn dynamic_axes(shapes: &DynamicShapes) -> Vec<(LeafPath, usize)> {
    shapes
        .leaves_with_paths()
        .into_iter()
        .flat_map(|(path, leaf)| {
            let axes: Vec<usize> = match leaf {
                ShapeLeaf::Axes(axes) => axes
                    .iter()
                    .filter(|(_, spec)| spec.is_dynamic())
                    .map(|(axis, _)| *axis)
                    .collect(),
                ShapeLeaf::Skip => Vec::new(),
            };
            axes.into_iter().map(move |axis| (path.clone(), axis))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rten_diagnostic_testing::{random_ids, random_tensor, TestCases};
    use rten_tensor::Tensor;
    use serde_json::json;

    use super::{
        all_dynamic_shape_from_inputs, all_dynamic_shapes_for, dynamic_axes,
        guess_dynamic_shapes, guess_dynamic_shapes_from_inputs, DimMarker, DimPrefix, DimSpec,
        InputShapes, ShapeLeaf,
    };
    use crate::errors::StructuralError;
    use crate::tree::{ExampleInput, Node, SeqKind, Tree};
    use crate::value::Value;

    fn tensor(shape: &[usize]) -> Node {
        Node::tensor(random_tensor(shape, shape.iter().sum::<usize>() as u64))
    }

    /// Build inputs for a decoder with a key/value cache of `layers` layers.
    fn decoder_inputs(batch: usize, seq: usize, past: usize, layers: usize) -> ExampleInput {
        let cache = |seed| -> Vec<Value> {
            (0..layers)
                .map(|i| random_tensor(&[batch, 1, past, 8], seed + i as u64).into())
                .collect()
        };
        ExampleInput::from_kwargs([
            ("input_ids", Node::tensor(random_ids(&[batch, seq], 100, 0))),
            (
                "attention_mask",
                Node::tensor(Tensor::full(&[batch, seq + past], 1i32)),
            ),
            ("position_ids", Node::tensor(random_ids(&[batch, seq], 10, 1))),
            ("past_key_values", Node::dynamic_cache(cache(0), cache(100))),
        ])
    }

    #[test]
    fn test_all_dynamic_single_input() {
        let node = Node::tuple(vec![tensor(&[5, 6]), tensor(&[1, 6])]);
        let shapes = all_dynamic_shape_from_inputs(&node, &DimPrefix::default());
        assert_eq!(
            serde_json::to_value(&shapes).unwrap(),
            json!([{"0": "d_0_0", "1": "d_0_1"}, {"0": "d_1_0", "1": "d_1_1"}])
        );
        assert!(matches!(shapes, Tree::Sequence(SeqKind::Tuple, _)));
    }

    #[test]
    fn test_all_dynamic_with_marker() {
        let node = Node::list(vec![tensor(&[5, 6]), tensor(&[1, 6])]);
        let shapes = all_dynamic_shape_from_inputs(&node, &DimMarker::Auto.into());
        let auto = ShapeLeaf::axes([(0, DimMarker::Auto), (1, DimMarker::Auto)]);
        assert_eq!(
            shapes,
            Tree::Sequence(
                SeqKind::List,
                vec![Tree::Leaf(auto.clone()), Tree::Leaf(auto)]
            )
        );
        assert!(shapes.has_dynamic());
        assert_eq!(
            serde_json::to_value(&shapes).unwrap(),
            json!([{"0": "AUTO", "1": "AUTO"}, {"0": "AUTO", "1": "AUTO"}])
        );
    }

    #[test]
    fn test_all_dynamic_for_decoder_inputs() {
        let example = decoder_inputs(2, 3, 30, 1);
        let shapes = all_dynamic_shapes_for(&example, &DimPrefix::default());
        assert_eq!(
            shapes.to_json(),
            json!([[], {
                "input_ids": {"0": "d_0_0", "1": "d_0_1"},
                "attention_mask": {"0": "d_1_0", "1": "d_1_1"},
                "position_ids": {"0": "d_2_0", "1": "d_2_1"},
                "past_key_values": {
                    "key_cache": [{"0": "d_3_0", "1": "d_3_1", "2": "d_3_2", "3": "d_3_3"}],
                    "value_cache": [{"0": "d_4_0", "1": "d_4_1", "2": "d_4_2", "3": "d_4_3"}],
                },
            }])
        );
        assert!(shapes.check_unique_symbols().is_ok());
    }

    #[test]
    fn test_guess_grouped_examples() {
        let examples = [decoder_inputs(2, 3, 30, 1), decoder_inputs(3, 4, 31, 1)];
        let shapes = guess_dynamic_shapes_from_inputs(&examples, &"dd".into()).unwrap();
        assert_eq!(
            serde_json::to_value(&shapes).unwrap(),
            json!([[], {
                "attention_mask": {"0": "dd_0I0", "1": "dd_0I1"},
                "input_ids": {"0": "dd_1I0", "1": "dd_1I1"},
                "past_key_values": {
                    "key_cache": [{"0": "dd_2I_0o_0l0", "2": "dd_2I_0o_0l2"}],
                    "value_cache": [{"0": "dd_2I_1o_0l0", "2": "dd_2I_1o_0l2"}],
                },
                "position_ids": {"0": "dd_3I0", "1": "dd_3I1"},
            }])
        );

        // Keyword order of the examples is preserved.
        let keys: Vec<&str> = shapes.kwargs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["input_ids", "attention_mask", "position_ids", "past_key_values"]);
        assert!(shapes.check_unique_symbols().is_ok());
    }

    #[test]
    fn test_guess_is_deterministic_and_unique() {
        let examples = [decoder_inputs(2, 3, 30, 3), decoder_inputs(3, 4, 31, 3)];
        let a = guess_dynamic_shapes_from_inputs(&examples, &DimPrefix::default()).unwrap();
        let b = guess_dynamic_shapes_from_inputs(&examples, &DimPrefix::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.symbols(), b.symbols());
        assert!(a.check_unique_symbols().is_ok());
        assert_eq!(a.symbols().len(), 2 * 3 + 2 * 3 * 2);
    }

    #[test]
    fn test_guess_static_axes() {
        #[derive(Debug)]
        struct Case {
            shapes: [Vec<usize>; 2],
            compact: bool,
            expected: serde_json::Value,
        }

        let cases = [
            Case {
                shapes: [vec![2, 8], vec![3, 8]],
                compact: true,
                expected: json!({"0": "d_0I0"}),
            },
            Case {
                shapes: [vec![2, 8], vec![3, 8]],
                compact: false,
                expected: json!({"0": "d_0I0", "1": 8}),
            },
            Case {
                shapes: [vec![2, 8], vec![2, 8]],
                compact: true,
                expected: json!({}),
            },
        ];

        cases.test_each(|case| {
            let examples: Vec<ExampleInput> = case
                .shapes
                .iter()
                .map(|shape| ExampleInput::from_args(vec![tensor(shape)]))
                .collect();
            let shapes =
                guess_dynamic_shapes(&examples, &DimPrefix::default(), case.compact, false)
                    .unwrap();
            assert_eq!(serde_json::to_value(&shapes.args[0]).unwrap(), case.expected);
        })
    }

    #[test]
    fn test_compact_placeholders() {
        let example = |n: usize| {
            ExampleInput::from_args(vec![Node::list(vec![
                tensor(&[2, 4]),
                Node::int(1),
                tensor(&[n, 4]),
            ])])
        };
        let shapes =
            guess_dynamic_shapes_from_inputs(&[example(3), example(5)], &DimPrefix::default())
                .unwrap();
        assert_eq!(
            serde_json::to_value(&shapes.args[0]).unwrap(),
            json!([{}, null, {"0": "d_0I_2l0"}])
        );

        let example = |n: usize| {
            ExampleInput::from_args(vec![Node::dict([
                ("fixed", tensor(&[2, 4])),
                ("varying", tensor(&[n, 4])),
            ])])
        };
        let shapes =
            guess_dynamic_shapes_from_inputs(&[example(3), example(5)], &DimPrefix::default())
                .unwrap();
        assert_eq!(
            serde_json::to_value(&shapes.args[0]).unwrap(),
            json!({"varying": {"0": "d_0I_1o0"}})
        );
        assert_eq!(dynamic_axes(&shapes.args[0]).len(), 1);

        // A value with no dynamic axis becomes a placeholder.
        let example = ExampleInput::from_args(vec![Node::list(vec![tensor(&[2])]), Node::int(3)]);
        let shapes =
            guess_dynamic_shapes_from_inputs(&[example.clone(), example], &DimPrefix::default())
                .unwrap();
        assert_eq!(serde_json::to_value(&shapes).unwrap(), json!([[null, null], {}]));
    }

    #[test]
    fn test_guess_errors() {
        let a = ExampleInput::from_args(vec![tensor(&[2, 3])]);
        let b = ExampleInput::from_args(vec![tensor(&[2, 3, 4])]);
        let err = guess_dynamic_shapes_from_inputs(&[a.clone(), b], &DimPrefix::default())
            .unwrap_err();
        assert!(matches!(err, StructuralError::RankMismatch { .. }));
        assert!(err.to_string().starts_with("rank mismatch at [0]"));

        let c = ExampleInput::from_kwargs([("x", tensor(&[2, 3]))]);
        let err = guess_dynamic_shapes_from_inputs(&[a, c], &DimPrefix::default()).unwrap_err();
        assert!(matches!(err, StructuralError::Signature(_)));

        let err = guess_dynamic_shapes_from_inputs(&[], &DimPrefix::default()).unwrap_err();
        assert!(matches!(err, StructuralError::Signature(_)));
    }

    #[test]
    fn test_duplicate_symbols() {
        let shapes = InputShapes {
            args: vec![
                Tree::Leaf(ShapeLeaf::axes([(0, "batch")])),
                Tree::Leaf(ShapeLeaf::axes([(0, DimSpec::from("batch"))])),
            ],
            kwargs: Vec::new(),
        };
        let err = shapes.check_unique_symbols().unwrap_err();
        assert_eq!(
            err,
            StructuralError::DuplicateSymbol {
                name: "batch".into(),
                first: "[0] axis 0".into(),
                second: "[1] axis 0".into(),
            }
        );
    }
}
