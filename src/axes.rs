//! Classification of tensor axes as static or dynamic.

use std::fmt;

use serde::{Serialize, Serializer};
use smallvec::SmallVec;

use crate::errors::StructuralError;
use crate::tree::{LeafPath, Node};
use crate::value::Leaf;

/// Marker which asks an exporter to decide whether an axis is dynamic,
/// instead of naming the dimension.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DimMarker {
    /// Let the exporter infer whether the axis is dynamic.
    Auto,
    /// The axis is dynamic but has no user-chosen name.
    Dynamic,
}

impl fmt::Display for DimMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimMarker::Auto => write!(f, "AUTO"),
            DimMarker::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

impl Serialize for DimMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Controls what is assigned to dynamic axes: a name generated from a
/// prefix, or a shared marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DimPrefix {
    Name(String),
    Marker(DimMarker),
}

impl Default for DimPrefix {
    fn default() -> DimPrefix {
        DimPrefix::Name("d".to_string())
    }
}

impl From<&str> for DimPrefix {
    fn from(prefix: &str) -> DimPrefix {
        DimPrefix::Name(prefix.to_string())
    }
}

impl From<DimMarker> for DimPrefix {
    fn from(marker: DimMarker) -> DimPrefix {
        DimPrefix::Marker(marker)
    }
}

/// Specification for one axis of an input.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(untagged)]
pub enum DimSpec {
    /// Dynamic axis with a symbolic name.
    Named(String),
    /// Dynamic axis with a shared marker instead of a name.
    Marker(DimMarker),
    /// Static axis with a known size.
    Fixed(usize),
}

impl DimSpec {
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, DimSpec::Fixed(_))
    }

    /// Return the symbolic name, if this is a named dynamic axis.
    pub fn name(&self) -> Option<&str> {
        match self {
            DimSpec::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for DimSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSpec::Named(name) => write!(f, "{}", name),
            DimSpec::Marker(marker) => write!(f, "{}", marker),
            DimSpec::Fixed(size) => write!(f, "{}", size),
        }
    }
}

/// Classification of one axis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AxisClass {
    /// The axis has the same size in every example.
    Static(usize),
    Dynamic(DimSpec),
}

/// Axis classifications for one leaf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LeafAxes {
    /// A tensor leaf, with one entry per axis.
    Tensor(SmallVec<[AxisClass; 4]>),
    /// A scalar or `None` leaf, which has no axes.
    Other,
}

/// One row of an [`AxisTable`].
#[derive(Debug)]
pub struct AxisDescriptor<'a> {
    pub path: &'a LeafPath,
    pub axis: usize,
    pub class: &'a AxisClass,
}

/// Axis classifications for every leaf of a value, in walk order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisTable {
    paths: Vec<LeafPath>,
    leaves: Vec<LeafAxes>,
}

impl AxisTable {
    fn push(&mut self, path: LeafPath, axes: LeafAxes) {
        self.paths.push(path);
        self.leaves.push(axes);
    }

    /// Return the classifications of each leaf in walk order.
    pub fn leaves(&self) -> &[LeafAxes] {
        &self.leaves
    }

    /// List every tensor axis with its leaf path and classification.
    pub fn descriptors(&self) -> Vec<AxisDescriptor<'_>> {
        self.paths
            .iter()
            .zip(&self.leaves)
            .flat_map(|(path, leaf)| {
                let axes: &[AxisClass] = match leaf {
                    LeafAxes::Tensor(axes) => axes,
                    LeafAxes::Other => &[],
                };
                axes.iter()
                    .enumerate()
                    .map(move |(axis, class)| AxisDescriptor { path, axis, class })
            })
            .collect()
    }

    /// Return the dynamic axis specifications in walk order.
    pub fn dynamic_dims(&self) -> Vec<&DimSpec> {
        self.descriptors()
            .into_iter()
            .filter_map(|desc| match desc.class {
                AxisClass::Dynamic(spec) => Some(spec),
                AxisClass::Static(_) => None,
            })
            .collect()
    }
}

/// Classify the axes of one top-level input across several examples.
///
/// `examples` holds the value of the input at position `input_index` in each
/// example. An axis is dynamic if its size differs between examples, or if
/// `force_dynamic` is set. Dynamic axes are named
/// `<prefix>_<input_index>I<path code><axis>`, where the path code locates the
/// leaf within the input (see [`LeafPath::code`]).
///
/// Fails if the examples differ in structure, if the leaves at one position
/// are not all tensors or all non-tensors, or if tensors at one position have
/// different ranks.
pub fn classify(
    examples: &[&Node],
    input_index: usize,
    prefix: &DimPrefix,
    force_dynamic: bool,
) -> Result<AxisTable, StructuralError> {
    let Some((first, rest)) = examples.split_first() else {
        return Err(StructuralError::Signature("no examples to classify".into()));
    };
    for other in rest {
        first.check_same_structure(*other)?;
    }

    let leaves: Vec<Vec<&Leaf>> = examples.iter().map(|example| example.leaves()).collect();
    let mut table = AxisTable::default();

    for (pos, path) in first.leaf_paths().into_iter().enumerate() {
        let at_pos: Vec<&Leaf> = leaves.iter().map(|example| example[pos]).collect();
        let tensors: Vec<_> = at_pos.iter().filter_map(|leaf| leaf.as_value()).collect();

        let first_is_tensor = at_pos[0].as_value().is_some();
        if let Some(actual) = at_pos
            .iter()
            .find(|leaf| leaf.as_value().is_some() != first_is_tensor)
        {
            return Err(StructuralError::LeafMismatch {
                path,
                expected: at_pos[0].to_string(),
                actual: actual.to_string(),
            });
        }
        if tensors.is_empty() {
            table.push(path, LeafAxes::Other);
            continue;
        }

        let ndim = tensors[0].ndim();
        if tensors.iter().any(|t| t.ndim() != ndim) {
            return Err(StructuralError::RankMismatch {
                path,
                shapes: tensors.iter().map(|t| t.shape().to_vec()).collect(),
            });
        }

        let axes = (0..ndim)
            .map(|axis| {
                let size = tensors[0].shape()[axis];
                let varies = tensors.iter().any(|t| t.shape()[axis] != size);
                if varies || force_dynamic {
                    let spec = match prefix {
                        DimPrefix::Name(prefix) => DimSpec::Named(format!(
                            "{}_{}I{}{}",
                            prefix,
                            input_index,
                            path.code(),
                            axis
                        )),
                        DimPrefix::Marker(marker) => DimSpec::Marker(*marker),
                    };
                    AxisClass::Dynamic(spec)
                } else {
                    AxisClass::Static(size)
                }
            })
            .collect();
        table.push(path, LeafAxes::Tensor(axes));
    }

    Ok(table)
}

/// Classify every axis of every tensor in `node` as dynamic.
///
/// Tensors are numbered with the running `counter`, which is incremented once
/// per tensor so that several values can share one numbering. Dynamic axes
/// are named `<prefix>_<counter>_<axis>`.
pub fn classify_all_dynamic(node: &Node, prefix: &DimPrefix, counter: &mut usize) -> AxisTable {
    let mut table = AxisTable::default();
    for (path, leaf) in node.leaves_with_paths() {
        let Some(tensor) = leaf.as_value() else {
            table.push(path, LeafAxes::Other);
            continue;
        };
        let index = *counter;
        *counter += 1;
        let axes = (0..tensor.ndim())
            .map(|axis| {
                AxisClass::Dynamic(match prefix {
                    DimPrefix::Name(prefix) => {
                        DimSpec::Named(format!("{}_{}_{}", prefix, index, axis))
                    }
                    DimPrefix::Marker(marker) => DimSpec::Marker(*marker),
                })
            })
            .collect();
        table.push(path, LeafAxes::Tensor(axes));
    }
    table
}

#[cfg(test)]
mod tests {
    use rten_diagnostic_testing::{random_tensor, TestCases};

    use super::{classify, classify_all_dynamic, AxisClass, DimMarker, DimPrefix, DimSpec, LeafAxes};
    use crate::errors::StructuralError;
    use crate::tree::Node;

    fn names(specs: Vec<&DimSpec>) -> Vec<String> {
        specs.into_iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_static_and_dynamic() {
        #[derive(Debug)]
        struct Case {
            shapes: Vec<Vec<usize>>,
            expected: Vec<AxisClass>,
        }

        let cases = [
            Case {
                shapes: vec![vec![2, 3], vec![3, 3]],
                expected: vec![
                    AxisClass::Dynamic(DimSpec::Named("p_0I0".into())),
                    AxisClass::Static(3),
                ],
            },
            Case {
                shapes: vec![vec![2, 3], vec![2, 3]],
                expected: vec![AxisClass::Static(2), AxisClass::Static(3)],
            },
            Case {
                shapes: vec![vec![4], vec![5], vec![4]],
                expected: vec![AxisClass::Dynamic(DimSpec::Named("p_0I0".into()))],
            },
            Case {
                shapes: vec![vec![], vec![]],
                expected: vec![],
            },
        ];

        cases.test_each(|case| {
            let nodes: Vec<Node> = case
                .shapes
                .iter()
                .enumerate()
                .map(|(i, shape)| Node::tensor(random_tensor(shape, i as u64)))
                .collect();
            let refs: Vec<&Node> = nodes.iter().collect();
            let table = classify(&refs, 0, &"p".into(), false).unwrap();
            assert_eq!(
                table.leaves(),
                &[LeafAxes::Tensor(case.expected.iter().cloned().collect())]
            );
        })
    }

    #[test]
    fn test_classify_is_deterministic() {
        let a = Node::list(vec![
            Node::tensor(random_tensor(&[2, 3], 0)),
            Node::int(1),
            Node::tensor(random_tensor(&[2, 5], 1)),
        ]);
        let b = Node::list(vec![
            Node::tensor(random_tensor(&[3, 3], 2)),
            Node::int(2),
            Node::tensor(random_tensor(&[3, 6], 3)),
        ]);
        let first = classify(&[&a, &b], 1, &"dd".into(), false).unwrap();
        let second = classify(&[&a, &b], 1, &"dd".into(), false).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            names(first.dynamic_dims()),
            ["dd_1I_0l0", "dd_1I_2l0", "dd_1I_2l1"]
        );
        assert_eq!(first.leaves()[1], LeafAxes::Other);
    }

    #[test]
    fn test_classify_force_dynamic_and_marker() {
        let a = Node::tensor(random_tensor(&[2, 3], 0));
        let table = classify(&[&a], 0, &"d".into(), true).unwrap();
        assert_eq!(names(table.dynamic_dims()), ["d_0I0", "d_0I1"]);

        let table = classify(&[&a], 0, &DimMarker::Auto.into(), true).unwrap();
        assert_eq!(
            table.dynamic_dims(),
            [&DimSpec::Marker(DimMarker::Auto), &DimSpec::Marker(DimMarker::Auto)]
        );
    }

    #[test]
    fn test_classify_errors() {
        let a = Node::tensor(random_tensor(&[2, 3], 0));
        let b = Node::tensor(random_tensor(&[2, 3, 4], 0));
        let err = classify(&[&a, &b], 0, &DimPrefix::default(), false).unwrap_err();
        assert_eq!(
            err,
            StructuralError::RankMismatch {
                path: Default::default(),
                shapes: vec![vec![2, 3], vec![2, 3, 4]],
            }
        );

        let none = Node::none();
        let err = classify(&[&a, &none], 0, &DimPrefix::default(), false).unwrap_err();
        assert!(matches!(err, StructuralError::LeafMismatch { .. }));

        let list = Node::list(vec![a.clone()]);
        let err = classify(&[&a, &list], 0, &DimPrefix::default(), false).unwrap_err();
        assert!(matches!(err, StructuralError::ContainerMismatch { .. }));
    }

    #[test]
    fn test_classify_all_dynamic() {
        let node = Node::tuple(vec![
            Node::tensor(random_tensor(&[5, 6], 0)),
            Node::none(),
            Node::tensor(random_tensor(&[1, 6], 1)),
        ]);
        let mut counter = 0;
        let table = classify_all_dynamic(&node, &DimPrefix::default(), &mut counter);
        assert_eq!(counter, 2);
        assert_eq!(
            names(table.dynamic_dims()),
            ["d_0_0", "d_0_1", "d_1_0", "d_1_1"]
        );
        assert_eq!(table.descriptors().len(), 4);
        assert_eq!(table.descriptors()[2].path.to_string(), "[2]");
    }
}
