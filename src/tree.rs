//! Nested containers of model inputs and outputs.
//!
//! Model inputs and outputs are arbitrary nestings of lists, tuples, keyed
//! mappings and fixed-field records (such as key/value caches) with tensors,
//! scalars and `None` at the leaves. [`Tree`] represents such a nesting with a
//! generic leaf type, so the same walker serves concrete values ([`Node`]),
//! bare structure ([`Skeleton`]) and dynamic shape specifications.
//!
//! Leaves are always visited in the same order: sequence items in order,
//! mapping entries in insertion order and record fields in the order declared
//! by the record type.

use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::errors::StructuralError;
use crate::value::{Leaf, Scalar, Value};

/// Distinguishes lists from tuples so that rebuilt containers keep their
/// original flavor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeqKind {
    List,
    Tuple,
}

/// A record type with a fixed, ordered set of named fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordKind {
    /// Key/value cache of a decoder, one tensor per layer in each field.
    DynamicCache,

    /// Pair of caches used by encoder-decoder models.
    EncoderDecoderCache,

    /// Convolution and state-space caches of Mamba-style models.
    MambaCache,

    /// Any other record type, such as a model output class.
    Named { name: String, fields: Vec<String> },
}

impl RecordKind {
    pub fn named(name: impl Into<String>, fields: &[&str]) -> RecordKind {
        RecordKind::Named {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Return the name of the record type.
    pub fn name(&self) -> &str {
        match self {
            RecordKind::DynamicCache => "DynamicCache",
            RecordKind::EncoderDecoderCache => "EncoderDecoderCache",
            RecordKind::MambaCache => "MambaCache",
            RecordKind::Named { name, .. } => name,
        }
    }

    /// Return the field names, in the order in which fields are walked.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            RecordKind::DynamicCache => vec!["key_cache", "value_cache"],
            RecordKind::EncoderDecoderCache => {
                vec!["self_attention_cache", "cross_attention_cache"]
            }
            RecordKind::MambaCache => vec!["conv_states", "ssm_states"],
            RecordKind::Named { fields, .. } => fields.iter().map(|f| f.as_str()).collect(),
        }
    }
}

/// One step from a container to one of its children.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PathElem {
    /// Item of a sequence.
    Index(usize),
    /// Entry of a mapping, with its position and key.
    Key(usize, String),
    /// Field of a record, with its position and name.
    Field(usize, String),
}

/// Location of a value within a nested container.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct LeafPath(Vec<PathElem>);

impl LeafPath {
    pub fn root() -> LeafPath {
        LeafPath(Vec::new())
    }

    pub fn elems(&self) -> &[PathElem] {
        &self.0
    }

    /// Return a copy of this path with `elem` inserted at the front.
    pub fn prepend(&self, elem: PathElem) -> LeafPath {
        let mut elems = Vec::with_capacity(self.0.len() + 1);
        elems.push(elem);
        elems.extend(self.0.iter().cloned());
        LeafPath(elems)
    }

    /// Return a compact code for this path, used in generated dimension
    /// names.
    ///
    /// Each step is encoded as `_<position>l` for a sequence item and
    /// `_<position>o` for a mapping entry or record field, so a code never
    /// collides with the code of a different path.
    pub fn code(&self) -> String {
        self.0
            .iter()
            .map(|elem| match elem {
                PathElem::Index(i) => format!("_{}l", i),
                PathElem::Key(i, _) | PathElem::Field(i, _) => format!("_{}o", i),
            })
            .collect()
    }
}

impl From<Vec<PathElem>> for LeafPath {
    fn from(elems: Vec<PathElem>) -> LeafPath {
        LeafPath(elems)
    }
}

impl fmt::Display for LeafPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for elem in &self.0 {
            match elem {
                PathElem::Index(i) => write!(f, "[{}]", i)?,
                PathElem::Key(_, key) => write!(f, "[{:?}]", key)?,
                PathElem::Field(_, name) => write!(f, ".{}", name)?,
            }
        }
        Ok(())
    }
}

/// A nested container with leaves of type `L`.
#[derive(Clone, Debug, PartialEq)]
pub enum Tree<L> {
    Leaf(L),
    Sequence(SeqKind, Vec<Tree<L>>),
    /// Keyed entries in insertion order.
    Mapping(Vec<(String, Tree<L>)>),
    /// Fields of a record, in the order given by [`RecordKind::fields`].
    Record(RecordKind, Vec<Tree<L>>),
}

/// A concrete model input or output.
pub type Node = Tree<Leaf>;

/// The structure of a [`Tree`] without its leaves.
pub type Skeleton = Tree<()>;

impl<L> Tree<L> {
    /// Create a record, checking that one value is given per declared field.
    pub fn record(kind: RecordKind, fields: Vec<Tree<L>>) -> Result<Tree<L>, StructuralError> {
        let expected = kind.fields().len();
        if fields.len() != expected {
            return Err(StructuralError::RecordFields {
                record: kind.name().to_string(),
                expected,
                actual: fields.len(),
            });
        }
        Ok(Tree::Record(kind, fields))
    }

    /// Return the children of this node along with the path step to each.
    pub fn children(&self) -> Vec<(PathElem, &Tree<L>)> {
        match self {
            Tree::Leaf(_) => Vec::new(),
            Tree::Sequence(_, items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| (PathElem::Index(i), item))
                .collect(),
            Tree::Mapping(entries) => entries
                .iter()
                .enumerate()
                .map(|(i, (key, value))| (PathElem::Key(i, key.clone()), value))
                .collect(),
            Tree::Record(kind, fields) => kind
                .fields()
                .into_iter()
                .zip(fields)
                .enumerate()
                .map(|(i, (name, value))| (PathElem::Field(i, name.to_string()), value))
                .collect(),
        }
    }

    /// Return the child reached by one path step.
    ///
    /// Mapping entries are looked up by key rather than position, so this
    /// works on trees from which some entries were dropped.
    pub fn child(&self, elem: &PathElem) -> Option<&Tree<L>> {
        match (self, elem) {
            (Tree::Sequence(_, items), PathElem::Index(i)) => items.get(*i),
            (Tree::Mapping(entries), PathElem::Key(_, key)) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            (Tree::Record(kind, fields), PathElem::Field(_, name)) => kind
                .fields()
                .iter()
                .position(|f| *f == name.as_str())
                .and_then(|i| fields.get(i)),
            _ => None,
        }
    }

    /// Return the subtree at `path`, if it exists.
    pub fn at(&self, path: &LeafPath) -> Option<&Tree<L>> {
        path.elems()
            .iter()
            .try_fold(self, |node, elem| node.child(elem))
    }

    /// Return the leaves of this tree in walk order.
    pub fn leaves(&self) -> Vec<&L> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a L>) {
        match self {
            Tree::Leaf(leaf) => leaves.push(leaf),
            Tree::Sequence(_, items) | Tree::Record(_, items) => {
                items.iter().for_each(|item| item.collect_leaves(leaves))
            }
            Tree::Mapping(entries) => entries
                .iter()
                .for_each(|(_, value)| value.collect_leaves(leaves)),
        }
    }

    /// Return the leaves of this tree in walk order, with their paths.
    pub fn leaves_with_paths(&self) -> Vec<(LeafPath, &L)> {
        let mut leaves = Vec::new();
        self.collect_paths(&mut Vec::new(), &mut leaves);
        leaves
    }

    fn collect_paths<'a>(&'a self, path: &mut Vec<PathElem>, leaves: &mut Vec<(LeafPath, &'a L)>) {
        if let Tree::Leaf(leaf) = self {
            leaves.push((LeafPath(path.clone()), leaf));
            return;
        }
        for (elem, child) in self.children() {
            path.push(elem);
            child.collect_paths(path, leaves);
            path.pop();
        }
    }

    pub fn leaf_paths(&self) -> Vec<LeafPath> {
        self.leaves_with_paths()
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Sequence(_, items) | Tree::Record(_, items) => {
                items.iter().map(|item| item.leaf_count()).sum()
            }
            Tree::Mapping(entries) => entries.iter().map(|(_, value)| value.leaf_count()).sum(),
        }
    }

    /// Return the structure of this tree.
    pub fn skeleton(&self) -> Skeleton {
        self.map_ref(|_| ())
    }

    /// Split this tree into its leaves, in walk order, and its structure.
    ///
    /// The tree can be recreated with [`Skeleton::rebuild`].
    pub fn flatten(self) -> (Vec<L>, Skeleton) {
        let skeleton = self.skeleton();
        let mut leaves = Vec::with_capacity(skeleton.leaf_count());
        self.into_leaves(&mut leaves);
        (leaves, skeleton)
    }

    fn into_leaves(self, leaves: &mut Vec<L>) {
        match self {
            Tree::Leaf(leaf) => leaves.push(leaf),
            Tree::Sequence(_, items) | Tree::Record(_, items) => {
                items.into_iter().for_each(|item| item.into_leaves(leaves))
            }
            Tree::Mapping(entries) => entries
                .into_iter()
                .for_each(|(_, value)| value.into_leaves(leaves)),
        }
    }

    /// Replace each leaf with the result of `f`, keeping the structure.
    pub fn map<M>(self, mut f: impl FnMut(L) -> M) -> Tree<M> {
        self.map_with(&mut f)
    }

    fn map_with<M, F: FnMut(L) -> M>(self, f: &mut F) -> Tree<M> {
        match self {
            Tree::Leaf(leaf) => Tree::Leaf(f(leaf)),
            Tree::Sequence(kind, items) => Tree::Sequence(
                kind,
                items.into_iter().map(|item| item.map_with(f)).collect(),
            ),
            Tree::Mapping(entries) => Tree::Mapping(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.map_with(f)))
                    .collect(),
            ),
            Tree::Record(kind, fields) => Tree::Record(
                kind,
                fields.into_iter().map(|field| field.map_with(f)).collect(),
            ),
        }
    }

    /// Variant of [`map`](Tree::map) which borrows the leaves.
    pub fn map_ref<M>(&self, mut f: impl FnMut(&L) -> M) -> Tree<M> {
        self.map_ref_with(&mut f)
    }

    fn map_ref_with<M, F: FnMut(&L) -> M>(&self, f: &mut F) -> Tree<M> {
        match self {
            Tree::Leaf(leaf) => Tree::Leaf(f(leaf)),
            Tree::Sequence(kind, items) => {
                Tree::Sequence(*kind, items.iter().map(|item| item.map_ref_with(f)).collect())
            }
            Tree::Mapping(entries) => Tree::Mapping(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.map_ref_with(f)))
                    .collect(),
            ),
            Tree::Record(kind, fields) => Tree::Record(
                kind.clone(),
                fields.iter().map(|field| field.map_ref_with(f)).collect(),
            ),
        }
    }

    /// Check that `other` has the same containers as `self`: same sequence
    /// kinds and lengths, same mapping keys in the same order and same record
    /// types. Leaves are not compared.
    pub fn check_same_structure<M>(&self, other: &Tree<M>) -> Result<(), StructuralError> {
        self.check_structure_at(other, &mut Vec::new())
    }

    fn check_structure_at<M>(
        &self,
        other: &Tree<M>,
        path: &mut Vec<PathElem>,
    ) -> Result<(), StructuralError> {
        let same_container = match (self, other) {
            (Tree::Leaf(_), Tree::Leaf(_)) => return Ok(()),
            (Tree::Sequence(kind_a, a), Tree::Sequence(kind_b, b)) => {
                kind_a == kind_b && a.len() == b.len()
            }
            (Tree::Mapping(a), Tree::Mapping(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|((ka, _), (kb, _))| ka == kb)
            }
            (Tree::Record(kind_a, a), Tree::Record(kind_b, b)) => {
                kind_a == kind_b && a.len() == b.len()
            }
            _ => false,
        };
        if !same_container {
            return Err(StructuralError::ContainerMismatch {
                path: LeafPath(path.clone()),
                expected: self.describe_container(),
                actual: other.describe_container(),
            });
        }
        for ((elem, a), (_, b)) in self.children().into_iter().zip(other.children()) {
            path.push(elem);
            a.check_structure_at(b, path)?;
            path.pop();
        }
        Ok(())
    }

    /// Describe the outermost container of this tree, eg. "list of 2".
    pub fn describe_container(&self) -> String {
        match self {
            Tree::Leaf(_) => "leaf".to_string(),
            Tree::Sequence(SeqKind::List, items) => format!("list of {}", items.len()),
            Tree::Sequence(SeqKind::Tuple, items) => format!("tuple of {}", items.len()),
            Tree::Mapping(entries) => {
                let keys: Vec<_> = entries.iter().map(|(key, _)| key.as_str()).collect();
                format!("dict with keys {:?}", keys)
            }
            Tree::Record(kind, _) => kind.name().to_string(),
        }
    }
}

impl Skeleton {
    /// Recreate a tree with this structure from leaves given in walk order.
    ///
    /// Fails if the number of leaves differs from the number of leaf
    /// positions in the skeleton.
    pub fn rebuild<M>(&self, leaves: impl IntoIterator<Item = M>) -> Result<Tree<M>, StructuralError> {
        let expected = self.leaf_count();
        let mut leaves = leaves.into_iter();
        let mut taken = 0;
        let tree = self
            .rebuild_from(&mut leaves, &mut taken)
            .ok_or(StructuralError::LeafCount {
                expected,
                actual: taken,
            })?;
        let extra = leaves.count();
        if extra > 0 {
            return Err(StructuralError::LeafCount {
                expected,
                actual: expected + extra,
            });
        }
        Ok(tree)
    }

    fn rebuild_from<M, I: Iterator<Item = M>>(&self, leaves: &mut I, taken: &mut usize) -> Option<Tree<M>> {
        let tree = match self {
            Tree::Leaf(()) => {
                let leaf = leaves.next()?;
                *taken += 1;
                Tree::Leaf(leaf)
            }
            Tree::Sequence(kind, items) => Tree::Sequence(
                *kind,
                items
                    .iter()
                    .map(|item| item.rebuild_from(leaves, taken))
                    .collect::<Option<Vec<_>>>()?,
            ),
            Tree::Mapping(entries) => Tree::Mapping(
                entries
                    .iter()
                    .map(|(key, value)| Some((key.clone(), value.rebuild_from(leaves, taken)?)))
                    .collect::<Option<Vec<_>>>()?,
            ),
            Tree::Record(kind, fields) => Tree::Record(
                kind.clone(),
                fields
                    .iter()
                    .map(|field| field.rebuild_from(leaves, taken))
                    .collect::<Option<Vec<_>>>()?,
            ),
        };
        Some(tree)
    }
}

impl Node {
    pub fn tensor(value: impl Into<Value>) -> Node {
        Tree::Leaf(Leaf::Tensor(value.into()))
    }

    pub fn int(value: i64) -> Node {
        Tree::Leaf(Leaf::Scalar(Scalar::Int(value)))
    }

    pub fn float(value: f64) -> Node {
        Tree::Leaf(Leaf::Scalar(Scalar::Float(value)))
    }

    pub fn none() -> Node {
        Tree::Leaf(Leaf::None)
    }

    pub fn list(items: Vec<Node>) -> Node {
        Tree::Sequence(SeqKind::List, items)
    }

    pub fn tuple(items: Vec<Node>) -> Node {
        Tree::Sequence(SeqKind::Tuple, items)
    }

    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Node {
        Tree::Mapping(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Create a key/value cache holding one key and one value tensor per
    /// layer.
    pub fn dynamic_cache(key_cache: Vec<Value>, value_cache: Vec<Value>) -> Node {
        Tree::Record(
            RecordKind::DynamicCache,
            vec![
                Node::list(key_cache.into_iter().map(Node::tensor).collect()),
                Node::list(value_cache.into_iter().map(Node::tensor).collect()),
            ],
        )
    }

    /// Return the tensor if this node is a tensor leaf.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Tree::Leaf(leaf) => leaf.as_value(),
            _ => None,
        }
    }

    /// Return all tensor leaves in walk order.
    pub fn tensors(&self) -> Vec<&Value> {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| leaf.as_value())
            .collect()
    }
}

impl<L: fmt::Display> fmt::Display for Tree<L> {
    /// Summarize the structure, types and shapes, eg.
    /// `dict(input_ids: i32 [2, 3], past_key_values: DynamicCache(...))`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_items<L: fmt::Display>(
            f: &mut fmt::Formatter<'_>,
            items: impl Iterator<Item = (Option<String>, L)>,
        ) -> fmt::Result {
            for (i, (label, item)) in items.enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                if let Some(label) = label {
                    write!(f, "{}: ", label)?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            Tree::Leaf(leaf) => write!(f, "{}", leaf),
            Tree::Sequence(kind, items) => {
                let (open, close) = match kind {
                    SeqKind::List => ("[", "]"),
                    SeqKind::Tuple => ("(", ")"),
                };
                write!(f, "{}", open)?;
                write_items(f, items.iter().map(|item| (None, item)))?;
                write!(f, "{}", close)
            }
            Tree::Mapping(entries) => {
                write!(f, "dict(")?;
                write_items(
                    f,
                    entries.iter().map(|(key, value)| (Some(key.clone()), value)),
                )?;
                write!(f, ")")
            }
            Tree::Record(kind, fields) => {
                write!(f, "{}(", kind.name())?;
                write_items(
                    f,
                    kind.fields()
                        .into_iter()
                        .zip(fields)
                        .map(|(name, value)| (Some(name.to_string()), value)),
                )?;
                write!(f, ")")
            }
        }
    }
}

/// Trees serialize to plain JSON-like data: sequences as arrays, mappings and
/// records as objects.
impl<L: Serialize> Serialize for Tree<L> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Tree::Leaf(leaf) => leaf.serialize(serializer),
            Tree::Sequence(_, items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Tree::Mapping(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Tree::Record(kind, fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (name, value) in kind.fields().into_iter().zip(fields) {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}

/// One concrete call signature for a model: positional arguments followed
/// by keyword arguments in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExampleInput {
    pub args: Vec<Node>,
    pub kwargs: Vec<(String, Node)>,
}

impl ExampleInput {
    pub fn new(args: Vec<Node>, kwargs: Vec<(String, Node)>) -> ExampleInput {
        ExampleInput { args, kwargs }
    }

    pub fn from_args(args: Vec<Node>) -> ExampleInput {
        ExampleInput {
            args,
            kwargs: Vec::new(),
        }
    }

    pub fn from_kwargs<K: Into<String>>(kwargs: impl IntoIterator<Item = (K, Node)>) -> ExampleInput {
        ExampleInput {
            args: Vec::new(),
            kwargs: kwargs
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Node> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Node> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Look up an input which may be passed either by position or by name.
    pub fn get(&self, index: usize, name: &str) -> Option<&Node> {
        self.arg(index).or_else(|| self.kwarg(name))
    }

    /// Return the number of top-level values (positional and keyword).
    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over top-level values, positional arguments first.
    pub fn top_level(&self) -> impl Iterator<Item = (PathElem, &Node)> {
        let args = self
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| (PathElem::Index(i), arg));
        let kwargs = self
            .kwargs
            .iter()
            .enumerate()
            .map(|(i, (key, value))| (PathElem::Key(i, key.clone()), value));
        args.chain(kwargs)
    }

    /// Return the leaves of all top-level values in walk order.
    pub fn leaves(&self) -> Vec<&Leaf> {
        self.top_level().flat_map(|(_, value)| value.leaves()).collect()
    }

    /// Remove keyword arguments for which `keep` returns false.
    pub fn retain_kwargs(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.kwargs.retain(|(key, _)| keep(key));
    }

    /// Check that `other` has the same positional count, the same keyword
    /// names in the same order and the same container structure for each
    /// value.
    pub fn check_same_signature(&self, other: &ExampleInput) -> Result<(), StructuralError> {
        if self.args.len() != other.args.len() {
            return Err(StructuralError::Signature(format!(
                "{} positional arguments vs {}",
                self.args.len(),
                other.args.len()
            )));
        }
        let keys = |input: &ExampleInput| -> Vec<String> {
            input.kwargs.iter().map(|(key, _)| key.clone()).collect()
        };
        if keys(self) != keys(other) {
            return Err(StructuralError::Signature(format!(
                "keyword arguments {:?} vs {:?}",
                keys(self),
                keys(other)
            )));
        }
        for ((elem, a), (_, b)) in self.top_level().zip(other.top_level()) {
            a.check_same_structure(b).map_err(|err| err.within(elem))?;
        }
        Ok(())
    }
}

impl fmt::Display for ExampleInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (elem, value)) in self.top_level().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let PathElem::Key(_, key) = elem {
                write!(f, "{}=", key)?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use rten_diagnostic_testing::{random_tensor, TestCases};
    use rten_tensor::Tensor;

    use super::{ExampleInput, LeafPath, Node, PathElem, RecordKind, SeqKind, Tree};
    use crate::errors::StructuralError;
    use crate::value::Leaf;

    fn cache(layers: usize, seq: usize) -> Node {
        let keys = (0..layers)
            .map(|i| random_tensor(&[2, 1, seq, 4], i as u64).into())
            .collect();
        let values = (0..layers)
            .map(|i| random_tensor(&[2, 1, seq, 4], 10 + i as u64).into())
            .collect();
        Node::dynamic_cache(keys, values)
    }

    #[test]
    fn test_flatten_rebuild_round_trip() {
        #[derive(Debug)]
        struct Case {
            node: Node,
            leaves: usize,
        }

        let cases = [
            Case {
                node: Node::tensor(random_tensor(&[2, 3], 0)),
                leaves: 1,
            },
            Case {
                node: Node::tuple(vec![
                    Node::tensor(random_tensor(&[5, 6], 0)),
                    Node::list(vec![Node::int(3), Node::none()]),
                ]),
                leaves: 3,
            },
            Case {
                node: Node::dict([
                    ("input_ids", Node::tensor(Tensor::from_data(&[1, 2], vec![3, 4]))),
                    ("past_key_values", cache(2, 5)),
                    ("scale", Node::float(0.5)),
                ]),
                leaves: 6,
            },
            Case {
                node: Node::list(Vec::new()),
                leaves: 0,
            },
        ];

        cases.test_each(|case| {
            let (leaves, skeleton) = case.node.clone().flatten();
            assert_eq!(leaves.len(), case.leaves);
            let rebuilt = skeleton.rebuild(leaves).unwrap();
            assert_eq!(rebuilt, case.node);
        })
    }

    #[test]
    fn test_rebuild_keeps_tuple_and_list() {
        let node = Node::tuple(vec![Node::list(vec![Node::int(1)]), Node::int(2)]);
        let (leaves, skeleton) = node.flatten();
        let rebuilt = skeleton.rebuild(leaves).unwrap();
        match rebuilt {
            Tree::Sequence(SeqKind::Tuple, items) => {
                assert!(matches!(items[0], Tree::Sequence(SeqKind::List, _)));
            }
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn test_rebuild_wrong_leaf_count() {
        let skeleton = Node::list(vec![Node::int(1), Node::int(2)]).skeleton();
        assert_eq!(
            skeleton.rebuild([Leaf::None]).err(),
            Some(StructuralError::LeafCount {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            skeleton.rebuild([Leaf::None, Leaf::None, Leaf::None]).err(),
            Some(StructuralError::LeafCount {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_record_walk_order() {
        let node = cache(2, 3);
        let paths: Vec<String> = node.leaf_paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            paths,
            [
                ".key_cache[0]",
                ".key_cache[1]",
                ".value_cache[0]",
                ".value_cache[1]"
            ]
        );
        assert_eq!(node.leaf_paths()[3].code(), "_1o_1l");

        let err = Tree::<()>::record(RecordKind::MambaCache, vec![Tree::Leaf(())]).err();
        assert_eq!(
            err,
            Some(StructuralError::RecordFields {
                record: "MambaCache".into(),
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn test_lookup_by_path() {
        let node = Node::dict([("a", Node::int(1)), ("cache", cache(2, 3))]);
        let path = node.leaf_paths()[3].clone();
        assert_eq!(path.to_string(), "[\"cache\"].value_cache[0]");
        assert_eq!(node.at(&path), Some(&Tree::Leaf(node.leaves()[3].clone())));

        // Mapping entries are found by key even if positions differ.
        let key = LeafPath::from(vec![PathElem::Key(5, "a".into())]);
        assert_eq!(node.at(&key), Some(&Node::int(1)));
        assert_eq!(node.at(&LeafPath::from(vec![PathElem::Index(0)])), None);
        assert_eq!(node.at(&LeafPath::root()), Some(&node));
    }

    #[test]
    fn test_mapping_keeps_insertion_order() {
        let node = Node::dict([("b", Node::int(1)), ("a", Node::int(2))]);
        let paths = node.leaf_paths();
        assert_eq!(paths[0].elems(), &[PathElem::Key(0, "b".into())]);
        assert_eq!(paths[1].elems(), &[PathElem::Key(1, "a".into())]);
    }

    #[test]
    fn test_check_same_structure() {
        let a = Node::dict([("x", Node::list(vec![Node::int(1), Node::int(2)]))]);
        let b = Node::dict([("x", Node::list(vec![Node::int(1)]))]);
        let err = a.check_same_structure(&b).unwrap_err();
        assert_eq!(
            err,
            StructuralError::ContainerMismatch {
                path: LeafPath::from(vec![PathElem::Key(0, "x".into())]),
                expected: "list of 2".into(),
                actual: "list of 1".into(),
            }
        );
        assert!(a.check_same_structure(&a.skeleton()).is_ok());

        let tuple = Node::tuple(vec![Node::int(1), Node::int(2)]);
        let list = Node::list(vec![Node::int(1), Node::int(2)]);
        assert!(tuple.check_same_structure(&list).is_err());
    }

    #[test]
    fn test_check_same_signature() {
        let a = ExampleInput::from_kwargs([("x", Node::int(1)), ("y", Node::int(2))]);
        let b = ExampleInput::from_kwargs([("y", Node::int(1)), ("x", Node::int(2))]);
        assert!(matches!(
            a.check_same_signature(&b),
            Err(StructuralError::Signature(_))
        ));

        let c = ExampleInput::from_args(vec![Node::list(vec![Node::int(1)])]);
        let d = ExampleInput::from_args(vec![Node::list(vec![])]);
        let err = c.check_same_signature(&d).unwrap_err();
        assert_eq!(
            err.to_string(),
            "container mismatch at [0]: expected list of 1, got list of 0"
        );
    }

    #[test]
    fn test_display() {
        let input = ExampleInput::new(
            vec![Node::tensor(random_tensor(&[2, 3], 0))],
            vec![("n".to_string(), Node::int(4))],
        );
        assert_eq!(input.to_string(), "(f32 [2, 3], n=int 4)");
        assert_eq!(
            cache(1, 2).to_string(),
            "DynamicCache(key_cache: [f32 [2, 1, 2, 4]], value_cache: [f32 [2, 1, 2, 4]])"
        );
    }
}
