//! Reference implementation of the exporter families and graph runtime.
//!
//! [`ReferenceBackend`] "exports" a model by capturing it together with a
//! declaration of its inputs, derived from the example input and the dynamic
//! shapes. Graph exports serialize that declaration as JSON. Loading the JSON
//! back into the same backend, acting as a [`Runtime`], gives a session which
//! checks every feed against the declaration before running the captured
//! model. A static export therefore fails when run with inputs of a
//! different size, as it would with a real exporter.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rten_tensor::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dynamic_shapes::{DimSpec, DynamicShapes, InputShapes, ShapeLeaf};
use crate::errors::{ExportError, RunError};
use crate::exporter::{
    Decomposition, ExportBackend, Exporter, GraphBuilder, GraphExport, GraphOptions,
    ProgramOptions,
};
use crate::graph::{Dimension, GraphInput, Runtime, SerializedGraph, Session};
use crate::model::{Callable, Model};
use crate::tree::{ExampleInput, Node, PathElem, Tree};
use crate::value::{CastError, DataType, Leaf, Scalar, Value};

/// Identifies serialized graphs produced by [`ReferenceBackend`].
pub const GRAPH_FORMAT: &str = "rten-diagnostic-graph/1";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GraphFile {
    format: String,
    id: u64,
    model: String,
    inputs: Vec<GraphInput>,
}

struct ReferenceGraph {
    file: GraphFile,
}

impl SerializedGraph for ReferenceGraph {
    fn inputs(&self) -> &[GraphInput] {
        &self.file.inputs
    }

    fn serialize(&self) -> Result<Vec<u8>, RunError> {
        serde_json::to_vec(&self.file).map_err(|err| RunError::InvalidGraph(err.to_string()))
    }
}

impl GraphBuilder for ReferenceGraph {
    fn pretty_text(&self) -> String {
        let mut text = format!("graph {} (model {})\n", self.file.id, self.file.model);
        for input in &self.file.inputs {
            let dtype = input
                .dtype
                .map(|dtype| dtype.to_string())
                .unwrap_or_else(|| "?".to_string());
            text.push_str(&format!(
                "  input {}: {} {}\n",
                input.name,
                dtype,
                input.shape_string()
            ));
        }
        text
    }
}

/// A model captured by an export, with its example input as a template for
/// rebuilding inputs from graph feeds.
struct CapturedModel {
    model: Rc<dyn Model>,
    template: ExampleInput,
}

/// Return the data type and shape with which `leaf` is fed to a graph.
fn leaf_signature(leaf: &Leaf) -> Option<(DataType, Vec<usize>)> {
    match leaf {
        Leaf::Tensor(value) => Some((value.dtype(), value.shape().to_vec())),
        Leaf::Scalar(Scalar::Int(_)) => Some((DataType::Int32, vec![1])),
        Leaf::Scalar(Scalar::Float(_)) => Some((DataType::Float, vec![1])),
        Leaf::None => None,
    }
}

/// Return the name of the graph input for a top-level value.
fn top_level_name(elem: &PathElem) -> String {
    match elem {
        PathElem::Index(i) => format!("input_{}", i),
        PathElem::Key(_, key) | PathElem::Field(_, key) => key.clone(),
    }
}

fn shapes_for<'a>(shapes: Option<&'a InputShapes>, elem: &PathElem) -> Option<&'a DynamicShapes> {
    let shapes = shapes?;
    match elem {
        PathElem::Index(i) => shapes.arg(*i),
        PathElem::Key(_, key) | PathElem::Field(_, key) => shapes.kwarg(key),
    }
}

/// Declare one graph input per non-`None` leaf of `inputs`.
///
/// Inputs are named after the top-level value they belong to, followed by
/// the path code of the leaf for nested values. Axes which `shapes` marks as
/// dynamic get symbolic dimensions. Axes marked with a marker rather than a
/// name get a symbol derived from the input name.
fn declare_inputs(inputs: &ExampleInput, shapes: Option<&InputShapes>) -> Vec<GraphInput> {
    let mut declared = Vec::new();
    for (elem, node) in inputs.top_level() {
        let base = top_level_name(&elem);
        let tree = shapes_for(shapes, &elem);
        for (path, leaf) in node.leaves_with_paths() {
            let Some((dtype, shape)) = leaf_signature(leaf) else {
                continue;
            };
            let name = format!("{}{}", base, path.code());
            let axes = match tree.and_then(|tree| tree.at(&path)) {
                Some(Tree::Leaf(ShapeLeaf::Axes(axes))) => Some(axes),
                _ => None,
            };
            let dims = shape
                .iter()
                .enumerate()
                .map(|(axis, &size)| match axes.and_then(|axes| axes.get(&axis)) {
                    Some(DimSpec::Named(sym)) => Dimension::Symbolic(sym.clone()),
                    Some(DimSpec::Marker(_)) => Dimension::Symbolic(format!("{}_{}", name, axis)),
                    Some(DimSpec::Fixed(_)) | None => Dimension::Fixed(size),
                })
                .collect();
            declared.push(GraphInput {
                name,
                dtype: Some(dtype),
                shape: Some(dims),
            });
        }
    }
    declared
}

/// Check fed values against declared graph inputs.
///
/// Fixed dimensions must match exactly, and each symbol must be bound to the
/// same size everywhere it appears.
fn check_feeds(declared: &[GraphInput], fed: &[(DataType, Vec<usize>)]) -> Result<(), RunError> {
    if declared.len() != fed.len() {
        return Err(RunError::Failed(format!(
            "expected {} inputs but got {}",
            declared.len(),
            fed.len()
        )));
    }

    let mut bindings: FxHashMap<&str, (usize, &str)> = FxHashMap::default();
    for (input, (dtype, shape)) in declared.iter().zip(fed) {
        if let Some(expected) = input.dtype {
            if expected != *dtype {
                return Err(CastError::WrongType {
                    actual: *dtype,
                    expected,
                }
                .into());
            }
        }
        if !input.accepts_shape(shape) {
            return Err(RunError::ShapeMismatch {
                name: input.name.clone(),
                expected: input.shape_string(),
                actual: shape.clone(),
            });
        }
        for (dim, &size) in input.shape.iter().flatten().zip(shape) {
            let Dimension::Symbolic(sym) = dim else {
                continue;
            };
            match bindings.get(sym.as_str()) {
                Some(&(bound, bound_by)) if bound != size => {
                    return Err(RunError::Failed(format!(
                        "symbol {:?} is {} for input {:?} but {} for input {:?}",
                        sym, bound, bound_by, size, input.name
                    )));
                }
                Some(_) => {}
                None => {
                    bindings.insert(sym.as_str(), (size, input.name.as_str()));
                }
            }
        }
    }
    Ok(())
}

/// Recover a leaf of the same kind as `template` from a fed value.
fn leaf_from_feed(template: &Leaf, value: Value) -> Result<Leaf, RunError> {
    match template {
        Leaf::Scalar(_) => {
            let scalar = match &value {
                _ if value.len() != 1 => None,
                Value::Int32Tensor(t) => t.iter().next().map(|&x| Scalar::Int(x as i64)),
                Value::FloatTensor(t) => t.iter().next().map(|&x| Scalar::Float(x as f64)),
            };
            scalar.map(Leaf::Scalar).ok_or_else(|| RunError::ShapeMismatch {
                name: template.to_string(),
                expected: "[1]".to_string(),
                actual: value.shape().to_vec(),
            })
        }
        _ => Ok(Leaf::Tensor(value)),
    }
}

/// Callable produced by the program exporters.
///
/// It runs the captured model, but only on inputs which agree with the
/// declaration made at export time.
struct GuardedProgram {
    model: Rc<dyn Model>,
    inputs: Vec<GraphInput>,
}

impl Callable for GuardedProgram {
    fn call(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let fed: Vec<_> = inputs.leaves().into_iter().filter_map(leaf_signature).collect();
        check_feeds(&self.inputs, &fed)?;
        self.model.forward(inputs)
    }
}

/// Session which runs a captured model from named feeds.
struct ReferenceSession {
    captured: Rc<CapturedModel>,
    inputs: Vec<GraphInput>,
}

impl ReferenceSession {
    /// Rebuild model inputs from the template, replacing each non-`None` leaf
    /// with the next fed value.
    fn rebuild_inputs(&self, values: Vec<Value>) -> Result<ExampleInput, RunError> {
        let mut values = values.into_iter();
        let mut result = Ok(());
        let mut rebuild = |node: &Node| -> Node {
            node.map_ref(|leaf| {
                if leaf.is_none() || result.is_err() {
                    return leaf.clone();
                }
                match values.next().map(|value| leaf_from_feed(leaf, value)) {
                    Some(Ok(leaf)) => leaf,
                    Some(Err(err)) => {
                        result = Err(err);
                        Leaf::None
                    }
                    None => {
                        result = Err(RunError::Failed("too few feeds".into()));
                        Leaf::None
                    }
                }
            })
        };

        let template = &self.captured.template;
        let args = template.args.iter().map(&mut rebuild).collect();
        let kwargs = template
            .kwargs
            .iter()
            .map(|(key, value)| (key.clone(), rebuild(value)))
            .collect();
        result?;
        Ok(ExampleInput::new(args, kwargs))
    }
}

impl Session for ReferenceSession {
    fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|input| input.name.clone()).collect()
    }

    fn run(&self, feeds: Vec<(String, Value)>) -> Result<Vec<Value>, RunError> {
        let mut feeds: FxHashMap<String, Value> = feeds.into_iter().collect();
        let mut values = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let value = feeds
                .remove(&input.name)
                .ok_or_else(|| RunError::MissingInput(input.name.clone()))?;
            values.push(value);
        }
        if let Some(name) = feeds.keys().next() {
            return Err(RunError::Failed(format!("unexpected input {:?}", name)));
        }

        let fed: Vec<_> = values
            .iter()
            .map(|value| (value.dtype(), value.shape().to_vec()))
            .collect();
        check_feeds(&self.inputs, &fed)?;

        let inputs = self.rebuild_inputs(values)?;
        let outputs = self.captured.model.forward(inputs)?;
        outputs
            .leaves()
            .into_iter()
            .filter(|leaf| !leaf.is_none())
            .map(|leaf| leaf.to_feed().map_err(RunError::from))
            .collect()
    }
}

/// Backend which implements every exporter family by capturing the eager
/// model, and the runtime which executes its graphs.
///
/// Graphs can only be loaded by the backend which exported them, and only
/// once. Loading a graph releases the model captured for it.
#[derive(Default)]
pub struct ReferenceBackend {
    captured: RefCell<FxHashMap<u64, Rc<CapturedModel>>>,
    next_id: Cell<u64>,
}

impl ReferenceBackend {
    pub fn new() -> ReferenceBackend {
        ReferenceBackend::default()
    }

    /// Declare the graph inputs for an export.
    ///
    /// Symbols may be shared between axes, which constrains those axes to
    /// have the same size.
    fn declare(
        &self,
        inputs: &ExampleInput,
        dynamic_shapes: Option<&InputShapes>,
    ) -> Result<Vec<GraphInput>, ExportError> {
        if let Some(shapes) = dynamic_shapes {
            for (elem, _) in shapes.top_level() {
                let known = match &elem {
                    PathElem::Index(i) => inputs.arg(*i).is_some(),
                    PathElem::Key(_, key) | PathElem::Field(_, key) => inputs.kwarg(key).is_some(),
                };
                if !known {
                    return Err(ExportError::Failed(format!(
                        "dynamic shapes refer to input {} which the model is not called with",
                        top_level_name(&elem)
                    )));
                }
            }
        }
        Ok(declare_inputs(inputs, dynamic_shapes))
    }

    fn capture(&self, model: Rc<dyn Model>, inputs: &ExampleInput, declared: Vec<GraphInput>) -> GraphExport {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let name = model.name().to_string();
        self.captured.borrow_mut().insert(
            id,
            Rc::new(CapturedModel {
                model,
                template: inputs.clone(),
            }),
        );
        let file = GraphFile {
            format: GRAPH_FORMAT.to_string(),
            id,
            model: name,
            inputs: declared,
        };
        GraphExport {
            graph: Box::new(ReferenceGraph { file: file.clone() }),
            builder: Some(Box::new(ReferenceGraph { file })),
        }
    }
}

fn log_decomposition(model: &dyn Model, decomposition: Decomposition) {
    match decomposition {
        Decomposition::None => {}
        Decomposition::Default => debug!(model = model.name(), "running default decompositions"),
        Decomposition::All => debug!(model = model.name(), "running all decompositions"),
    }
}

impl ExportBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn export_program(
        &self,
        model: Rc<dyn Model>,
        inputs: &ExampleInput,
        dynamic_shapes: Option<&InputShapes>,
        options: ProgramOptions,
    ) -> Result<Box<dyn Callable>, ExportError> {
        if options.strict && model.data_dependent_control_flow() {
            return Err(ExportError::Failed(format!(
                "model {} has data-dependent control flow, which strict mode cannot capture",
                model.name()
            )));
        }
        let declared = self.declare(inputs, dynamic_shapes)?;
        log_decomposition(model.as_ref(), options.decomposition);
        Ok(Box::new(GuardedProgram {
            model,
            inputs: declared,
        }))
    }

    fn trace(
        &self,
        model: Rc<dyn Model>,
        inputs: &ExampleInput,
        dynamic_shapes: Option<&InputShapes>,
    ) -> Result<Box<dyn Callable>, ExportError> {
        if model.data_dependent_control_flow() {
            warn!(model = model.name(), "tracing specializes control flow on the example input");
        }
        let declared = self.declare(inputs, dynamic_shapes)?;
        Ok(Box::new(GuardedProgram {
            model,
            inputs: declared,
        }))
    }

    fn to_graph(
        &self,
        model: Rc<dyn Model>,
        inputs: &ExampleInput,
        dynamic_shapes: Option<&InputShapes>,
        options: GraphOptions,
    ) -> Result<GraphExport, ExportError> {
        if options.jit {
            return Err(ExportError::Unsupported(Exporter::Custom(options).to_string()));
        }
        if options.is_strict() && model.data_dependent_control_flow() {
            if !options.fallback {
                return Err(ExportError::Failed(format!(
                    "model {} has data-dependent control flow, which strict mode cannot capture",
                    model.name()
                )));
            }
            warn!(model = model.name(), "strict export failed, falling back to non-strict");
        }
        let declared = self.declare(inputs, dynamic_shapes)?;
        log_decomposition(model.as_ref(), options.decomposition);
        Ok(self.capture(model, inputs, declared))
    }

    fn dynamo(
        &self,
        model: Rc<dyn Model>,
        inputs: &ExampleInput,
        dynamic_shapes: Option<&InputShapes>,
        optimize: bool,
    ) -> Result<GraphExport, ExportError> {
        let declared = self.declare(inputs, dynamic_shapes)?;
        let export = self.capture(model, inputs, declared);
        if optimize {
            info!(inputs = export.graph.inputs().len(), "optimized graph");
        }
        Ok(export)
    }
}

impl Runtime for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn load(&self, graph: &[u8]) -> Result<Box<dyn Session>, RunError> {
        let file: GraphFile =
            serde_json::from_slice(graph).map_err(|err| RunError::InvalidGraph(err.to_string()))?;
        if file.format != GRAPH_FORMAT {
            return Err(RunError::InvalidGraph(format!(
                "unsupported format {:?}",
                file.format
            )));
        }
        let captured = self
            .captured
            .borrow_mut()
            .remove(&file.id)
            .ok_or_else(|| RunError::InvalidGraph(format!("unknown graph {}", file.id)))?;
        Ok(Box::new(ReferenceSession {
            captured,
            inputs: file.inputs,
        }))
    }
}
