//! rten-diagnostic is a harness for checking how well machine learning models
//! survive being exported into a standalone artifact.
//!
//! # Workflow
//!
//! 1. Describe a model case: an eager [`Model`], two or more example inputs
//!    ([`ExampleInput`]) and optionally the dynamic shapes the export should
//!    use. See [`ModelCase`].
//! 2. Pick one or more [`Exporter`] variants. Each variant names a strategy
//!    (program capture, tracing, graph serialization) and its options.
//! 3. Run [`run_exporter`] for a single case, or [`evaluation`] over a
//!    [`CaseRegistry`], with a [`Toolchain`] supplying the export backend and
//!    the graph runtime.
//! 4. Inspect the resulting [`Outcome`] records, either directly, as JSON or
//!    as a text table (see [`report`]).
//!
//! # Dynamic shapes
//!
//! When a case does not declare dynamic shapes, they are inferred by
//! comparing the shapes of the example inputs. Axes whose size differs
//! between examples become symbolic dimensions. See
//! [`guess_dynamic_shapes`] and [`all_dynamic_shapes_for`].
//!
//! # Backends
//!
//! Export and execution are abstracted behind the [`ExportBackend`] and
//! [`Runtime`] traits. The crate ships a [`ReferenceBackend`] which captures
//! eager models and runs them behind a shape-checking graph runtime, which is
//! enough to exercise the harness end to end.
//!
//! # Hub models
//!
//! The [`hub`] module creates reduced, randomly initialized versions of
//! models from their configuration, along with example inputs for their
//! task.
//!
//! # Environment variables
//!
//! - `RTEN_DIAG_EXPORTERS` - Comma-separated exporter names used by
//!   [`EvalOptions::from_env`]
//! - `RTEN_DIAG_DYNAMIC` - Comma-separated dynamic flags, eg. `0,1`
//! - `RTEN_DIAG_CASES` - Case names or patterns to evaluate
//! - `RTEN_DIAG_VERBOSE` - Verbosity level
//! - `RTEN_DIAG_QUIET` - Whether failures are recorded rather than raised
//! - `NOHTTP` - Forbid fetching model configurations which are not
//!   preinstalled

mod axes;
mod capture;
mod discrepancy;
mod dynamic_shapes;
mod env;
mod errors;
mod eval;
mod exporter;
mod graph;
mod model;
mod outcome;
mod reference;
mod rng;
mod runner;
mod tree;
mod value;

pub mod cases;
pub mod hub;
pub mod report;

pub use axes::{classify, classify_all_dynamic, AxisTable, DimMarker, DimPrefix, DimSpec};
pub use discrepancy::{max_diff, Discrepancy, DIFF_THRESHOLD, REL_EPSILON};
pub use dynamic_shapes::{
    all_dynamic_shape_from_inputs, all_dynamic_shapes_for, guess_dynamic_shapes,
    guess_dynamic_shapes_from_inputs, AxisMap, DynamicShapes, InputShapes, ShapeLeaf,
};
pub use errors::{
    EvalError, ExportError, HubError, ParseExporterError, RunError, StructuralError,
};
pub use eval::{discover, evaluation, CaseRegistry, CaseSelection, EvalOptions};
pub use exporter::{
    export, Artifact, Decomposition, ExportBackend, Exporter, GraphBuilder, GraphExport,
    GraphOptions, ProgramOptions,
};
pub use graph::{Dimension, GraphInput, Runtime, SerializedGraph, Session};
pub use model::{Callable, EagerCallable, Model, ModelCase, ModelFactory};
pub use outcome::{ErrorStep, Outcome};
pub use reference::ReferenceBackend;
pub use runner::{run_exporter, RunOptions, Toolchain};
pub use tree::{ExampleInput, LeafPath, Node, PathElem, RecordKind, SeqKind, Skeleton, Tree};
pub use value::{CastError, DataType, Leaf, Scalar, Value};
