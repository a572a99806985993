//! Error types shared by the walker, shape synthesis, exporters and driver.

use thiserror::Error;

use crate::tree::{LeafPath, PathElem};
use crate::value::CastError;

/// Error raised when container shapes disagree.
///
/// This indicates a contract violation by the caller (eg. example inputs
/// with different keys) and is never silently coerced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructuralError {
    /// Two containers at the same position have different types, lengths or
    /// keys.
    #[error("container mismatch at {path}: expected {expected}, got {actual}")]
    ContainerMismatch {
        path: LeafPath,
        expected: String,
        actual: String,
    },

    /// A skeleton was rebuilt from the wrong number of leaves.
    #[error("expected {expected} leaves but got {actual}")]
    LeafCount { expected: usize, actual: usize },

    /// Tensors at the same position have different ranks.
    #[error("rank mismatch at {path}, shapes are {shapes:?}")]
    RankMismatch {
        path: LeafPath,
        shapes: Vec<Vec<usize>>,
    },

    /// Leaves at the same position are of different kinds (eg. a tensor and
    /// `None`).
    #[error("leaf mismatch at {path}: expected {expected}, got {actual}")]
    LeafMismatch {
        path: LeafPath,
        expected: String,
        actual: String,
    },

    /// A record was built with a different number of fields than its type
    /// declares.
    #[error("record {record} has {expected} fields but got {actual}")]
    RecordFields {
        record: String,
        expected: usize,
        actual: usize,
    },

    /// Example inputs have different positional arguments or keyword names.
    #[error("signature mismatch: {0}")]
    Signature(String),

    /// A symbolic dimension name was assigned to two different axes.
    #[error("symbolic dimension {name:?} is used by {first} and {second}")]
    DuplicateSymbol {
        name: String,
        first: String,
        second: String,
    },
}

impl StructuralError {
    /// Prefix the path of this error with `elem`, for errors raised while
    /// checking a child of a container.
    pub fn within(self, elem: PathElem) -> StructuralError {
        match self {
            StructuralError::ContainerMismatch {
                path,
                expected,
                actual,
            } => StructuralError::ContainerMismatch {
                path: path.prepend(elem),
                expected,
                actual,
            },
            StructuralError::RankMismatch { path, shapes } => StructuralError::RankMismatch {
                path: path.prepend(elem),
                shapes,
            },
            StructuralError::LeafMismatch {
                path,
                expected,
                actual,
            } => StructuralError::LeafMismatch {
                path: path.prepend(elem),
                expected,
                actual,
            },
            other => other,
        }
    }
}

/// Errors raised when running an eager model, an exported artifact or a
/// runtime session.
#[derive(Debug, Error)]
pub enum RunError {
    /// A required input was not provided.
    #[error("missing input {0:?}")]
    MissingInput(String),

    /// An input has the wrong type.
    #[error(transparent)]
    Cast(#[from] CastError),

    /// A feed does not match the shape declared by the graph.
    #[error("shape mismatch for input {name:?}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: Vec<usize>,
    },

    /// A serialized graph could not be loaded.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// The model or runtime reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors raised by an exporter variant.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The backend does not implement this exporter variant.
    #[error("exporter {0:?} is not supported by this backend")]
    Unsupported(String),

    /// The export strategy rejected the model.
    #[error("{0}")]
    Failed(String),

    /// The export strategy panicked.
    #[error("{0}")]
    Panicked(String),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// Error for an unrecognized exporter name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown exporter {0:?}")]
pub struct ParseExporterError(pub String);

/// Errors raised through the exporter runner and evaluation driver.
///
/// When running in quiet mode, failures of a single evaluation are recorded
/// in its [`Outcome`](crate::Outcome) instead. The remaining variants are
/// caller errors which are always returned.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unable to convert model {model} with exporter {exporter}, inputs={inputs}")]
    Export {
        model: String,
        exporter: String,
        inputs: String,
        #[source]
        source: ExportError,
    },

    #[error("input mismatch: {0}")]
    Inputs(String),

    #[error("unable to load the exported graph")]
    RuntimeInit(#[source] RunError),

    #[error("eager mode failed for model {model}, inputs={inputs}")]
    Eager {
        model: String,
        inputs: String,
        #[source]
        source: RunError,
    },

    #[error("exported model failed on example {index}, inputs={inputs}")]
    Run {
        index: usize,
        inputs: String,
        #[source]
        source: RunError,
    },

    #[error("unable to compare outputs for example {index}")]
    Discrepancy {
        index: usize,
        #[source]
        source: StructuralError,
    },

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Exporter(#[from] ParseExporterError),

    #[error("case {0:?} has no example inputs")]
    MissingInputs(String),

    #[error("case {0:?} is registered twice")]
    DuplicateCase(String),

    #[error("invalid case pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("no case to evaluate for {0}")]
    NoCases(String),

    /// A built-in case could not be created from its hub configuration.
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Errors raised when resolving configurations, tasks and architectures of
/// hub models.
#[derive(Debug, Error)]
pub enum HubError {
    /// A configuration is not preinstalled and fetching it is not allowed.
    #[error("unable to find {name:?} (exc={exc}, NOHTTP={nohttp}) in {available:?}")]
    NotPreinstalled {
        name: String,
        exc: bool,
        nohttp: bool,
        available: Vec<String>,
    },

    /// No source is available to fetch a configuration which is not
    /// preinstalled.
    #[error("no configuration source to fetch {0:?}")]
    NoSource(String),

    /// The configuration source failed.
    #[error("unable to fetch the configuration of {model_id:?}: {message}")]
    Fetch { model_id: String, message: String },

    /// A configuration is not a JSON object.
    #[error("configuration of {0:?} is not an object")]
    InvalidConfig(String),

    /// A required configuration attribute is absent.
    #[error("missing attribute {attr} in configuration {config}")]
    MissingAttribute { attr: String, config: String },

    /// The architecture has no known task.
    #[error("architecture {0:?} is unknown")]
    UnknownArchitecture(String),

    /// The model architecture could not be determined.
    #[error("unable to determine the architecture of {model_id:?}, architectures={architectures:?}")]
    Architecture {
        model_id: String,
        architectures: Vec<String>,
    },

    /// No constructor is registered for the architecture and the resolver
    /// could not load one.
    #[error("no implementation of architecture {arch:?} for model {model_id:?}")]
    MissingImplementation { model_id: String, arch: String },

    /// No input generator exists for the task.
    #[error("task {0:?} is not supported")]
    UnsupportedTask(String),

    /// Options are inconsistent.
    #[error("invalid options for {model_id:?}: {message}")]
    Options { model_id: String, message: String },

    #[error(transparent)]
    Cast(#[from] CastError),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}
