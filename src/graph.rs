//! Interfaces to exported graphs and the runtimes which execute them.
//!
//! The harness treats an exported graph as opaque apart from its declared
//! inputs. A [`Runtime`] loads the serialized bytes of a graph into a
//! [`Session`] which can then be run with named inputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RunError;
use crate::value::{DataType, Value};

/// Represents the size of a dimension of a graph input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    /// A dimension whose expected size is fixed and specified as part of the
    /// graph.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol provides
    /// a name to identify when different values share a size.
    Symbolic(String),
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(size) => write!(f, "{}", size),
            Dimension::Symbolic(name) => write!(f, "{}", name),
        }
    }
}

/// Declaration of a graph input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,

    /// Element type, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DataType>,

    /// Shape, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<Dimension>>,
}

impl GraphInput {
    /// Return true if `shape` is compatible with the declared shape, ignoring
    /// symbolic dimensions.
    pub fn accepts_shape(&self, shape: &[usize]) -> bool {
        match &self.shape {
            Some(dims) => {
                dims.len() == shape.len()
                    && dims.iter().zip(shape).all(|(dim, &size)| match dim {
                        Dimension::Fixed(expected) => *expected == size,
                        Dimension::Symbolic(_) => true,
                    })
            }
            None => true,
        }
    }

    /// Format the declared shape, eg. "[batch, 16]".
    pub fn shape_string(&self) -> String {
        match &self.shape {
            Some(dims) => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                format!("[{}]", dims.join(", "))
            }
            None => "?".to_string(),
        }
    }
}

/// A graph produced by an exporter.
pub trait SerializedGraph {
    /// Return the declared inputs, in the order the graph expects them.
    fn inputs(&self) -> &[GraphInput];

    /// Serialize the graph into the format accepted by a [`Runtime`].
    fn serialize(&self) -> Result<Vec<u8>, RunError>;

    fn input_names(&self) -> Vec<&str> {
        self.inputs().iter().map(|i| i.name.as_str()).collect()
    }

    /// Return `(input name, axis, symbol)` for every symbolic dimension of
    /// every declared input.
    fn symbolic_dims(&self) -> Vec<(&str, usize, &str)> {
        self.inputs()
            .iter()
            .flat_map(|input| {
                input
                    .shape
                    .iter()
                    .flatten()
                    .enumerate()
                    .filter_map(move |(axis, dim)| match dim {
                        Dimension::Symbolic(sym) => Some((input.name.as_str(), axis, sym.as_str())),
                        Dimension::Fixed(_) => None,
                    })
            })
            .collect()
    }
}

/// A loaded graph which can be executed.
pub trait Session {
    /// Return the names of the inputs that [`run`](Session::run) expects.
    fn input_names(&self) -> Vec<String>;

    /// Run the graph with named inputs, returning the outputs in order.
    fn run(&self, feeds: Vec<(String, Value)>) -> Result<Vec<Value>, RunError>;
}

/// Execution engine which loads serialized graphs.
pub trait Runtime {
    /// Return a short name for the runtime, used in logs.
    fn name(&self) -> &str;

    fn load(&self, graph: &[u8]) -> Result<Box<dyn Session>, RunError>;
}
