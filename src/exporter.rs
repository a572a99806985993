//! Exporter variants and the backend interface which implements them.

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::dynamic_shapes::InputShapes;
use crate::errors::{ExportError, ParseExporterError};
use crate::graph::SerializedGraph;
use crate::model::{Callable, Model};
use crate::tree::ExampleInput;

/// Decomposition of high-level operations applied after capture.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Decomposition {
    #[default]
    None,
    /// Apply the backend's default decomposition table.
    Default,
    /// Decompose every operation which can be decomposed.
    All,
}

impl Decomposition {
    fn suffix(self) -> &'static str {
        match self {
            Decomposition::None => "",
            Decomposition::Default => "-dec",
            Decomposition::All => "-decall",
        }
    }
}

/// Options for whole-program capture.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ProgramOptions {
    /// Capture in strict mode, which rejects constructs the tracer cannot
    /// prove safe. Non-strict mode runs the model as ordinary code.
    pub strict: bool,
    pub decomposition: Decomposition,
}

/// Options for conversion to a serialized graph.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct GraphOptions {
    /// Explicitly request strict (`Some(true)`) or non-strict (`Some(false)`)
    /// capture. `None` leaves the choice to the backend.
    pub strict: Option<bool>,

    /// Retry with another capture strategy if the first one fails.
    pub fallback: bool,

    /// Use the alternate tracer.
    pub tracing: bool,

    /// Use the JIT-based tracer.
    pub jit: bool,

    pub decomposition: Decomposition,
}

impl GraphOptions {
    pub fn is_strict(&self) -> bool {
        self.strict.unwrap_or(false)
    }
}

/// A strategy for turning a model into a runnable artifact.
///
/// Exporters are named as in the reports they produce, eg.
/// `export-nostrict-decall` or `custom-strict-fallback`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Exporter {
    /// Whole-program capture (`export-strict`, `export-nostrict-dec`, ...).
    Export(ProgramOptions),

    /// Capture with the custom tracer, producing a lower-level program
    /// (`export-tracing`).
    ExportTracing,

    /// Conversion to a serialized graph (`custom`, `custom-strict-jit`, ...).
    Custom(GraphOptions),

    /// Backend-provided conversion to a serialized graph (`dynamo`).
    Dynamo,

    /// Backend-provided conversion followed by graph optimization
    /// (`dynamo-ir`).
    DynamoIr,
}

impl Exporter {
    /// Exporters evaluated when none are specified.
    pub fn defaults() -> Vec<Exporter> {
        ["export-strict", "export-nostrict", "export-nostrict-decall"]
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    /// Return a list of exporters covering every family and option.
    pub fn known() -> Vec<Exporter> {
        [
            "export-strict",
            "export-strict-dec",
            "export-strict-decall",
            "export-nostrict",
            "export-nostrict-dec",
            "export-nostrict-decall",
            "export-tracing",
            "custom",
            "custom-strict",
            "custom-nostrict",
            "custom-fallback",
            "custom-tracing",
            "custom-jit",
            "custom-dec",
            "custom-decall",
            "dynamo",
            "dynamo-ir",
        ]
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect()
    }

    /// Return true if this exporter produces a serialized graph rather than a
    /// callable program.
    pub fn produces_graph(&self) -> bool {
        matches!(
            self,
            Exporter::Custom(_) | Exporter::Dynamo | Exporter::DynamoIr
        )
    }
}

impl fmt::Display for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exporter::Export(opts) => write!(
                f,
                "export-{}{}",
                if opts.strict { "strict" } else { "nostrict" },
                opts.decomposition.suffix()
            ),
            Exporter::ExportTracing => write!(f, "export-tracing"),
            Exporter::Custom(opts) => {
                write!(f, "custom")?;
                match opts.strict {
                    Some(true) => write!(f, "-strict")?,
                    Some(false) => write!(f, "-nostrict")?,
                    None => {}
                }
                if opts.fallback {
                    write!(f, "-fallback")?;
                }
                if opts.tracing {
                    write!(f, "-tracing")?;
                }
                if opts.jit {
                    write!(f, "-jit")?;
                }
                write!(f, "{}", opts.decomposition.suffix())
            }
            Exporter::Dynamo => write!(f, "dynamo"),
            Exporter::DynamoIr => write!(f, "dynamo-ir"),
        }
    }
}

impl FromStr for Exporter {
    type Err = ParseExporterError;

    fn from_str(name: &str) -> Result<Exporter, ParseExporterError> {
        let err = || ParseExporterError(name.to_string());

        match name {
            "export-tracing" => return Ok(Exporter::ExportTracing),
            "dynamo" => return Ok(Exporter::Dynamo),
            "dynamo-ir" => return Ok(Exporter::DynamoIr),
            _ => {}
        }

        let mut parts = name.split('-');
        match parts.next() {
            Some("export") => {
                let strict = match parts.next() {
                    Some("strict") => true,
                    Some("nostrict") => false,
                    _ => return Err(err()),
                };
                let decomposition = match parts.next() {
                    None => Decomposition::None,
                    Some("dec") => Decomposition::Default,
                    Some("decall") => Decomposition::All,
                    Some(_) => return Err(err()),
                };
                if parts.next().is_some() {
                    return Err(err());
                }
                Ok(Exporter::Export(ProgramOptions {
                    strict,
                    decomposition,
                }))
            }
            Some("custom") => {
                let mut opts = GraphOptions::default();
                for part in parts {
                    let duplicate = match part {
                        "strict" | "nostrict" => {
                            let prev = opts.strict.replace(part == "strict");
                            prev.is_some()
                        }
                        "fallback" => std::mem::replace(&mut opts.fallback, true),
                        "tracing" => std::mem::replace(&mut opts.tracing, true),
                        "jit" => std::mem::replace(&mut opts.jit, true),
                        "dec" | "decall" => {
                            let prev = std::mem::replace(
                                &mut opts.decomposition,
                                if part == "dec" {
                                    Decomposition::Default
                                } else {
                                    Decomposition::All
                                },
                            );
                            prev != Decomposition::None
                        }
                        _ => return Err(err()),
                    };
                    if duplicate {
                        return Err(err());
                    }
                }
                Ok(Exporter::Custom(opts))
            }
            _ => Err(err()),
        }
    }
}

/// Introspection interface for the object which built a serialized graph.
pub trait GraphBuilder {
    /// Return a human-readable rendering of the graph.
    fn pretty_text(&self) -> String;
}

/// Result of converting a model to a serialized graph.
pub struct GraphExport {
    pub graph: Box<dyn SerializedGraph>,
    pub builder: Option<Box<dyn GraphBuilder>>,
}

/// The output of an exporter.
pub enum Artifact {
    /// A callable which accepts the same inputs as the model.
    Program(Box<dyn Callable>),

    /// A serialized graph which must be loaded into a runtime.
    Graph(GraphExport),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Program(_) => "program",
            Artifact::Graph(_) => "graph",
        }
    }
}

/// Implementation of the exporter families.
///
/// Each method receives a fresh model, the first example input and the
/// dynamic shapes to apply, if any. Backends need only implement the
/// families they support. The others report [`ExportError::Unsupported`].
pub trait ExportBackend {
    /// Return a short name for the backend, used in logs.
    fn name(&self) -> &str;

    fn export_program(
        &self,
        _model: Rc<dyn Model>,
        _inputs: &ExampleInput,
        _dynamic_shapes: Option<&InputShapes>,
        options: ProgramOptions,
    ) -> Result<Box<dyn Callable>, ExportError> {
        Err(ExportError::Unsupported(
            Exporter::Export(options).to_string(),
        ))
    }

    fn trace(
        &self,
        _model: Rc<dyn Model>,
        _inputs: &ExampleInput,
        _dynamic_shapes: Option<&InputShapes>,
    ) -> Result<Box<dyn Callable>, ExportError> {
        Err(ExportError::Unsupported(
            Exporter::ExportTracing.to_string(),
        ))
    }

    fn to_graph(
        &self,
        _model: Rc<dyn Model>,
        _inputs: &ExampleInput,
        _dynamic_shapes: Option<&InputShapes>,
        options: GraphOptions,
    ) -> Result<GraphExport, ExportError> {
        Err(ExportError::Unsupported(Exporter::Custom(options).to_string()))
    }

    fn dynamo(
        &self,
        _model: Rc<dyn Model>,
        _inputs: &ExampleInput,
        _dynamic_shapes: Option<&InputShapes>,
        optimize: bool,
    ) -> Result<GraphExport, ExportError> {
        let exporter = if optimize {
            Exporter::DynamoIr
        } else {
            Exporter::Dynamo
        };
        Err(ExportError::Unsupported(exporter.to_string()))
    }
}

/// Run `exporter` using the matching method of `backend`.
pub fn export(
    backend: &dyn ExportBackend,
    exporter: Exporter,
    model: Rc<dyn Model>,
    inputs: &ExampleInput,
    dynamic_shapes: Option<&InputShapes>,
) -> Result<Artifact, ExportError> {
    match exporter {
        Exporter::Export(opts) => backend
            .export_program(model, inputs, dynamic_shapes, opts)
            .map(Artifact::Program),
        Exporter::ExportTracing => backend
            .trace(model, inputs, dynamic_shapes)
            .map(Artifact::Program),
        Exporter::Custom(opts) => backend
            .to_graph(model, inputs, dynamic_shapes, opts)
            .map(Artifact::Graph),
        Exporter::Dynamo => backend
            .dynamo(model, inputs, dynamic_shapes, false)
            .map(Artifact::Graph),
        Exporter::DynamoIr => backend
            .dynamo(model, inputs, dynamic_shapes, true)
            .map(Artifact::Graph),
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use rten_diagnostic_testing::TestCases;

    use super::{
        export, Decomposition, ExportBackend, Exporter, GraphOptions, ProgramOptions,
    };
    use crate::errors::{ExportError, ParseExporterError};
    use crate::model::Model;
    use crate::tree::{ExampleInput, Node};
    use crate::RunError;

    #[test]
    fn test_parse_exporter() {
        #[derive(Debug)]
        struct Case {
            name: &'static str,
            expected: Exporter,
        }

        let cases = [
            Case {
                name: "export-strict",
                expected: Exporter::Export(ProgramOptions {
                    strict: true,
                    decomposition: Decomposition::None,
                }),
            },
            Case {
                name: "export-nostrict-decall",
                expected: Exporter::Export(ProgramOptions {
                    strict: false,
                    decomposition: Decomposition::All,
                }),
            },
            Case {
                name: "export-tracing",
                expected: Exporter::ExportTracing,
            },
            Case {
                name: "custom",
                expected: Exporter::Custom(GraphOptions::default()),
            },
            Case {
                name: "custom-nostrict-fallback-dec",
                expected: Exporter::Custom(GraphOptions {
                    strict: Some(false),
                    fallback: true,
                    decomposition: Decomposition::Default,
                    ..Default::default()
                }),
            },
            Case {
                name: "custom-strict-tracing-jit-decall",
                expected: Exporter::Custom(GraphOptions {
                    strict: Some(true),
                    tracing: true,
                    jit: true,
                    decomposition: Decomposition::All,
                    ..Default::default()
                }),
            },
            Case {
                name: "dynamo-ir",
                expected: Exporter::DynamoIr,
            },
        ];

        cases.test_each(|case| {
            let exporter: Exporter = case.name.parse().unwrap();
            assert_eq!(exporter, case.expected);
            assert_eq!(exporter.to_string(), case.name);
        })
    }

    #[test]
    fn test_parse_invalid_exporter() {
        let cases = [
            "export",
            "export-lenient",
            "export-strict-dec-dec",
            "custom-strict-nostrict",
            "custom-dec-decall",
            "custom-fast",
            "onnx",
            "",
        ];
        cases.test_each(|name| {
            assert_eq!(
                name.parse::<Exporter>(),
                Err(ParseExporterError(name.to_string()))
            );
        })
    }

    #[test]
    fn test_known_exporters() {
        let known = Exporter::known();
        assert_eq!(known.len(), 17);
        assert_eq!(Exporter::defaults().len(), 3);
        assert!(known.iter().filter(|e| e.produces_graph()).count() == 10);
    }

    struct NoBackend;

    impl ExportBackend for NoBackend {
        fn name(&self) -> &str {
            "none"
        }
    }

    struct Identity;

    impl Model for Identity {
        fn name(&self) -> &str {
            "Identity"
        }

        fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError> {
            inputs
                .args
                .into_iter()
                .next()
                .ok_or(RunError::MissingInput("x".into()))
        }
    }

    #[test]
    fn test_unsupported_families() {
        let inputs = ExampleInput::from_args(vec![Node::int(1)]);
        for exporter in Exporter::known() {
            let result = export(&NoBackend, exporter, Rc::new(Identity), &inputs, None);
            match result {
                Err(ExportError::Unsupported(name)) => assert_eq!(name, exporter.to_string()),
                _ => panic!("expected unsupported error for {}", exporter),
            }
        }
    }
}
