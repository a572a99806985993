//! Evaluation of one exporter on one model case.

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::capture::capture;
use crate::discrepancy::{max_diff, Discrepancy};
use crate::dynamic_shapes::{
    all_dynamic_shapes_for, guess_dynamic_shapes_from_inputs, DimPrefix, InputShapes,
};
use crate::errors::{EvalError, RunError};
use crate::exporter::{export, Artifact, ExportBackend, Exporter, GraphExport};
use crate::graph::{Runtime, Session};
use crate::model::{Callable, Model, ModelCase};
use crate::outcome::{ErrorStep, Outcome};
use crate::tree::{ExampleInput, Node};
use crate::value::{Leaf, Value};

/// The backend which exports models and the runtime which executes the
/// exported graphs.
#[derive(Copy, Clone)]
pub struct Toolchain<'a> {
    pub backend: &'a dyn ExportBackend,
    pub runtime: &'a dyn Runtime,
}

/// Options for [`run_exporter`].
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Export with dynamic shapes and re-check the artifact on every
    /// example.
    pub dynamic: bool,

    /// Record failures in the returned [`Outcome`] instead of returning an
    /// error.
    pub quiet: bool,

    /// Verbosity level. At 1 and above each run is logged, at 2 and above
    /// exporter output is not captured, at 5 and above inputs and outputs
    /// are logged when outputs cannot be compared, and at 9 and above
    /// graphs and all inputs and outputs are logged.
    pub verbose: u32,

    /// Naming of dynamic dimensions when they are derived from the examples.
    pub prefix: DimPrefix,
}

impl Default for RunOptions {
    fn default() -> RunOptions {
        RunOptions {
            dynamic: false,
            quiet: false,
            verbose: 0,
            prefix: DimPrefix::default(),
        }
    }
}

/// Select the leaves of `inputs` which feed a graph with input `names`.
///
/// Top-level inputs are fed directly when there is one name per input and
/// none of them is a container. Otherwise, if there are at least as many
/// names as top-level inputs, the names are paired with the non-`None`
/// leaves of the flattened inputs. Returns `None` if the inputs cannot be
/// paired with the names.
fn feed_leaves<'a>(names: &[String], inputs: &'a ExampleInput) -> Option<Vec<&'a Leaf>> {
    let top_level: Vec<&'a Node> = inputs.top_level().map(|(_, node)| node).collect();
    let count = top_level.len();
    if names.len() == count {
        let direct: Option<Vec<&Leaf>> = top_level
            .into_iter()
            .map(|node| match node {
                Node::Leaf(leaf) => Some(leaf),
                _ => None,
            })
            .collect();
        if direct.is_some() {
            return direct;
        }
    }
    if names.len() < count {
        return None;
    }
    let leaves: Vec<&Leaf> = inputs
        .leaves()
        .into_iter()
        .filter(|leaf| !leaf.is_none())
        .collect();
    (leaves.len() == names.len()).then_some(leaves)
}

/// Pair graph input names with the values to feed them.
///
/// Top-level inputs are fed directly if there is one name for each and none
/// of them is a container. If there are more names, or a top-level input is
/// a container, the names are paired with the non-`None` leaves of the
/// flattened inputs. Scalars are fed as one-element tensors.
pub fn make_feeds(names: &[String], inputs: &ExampleInput) -> Result<Vec<(String, Value)>, RunError> {
    let Some(leaves) = feed_leaves(names, inputs) else {
        return Err(RunError::Failed(format!(
            "unable to feed inputs {} to a graph with inputs {:?}",
            inputs, names
        )));
    };
    names
        .iter()
        .zip(leaves)
        .map(|(name, leaf)| Ok((name.clone(), leaf.to_feed()?)))
        .collect()
}

/// Return true if a graph with input `names` can be fed from `inputs`.
fn inputs_align(names: &[String], inputs: &ExampleInput) -> bool {
    feed_leaves(names, inputs).is_some()
}

/// Callable which runs a runtime session with feeds built from example
/// inputs.
///
/// Outputs are returned as a flat list of tensors.
pub struct SessionCallable {
    session: Box<dyn Session>,
    names: Vec<String>,
}

impl SessionCallable {
    pub fn new(session: Box<dyn Session>, names: Vec<String>) -> SessionCallable {
        SessionCallable { session, names }
    }
}

impl Callable for SessionCallable {
    fn call(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        let feeds = make_feeds(&self.names, &inputs)?;
        let outputs = self.session.run(feeds)?;
        Ok(Node::list(outputs.into_iter().map(Node::tensor).collect()))
    }
}

/// Return the dynamic shapes to export `case` with.
fn dynamic_shapes_for(case: &ModelCase, prefix: &DimPrefix) -> Result<InputShapes, EvalError> {
    if let Some(shapes) = &case.dynamic_shapes {
        return Ok(shapes.clone());
    }
    if case.inputs.len() > 1 {
        Ok(guess_dynamic_shapes_from_inputs(&case.inputs, prefix)?)
    } else {
        Ok(all_dynamic_shapes_for(&case.inputs[0], prefix))
    }
}

/// Log inputs and outputs of a comparison, depending on verbosity.
fn log_comparison(verbose: u32, index: usize, inputs: &ExampleInput, expected: &Node, got: &Node, disc: &Discrepancy) {
    if verbose >= 5 && disc.abs.is_infinite() {
        warn!(index, %inputs, %expected, %got, "comparison issues");
    } else if verbose >= 9 {
        debug!(index, %inputs, %expected, %got, %disc, "inputs and outputs");
    }
}

/// Stops the evaluation, either by returning the outcome or by returning the
/// error, depending on whether the run is quiet.
macro_rules! fail {
    ($quiet:expr, $outcome:expr, $err:expr) => {
        if $quiet {
            return Ok($outcome);
        } else {
            return Err($err);
        }
    };
}

/// Export `case` with `exporter`, run the exported artifact on the example
/// inputs and compare its outputs with those of the eager model.
///
/// The artifact is built from the first example. It is run on that example
/// and, for dynamic exports, on every other example. The outcome reports the
/// discrepancy on the first example, or the first stage which failed. If
/// `options.quiet` is false, failures are returned as errors instead.
///
/// Identifying fields of the outcome (name, exporter and dynamic flag) are
/// left for the caller to set.
pub fn run_exporter(
    exporter: Exporter,
    case: &ModelCase,
    toolchain: Toolchain<'_>,
    options: &RunOptions,
) -> Result<Outcome, EvalError> {
    let Some(first) = case.inputs.first() else {
        return Err(EvalError::MissingInputs(case.name.clone()));
    };
    let quiet = options.quiet;
    let model: Rc<dyn Model> = case.build();

    let dynamic_shapes = if options.dynamic {
        match dynamic_shapes_for(case, &options.prefix) {
            Ok(shapes) => Some(shapes),
            Err(err) => fail!(quiet, Outcome::failure(ErrorStep::Inputs, err.to_string()), err),
        }
    } else {
        None
    };

    if options.verbose > 0 {
        info!(
            %exporter,
            model = %case.name,
            dynamic = options.dynamic,
            inputs = %first,
            "run exporter"
        );
    }

    let captured = capture(options.verbose >= 2, || {
        export(
            toolchain.backend,
            exporter,
            model.clone(),
            first,
            dynamic_shapes.as_ref(),
        )
    });
    if !captured.output.is_empty() {
        debug!(%exporter, output = %captured.output, "exporter output");
    }
    let artifact = match captured.result {
        Ok(artifact) => artifact,
        Err(err) => fail!(
            quiet,
            Outcome::failure(ErrorStep::Export, err.to_string()),
            EvalError::Export {
                model: case.name.clone(),
                exporter: exporter.to_string(),
                inputs: first.to_string(),
                source: err,
            }
        ),
    };

    let artifact_kind = artifact.kind();
    let mut graph_inputs = None;
    let mut has_symbolic_dims = None;

    let callable: Box<dyn Callable> = match artifact {
        Artifact::Program(callable) => callable,
        Artifact::Graph(graph_export) => {
            let GraphExport { graph, builder } = graph_export;
            if options.verbose >= 9 {
                let text = match &builder {
                    Some(builder) => builder.pretty_text(),
                    None => format!("{:?}", graph.inputs()),
                };
                debug!(%exporter, graph = %text, "exported graph");
            }

            let names: Vec<String> = graph
                .input_names()
                .into_iter()
                .map(|name| name.to_string())
                .collect();
            if !inputs_align(&names, first) {
                let msg = format!(
                    "Input mismatch, inputs[0]={} but names={:?}, model={}, export={:?}",
                    first,
                    names,
                    case.name,
                    exporter.to_string()
                );
                let mut outcome = Outcome::failure(ErrorStep::Inputs, msg.clone());
                outcome.artifact = Some(artifact_kind.to_string());
                fail!(quiet, outcome, EvalError::Inputs(msg));
            }

            let symbolic = graph.symbolic_dims();
            if options.verbose >= 2 {
                debug!(%exporter, dims = ?symbolic, "dynamic dimensions");
            }
            has_symbolic_dims = Some(!symbolic.is_empty());
            graph_inputs = Some(graph.inputs().to_vec());

            let session = graph
                .serialize()
                .and_then(|bytes| toolchain.runtime.load(&bytes));
            match session {
                Ok(session) => Box::new(SessionCallable::new(session, names)),
                Err(err) => fail!(
                    quiet,
                    Outcome::failure(ErrorStep::OrtInit, err.to_string()),
                    EvalError::RuntimeInit(err)
                ),
            }
        }
    };

    // The model may update its inputs, so it gets its own copy.
    let expected = match model.forward(first.clone()) {
        Ok(expected) => expected,
        Err(err) => fail!(
            quiet,
            Outcome::failure(ErrorStep::Eager, err.to_string()),
            EvalError::Eager {
                model: case.name.clone(),
                inputs: first.to_string(),
                source: err,
            }
        ),
    };
    let got = match callable.call(first.clone()) {
        Ok(got) => got,
        Err(err) => fail!(
            quiet,
            Outcome::failure(ErrorStep::Run(0), err.to_string()),
            EvalError::Run {
                index: 0,
                inputs: first.to_string(),
                source: err,
            }
        ),
    };
    let disc = match max_diff(&expected, &got) {
        Ok(disc) => disc,
        Err(err) => fail!(
            quiet,
            Outcome::failure(ErrorStep::Discrepancy(None), err.to_string()),
            EvalError::Discrepancy {
                index: 0,
                source: err,
            }
        ),
    };
    log_comparison(options.verbose, 0, first, &expected, &got, &disc);

    let mut outcome = Outcome::from_discrepancy(&disc);
    outcome.artifact = Some(artifact_kind.to_string());
    outcome.graph_inputs = graph_inputs;

    if options.dynamic && has_symbolic_dims == Some(false) {
        return Ok(Outcome::failure(ErrorStep::Dynamic, "no dynamic shape"));
    }

    if options.dynamic {
        for (index, example) in case.inputs.iter().enumerate().skip(1) {
            let expected = match model.forward(example.clone()) {
                Ok(expected) => expected,
                Err(err) => {
                    let msg = err.to_string();
                    fail!(
                        quiet,
                        {
                            outcome.mark_failed(ErrorStep::Eager, msg);
                            outcome
                        },
                        EvalError::Eager {
                            model: case.name.clone(),
                            inputs: example.to_string(),
                            source: err,
                        }
                    )
                }
            };
            let got = match callable.call(example.clone()) {
                Ok(got) => got,
                Err(err) => {
                    let msg = err.to_string();
                    fail!(
                        quiet,
                        {
                            outcome.mark_failed(ErrorStep::Run(index), msg);
                            outcome
                        },
                        EvalError::Run {
                            index,
                            inputs: example.to_string(),
                            source: err,
                        }
                    )
                }
            };
            let disc = match max_diff(&expected, &got) {
                Ok(disc) => disc,
                Err(err) => {
                    let msg = err.to_string();
                    fail!(
                        quiet,
                        {
                            outcome.mark_failed(ErrorStep::Discrepancy(Some(index)), msg);
                            outcome
                        },
                        EvalError::Discrepancy { index, source: err }
                    )
                }
            };
            log_comparison(options.verbose, index, example, &expected, &got, &disc);
            outcome.merge_recheck(index, &disc);
        }
    }

    Ok(outcome)
}
