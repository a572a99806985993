//! Evaluation of exporters over a set of model cases.

use std::fmt;

use fancy_regex::Regex;
use rustc_hash::FxHashSet;
use tracing::info;

use crate::cases::builtin_cases;
use crate::dynamic_shapes::DimPrefix;
use crate::env::{env_flag, env_list, env_var, str_as_bool};
use crate::errors::EvalError;
use crate::exporter::Exporter;
use crate::hub::Hub;
use crate::model::ModelCase;
use crate::outcome::Outcome;
use crate::runner::{run_exporter, RunOptions, Toolchain};

/// Model cases available for evaluation, in registration order.
#[derive(Debug, Default)]
pub struct CaseRegistry {
    cases: Vec<ModelCase>,
    names: FxHashSet<String>,
}

impl CaseRegistry {
    pub fn new() -> CaseRegistry {
        CaseRegistry::default()
    }

    /// Add a case. Names must be unique and every case needs at least one
    /// example.
    pub fn register(&mut self, case: ModelCase) -> Result<(), EvalError> {
        if case.inputs.is_empty() {
            return Err(EvalError::MissingInputs(case.name));
        }
        if !self.names.insert(case.name.clone()) {
            return Err(EvalError::DuplicateCase(case.name));
        }
        self.cases.push(case);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelCase> {
        self.cases.iter().find(|case| case.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.cases.iter().map(|case| case.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Return the cases matching `selection`, sorted by name.
    pub fn select(&self, selection: &CaseSelection) -> Result<Vec<&ModelCase>, EvalError> {
        let mut selected: Vec<&ModelCase> = match selection {
            CaseSelection::All => self.cases.iter().collect(),
            CaseSelection::First(n) => self.cases.iter().take(*n).collect(),
            CaseSelection::Names(patterns) => {
                let mut wanted: FxHashSet<&str> = FxHashSet::default();
                for pattern in patterns {
                    if is_pattern(pattern) {
                        let regex = Regex::new(&format!("^(?:{})", pattern)).map_err(|err| {
                            EvalError::Pattern {
                                pattern: pattern.clone(),
                                message: err.to_string(),
                            }
                        })?;
                        for case in &self.cases {
                            let matched = regex.is_match(&case.name).map_err(|err| {
                                EvalError::Pattern {
                                    pattern: pattern.clone(),
                                    message: err.to_string(),
                                }
                            })?;
                            if matched {
                                wanted.insert(&case.name);
                            }
                        }
                    } else {
                        wanted.insert(pattern.as_str());
                    }
                }
                self.cases
                    .iter()
                    .filter(|case| wanted.contains(case.name.as_str()))
                    .collect()
            }
        };
        selected.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(selected)
    }
}

fn is_pattern(name: &str) -> bool {
    name.contains('*') || name.contains('?')
}

/// Return a registry with the built-in model cases.
pub fn discover() -> Result<CaseRegistry, EvalError> {
    let hub = Hub::new();
    let mut registry = CaseRegistry::new();
    for case in builtin_cases(&hub)? {
        registry.register(case)?;
    }
    Ok(registry)
}

/// Which cases of a registry to evaluate.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum CaseSelection {
    #[default]
    All,

    /// The first `n` cases in registration order.
    First(usize),

    /// Cases with the given names. Names containing `*` or `?` are regular
    /// expressions which must match at the start of a case name. Names
    /// which match no case are ignored.
    Names(Vec<String>),
}

impl CaseSelection {
    /// Create a selection from a list of names, where the single name
    /// "three" selects the first three cases.
    pub fn from_names(names: Vec<String>) -> CaseSelection {
        match names.as_slice() {
            [] => CaseSelection::All,
            [name] if name == "three" => CaseSelection::First(3),
            _ => CaseSelection::Names(names),
        }
    }
}

impl fmt::Display for CaseSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseSelection::All => write!(f, "all cases"),
            CaseSelection::First(n) => write!(f, "the first {} cases", n),
            CaseSelection::Names(names) => write!(f, "cases={:?}", names),
        }
    }
}

/// Options for [`evaluation`].
#[derive(Clone, Debug)]
pub struct EvalOptions {
    pub exporters: Vec<Exporter>,

    /// Values of the dynamic flag to evaluate each exporter with.
    pub dynamic: Vec<bool>,

    pub cases: CaseSelection,

    /// Verbosity. Runs are made with one level less.
    pub verbose: u32,

    /// Record failures in the outcomes instead of stopping at the first one.
    pub quiet: bool,

    pub prefix: DimPrefix,
}

impl Default for EvalOptions {
    fn default() -> EvalOptions {
        EvalOptions {
            exporters: Exporter::defaults(),
            dynamic: vec![false, true],
            cases: CaseSelection::All,
            verbose: 0,
            quiet: true,
            prefix: DimPrefix::default(),
        }
    }
}

impl EvalOptions {
    /// Create options from defaults overridden by environment variables.
    ///
    /// - `RTEN_DIAG_EXPORTERS` - Comma-separated exporter names
    /// - `RTEN_DIAG_DYNAMIC` - Evaluate only with (1) or without (0) dynamic
    ///   shapes
    /// - `RTEN_DIAG_CASES` - Comma-separated case names or patterns
    /// - `RTEN_DIAG_VERBOSE` - Verbosity level
    /// - `RTEN_DIAG_QUIET` - Set to 0 to stop at the first failure
    pub fn from_env() -> Result<EvalOptions, EvalError> {
        let mut options = EvalOptions::default();
        if let Some(names) = env_list("RTEN_DIAG_EXPORTERS") {
            options.exporters = names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<_, _>>()?;
        }
        if let Some(dynamic) = env_var::<String>("RTEN_DIAG_DYNAMIC") {
            options.dynamic = vec![str_as_bool(dynamic.trim())];
        }
        if let Some(names) = env_list("RTEN_DIAG_CASES") {
            options.cases = CaseSelection::from_names(names);
        }
        if let Some(verbose) = env_var("RTEN_DIAG_VERBOSE") {
            options.verbose = verbose;
        }
        options.quiet = env_flag("RTEN_DIAG_QUIET", options.quiet);
        Ok(options)
    }
}

/// Evaluate every combination of selected case, dynamic flag and exporter.
///
/// Outcomes are returned in case name order, then in the order of
/// `options.dynamic` and `options.exporters`. In quiet mode every
/// combination produces an outcome, otherwise the first failure is returned
/// as an error.
pub fn evaluation(
    registry: &CaseRegistry,
    toolchain: Toolchain<'_>,
    options: &EvalOptions,
) -> Result<Vec<Outcome>, EvalError> {
    let cases = registry.select(&options.cases)?;
    let total = cases.len() * options.dynamic.len() * options.exporters.len();
    if total == 0 {
        return Err(EvalError::NoCases(options.cases.to_string()));
    }

    let mut outcomes = Vec::with_capacity(total);
    for case in cases {
        for &dynamic in &options.dynamic {
            for &exporter in &options.exporters {
                if options.verbose > 0 {
                    info!(
                        case = %case.name,
                        dynamic,
                        %exporter,
                        "[{}/{}] evaluation",
                        outcomes.len() + 1,
                        total
                    );
                }
                let run_options = RunOptions {
                    dynamic,
                    quiet: options.quiet,
                    verbose: options.verbose.saturating_sub(1),
                    prefix: options.prefix.clone(),
                };
                let mut outcome = run_exporter(exporter, case, toolchain, &run_options)?;
                outcome.identify(&case.name, dynamic, &exporter.to_string());
                outcomes.push(outcome);
            }
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use rten_tensor::Tensor;

    use super::{discover, evaluation, CaseRegistry, CaseSelection, EvalOptions};
    use crate::errors::EvalError;
    use crate::exporter::Exporter;
    use crate::model::ModelCase;
    use crate::outcome::ErrorStep;
    use crate::reference::ReferenceBackend;
    use crate::runner::Toolchain;
    use crate::tree::{ExampleInput, Node};

    fn exporters(names: &[&str]) -> Vec<Exporter> {
        names.iter().map(|name| name.parse().unwrap()).collect()
    }

    fn registry() -> CaseRegistry {
        discover().unwrap()
    }

    #[test]
    fn test_register() {
        let mut registry = CaseRegistry::new();
        let case = |name: &str, n: usize| {
            let inputs = (0..n)
                .map(|_| ExampleInput::from_args(vec![Node::tensor(Tensor::<f32>::zeros(&[2]))]))
                .collect();
            ModelCase::new(name, || Rc::new(crate::cases::InplaceAdd), inputs)
        };
        registry.register(case("a", 1)).unwrap();
        assert!(matches!(
            registry.register(case("a", 2)),
            Err(EvalError::DuplicateCase(_))
        ));
        assert!(matches!(
            registry.register(case("b", 0)),
            Err(EvalError::MissingInputs(_))
        ));
        assert_eq!(registry.names(), ["a"]);
    }

    #[test]
    fn test_select() {
        #[derive(Debug)]
        struct Case {
            selection: CaseSelection,
            expected: Vec<&'static str>,
        }

        let names = |names: &[&str]| CaseSelection::Names(names.iter().map(|n| n.to_string()).collect());
        let cases = [
            Case {
                selection: CaseSelection::First(3),
                expected: vec!["inplace_add", "linear", "list_inputs"],
            },
            Case {
                selection: names(&["scalar_arg", "missing"]),
                expected: vec!["scalar_arg"],
            },
            Case {
                selection: names(&["li.*"]),
                expected: vec!["linear", "list_inputs"],
            },
            Case {
                selection: names(&["tiny_llm", "c?ontrol_flow"]),
                expected: vec!["control_flow", "tiny_llm"],
            },
            Case {
                selection: names(&["flow.*"]),
                expected: vec![],
            },
        ];

        let registry = registry();
        for case in cases {
            let selected: Vec<&str> = registry
                .select(&case.selection)
                .unwrap()
                .iter()
                .map(|case| case.name.as_str())
                .collect();
            assert_eq!(selected, case.expected, "{:?}", case);
        }

        let err = registry
            .select(&names(&["(*"]))
            .err()
            .unwrap();
        assert!(matches!(err, EvalError::Pattern { .. }));
    }

    #[test]
    fn test_from_names() {
        assert_eq!(CaseSelection::from_names(vec!["three".into()]), CaseSelection::First(3));
        assert_eq!(CaseSelection::from_names(vec![]), CaseSelection::All);
        assert_eq!(
            CaseSelection::from_names(vec!["a".into(), "three".into()]),
            CaseSelection::Names(vec!["a".into(), "three".into()])
        );
    }

    #[test]
    fn test_evaluation() {
        let backend = ReferenceBackend::new();
        let toolchain = Toolchain {
            backend: &backend,
            runtime: &backend,
        };
        let options = EvalOptions {
            exporters: exporters(&["export-nostrict", "custom"]),
            cases: CaseSelection::Names(vec!["linear".into(), "scalar_arg".into()]),
            ..Default::default()
        };
        let outcomes = evaluation(&registry(), toolchain, &options).unwrap();
        assert_eq!(outcomes.len(), 2 * 2 * 2);

        let keys: Vec<(String, bool, String)> = outcomes
            .iter()
            .map(|o| {
                (
                    o.name.clone().unwrap(),
                    o.dynamic.unwrap(),
                    o.exporter.clone().unwrap(),
                )
            })
            .collect();
        assert_eq!(keys[0], ("linear".to_string(), false, "export-nostrict".to_string()));
        assert_eq!(keys[3], ("linear".to_string(), true, "custom".to_string()));
        assert_eq!(keys[4].0, "scalar_arg");

        for outcome in &outcomes {
            assert!(outcome.success, "{:?}", outcome);
            assert_eq!(outcome.abs, Some(0.));
        }
    }

    #[test]
    fn test_evaluation_strict_control_flow() {
        let backend = ReferenceBackend::new();
        let toolchain = Toolchain {
            backend: &backend,
            runtime: &backend,
        };
        let options = EvalOptions {
            exporters: exporters(&["export-strict", "export-nostrict"]),
            dynamic: vec![true],
            cases: CaseSelection::Names(vec!["control_flow".into()]),
            ..Default::default()
        };
        let outcomes = evaluation(&registry(), toolchain, &options).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].error_step, Some(ErrorStep::Export));
        assert!(outcomes[1].success);

        // Outside quiet mode the export failure is returned.
        let loud = EvalOptions {
            quiet: false,
            ..options
        };
        assert!(matches!(
            evaluation(&registry(), toolchain, &loud),
            Err(EvalError::Export { .. })
        ));
    }

    #[test]
    fn test_evaluation_tiny_llm() {
        let backend = ReferenceBackend::new();
        let toolchain = Toolchain {
            backend: &backend,
            runtime: &backend,
        };
        let options = EvalOptions {
            exporters: exporters(&["export-nostrict", "custom", "dynamo"]),
            dynamic: vec![true],
            cases: CaseSelection::Names(vec!["tiny_llm".into()]),
            ..Default::default()
        };
        let outcomes = evaluation(&registry(), toolchain, &options).unwrap();
        for outcome in &outcomes {
            assert!(outcome.success, "{:?}", outcome);
        }
        let graph_inputs = outcomes[1].graph_inputs.as_ref().unwrap();
        assert_eq!(graph_inputs.len(), 3 + 2 * 2);
    }

    #[test]
    fn test_no_cases() {
        let backend = ReferenceBackend::new();
        let toolchain = Toolchain {
            backend: &backend,
            runtime: &backend,
        };
        let options = EvalOptions {
            cases: CaseSelection::Names(vec!["missing".into()]),
            ..Default::default()
        };
        assert!(matches!(
            evaluation(&registry(), toolchain, &options),
            Err(EvalError::NoCases(_))
        ));
    }
}
