use std::fmt;

use serde::{Serialize, Serializer};

use crate::discrepancy::Discrepancy;
use crate::graph::GraphInput;

/// Stage of an evaluation at which a failure occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorStep {
    /// The exporter failed.
    Export,
    /// Dynamic shapes could not be derived, or the graph inputs do not match
    /// the example inputs.
    Inputs,
    /// The runtime could not load the exported graph.
    OrtInit,
    /// The model failed when run eagerly.
    Eager,
    /// The exported artifact failed on the example with this index.
    Run(usize),
    /// Outputs could not be compared. The index is absent for the first
    /// example.
    Discrepancy(Option<usize>),
    /// Outputs differ by more than the threshold on the example with this
    /// index.
    Diff(usize),
    /// A dynamic export produced a graph without symbolic dimensions.
    Dynamic,
}

impl fmt::Display for ErrorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStep::Export => write!(f, "export"),
            ErrorStep::Inputs => write!(f, "inputs"),
            ErrorStep::OrtInit => write!(f, "ort-init"),
            ErrorStep::Eager => write!(f, "eager"),
            ErrorStep::Run(i) => write!(f, "run.{}", i),
            ErrorStep::Discrepancy(None) => write!(f, "discrepancy"),
            ErrorStep::Discrepancy(Some(i)) => write!(f, "discrepancy.{}", i),
            ErrorStep::Diff(i) => write!(f, "diff.{}", i),
            ErrorStep::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl Serialize for ErrorStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn bool_as_int<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*value))
}

fn opt_bool_as_int<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => bool_as_int(value, serializer),
        None => serializer.serialize_none(),
    }
}

/// Result of evaluating one exporter on one model case.
///
/// This serializes to a flat record in which `success` and `dynamic` are
/// 0/1 integers, and fields which are not set are omitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Outcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "opt_bool_as_int"
    )]
    pub dynamic: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exporter: Option<String>,

    /// Cause of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(serialize_with = "bool_as_int")]
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_step: Option<ErrorStep>,

    /// Maximum absolute difference between eager and exported outputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs: Option<f64>,

    /// Maximum relative difference between eager and exported outputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<f64>,

    /// Kind of artifact produced by the exporter ("program" or "graph").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Inputs declared by the exported graph.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_inputs: Option<Vec<GraphInput>>,
}

impl Outcome {
    /// Create a failed outcome with no other information.
    pub fn failure(step: ErrorStep, error: impl Into<String>) -> Outcome {
        Outcome {
            error: Some(error.into()),
            success: false,
            error_step: Some(step),
            ..Default::default()
        }
    }

    /// Create an outcome from the discrepancy measured on the first example.
    pub fn from_discrepancy(disc: &Discrepancy) -> Outcome {
        let mut outcome = Outcome {
            success: true,
            abs: Some(disc.abs),
            rel: Some(disc.rel),
            ..Default::default()
        };
        if !disc.is_success() {
            outcome.mark_failed(ErrorStep::Diff(0), ErrorStep::Diff(0).to_string());
        }
        outcome
    }

    /// Record a failure on this outcome, replacing any earlier error.
    pub fn mark_failed(&mut self, step: ErrorStep, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.error_step = Some(step);
    }

    /// Merge the discrepancy measured when re-checking example `index`.
    ///
    /// A discrepancy above the threshold replaces the recorded differences
    /// and marks the outcome as failed.
    pub fn merge_recheck(&mut self, index: usize, disc: &Discrepancy) {
        if disc.is_success() {
            return;
        }
        self.abs = Some(disc.abs);
        self.rel = Some(disc.rel);
        let step = ErrorStep::Diff(index);
        self.mark_failed(step, step.to_string());
    }

    /// Set the fields which identify the evaluation.
    pub fn identify(&mut self, name: &str, dynamic: bool, exporter: &str) {
        self.name = Some(name.to_string());
        self.dynamic = Some(dynamic);
        self.exporter = Some(exporter.to_string());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ErrorStep, Outcome};
    use crate::discrepancy::Discrepancy;

    #[test]
    fn test_failure_record() {
        let outcome = Outcome::failure(ErrorStep::Export, "boom");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"error": "boom", "success": 0, "error_step": "export"})
        );
    }

    #[test]
    fn test_error_step_names() {
        let steps = [
            (ErrorStep::OrtInit, "ort-init"),
            (ErrorStep::Run(2), "run.2"),
            (ErrorStep::Discrepancy(None), "discrepancy"),
            (ErrorStep::Discrepancy(Some(1)), "discrepancy.1"),
            (ErrorStep::Diff(0), "diff.0"),
            (ErrorStep::Dynamic, "dynamic"),
        ];
        for (step, name) in steps {
            assert_eq!(step.to_string(), name);
        }
    }

    #[test]
    fn test_success_record() {
        let disc = Discrepancy {
            abs: 0.01,
            rel: 0.001,
            sum: 0.02,
            n: 4,
        };
        let mut outcome = Outcome::from_discrepancy(&disc);
        outcome.identify("Linear", true, "export-strict");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "name": "Linear",
                "dynamic": 1,
                "exporter": "export-strict",
                "success": 1,
                "abs": 0.01,
                "rel": 0.001,
            })
        );

        let worse = Discrepancy {
            abs: 0.5,
            ..disc
        };
        outcome.merge_recheck(1, &worse);
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("diff.1"));
        assert_eq!(outcome.error_step, Some(ErrorStep::Diff(1)));
        assert_eq!(outcome.abs, Some(0.5));
    }

    #[test]
    fn test_diff_failure_on_first_example() {
        let disc = Discrepancy {
            abs: 0.1,
            rel: 0.1,
            sum: 0.1,
            n: 1,
        };
        let outcome = Outcome::from_discrepancy(&disc);
        assert!(!outcome.success);
        assert_eq!(outcome.error_step, Some(ErrorStep::Diff(0)));
        assert_eq!(outcome.error.as_deref(), Some("diff.0"));
    }
}
