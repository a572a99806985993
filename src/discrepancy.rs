//! Numerical comparison of model outputs.

use std::fmt;

use crate::errors::StructuralError;
use crate::tree::{LeafPath, Node, Tree};
use crate::value::Leaf;

/// A run is successful if the maximum absolute difference between the
/// expected and actual outputs is strictly below this threshold.
pub const DIFF_THRESHOLD: f64 = 0.1;

/// Added to the magnitude of the expected value when computing relative
/// differences, so that zero-valued outputs do not divide by zero.
pub const REL_EPSILON: f64 = 1e-10;

/// Discrepancy between expected and actual outputs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Discrepancy {
    /// Maximum absolute difference.
    pub abs: f64,

    /// Maximum relative difference.
    pub rel: f64,

    /// Sum of absolute differences.
    pub sum: f64,

    /// Number of compared elements.
    pub n: usize,
}

impl Discrepancy {
    pub fn zero() -> Discrepancy {
        Discrepancy {
            abs: 0.,
            rel: 0.,
            sum: 0.,
            n: 0,
        }
    }

    /// Discrepancy for outputs which cannot be compared elementwise, such as
    /// tensors of different shapes.
    pub fn infinite() -> Discrepancy {
        Discrepancy {
            abs: f64::INFINITY,
            rel: f64::INFINITY,
            sum: f64::INFINITY,
            n: 0,
        }
    }

    fn merge(self, other: Discrepancy) -> Discrepancy {
        Discrepancy {
            abs: self.abs.max(other.abs),
            rel: self.rel.max(other.rel),
            sum: self.sum + other.sum,
            n: self.n + other.n,
        }
    }

    fn add_element(&mut self, expected: f64, actual: f64) {
        let diff = if expected == actual || (expected.is_nan() && actual.is_nan()) {
            0.
        } else if expected.is_nan() || actual.is_nan() {
            f64::INFINITY
        } else {
            (expected - actual).abs()
        };
        let rel = if diff == 0. {
            0.
        } else if diff.is_infinite() {
            f64::INFINITY
        } else {
            diff / (expected.abs() + REL_EPSILON)
        };
        self.abs = self.abs.max(diff);
        self.rel = self.rel.max(rel);
        self.sum += diff;
        self.n += 1;
    }

    /// Mean absolute difference.
    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.
        } else {
            self.sum / self.n as f64
        }
    }

    /// Return true if this discrepancy is below [`DIFF_THRESHOLD`].
    pub fn is_success(&self) -> bool {
        self.abs < DIFF_THRESHOLD
    }
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "abs={:.3e} rel={:.3e} n={}",
            self.abs, self.rel, self.n
        )
    }
}

/// Compute the discrepancy between expected outputs from eager execution and
/// actual outputs from an exported artifact.
///
/// The two outputs are walked leaf by leaf. If they differ in structure but
/// `actual` is a flat sequence with one item per non-`None` leaf of
/// `expected`, the flattened leaves are compared instead, since runtimes
/// return outputs as a flat list.
///
/// Tensors with different shapes give an infinite discrepancy. A `NaN` in
/// only one of the outputs gives an infinite difference for that element,
/// and `NaN` in both gives zero. Any other mismatch in structure, such as a
/// tensor compared with `None`, is an error.
pub fn max_diff(expected: &Node, actual: &Node) -> Result<Discrepancy, StructuralError> {
    let pairs: Vec<(LeafPath, &Leaf, &Leaf)> = match expected.check_same_structure(actual) {
        Ok(()) => expected
            .leaves_with_paths()
            .into_iter()
            .zip(actual.leaves())
            .map(|((path, e), a)| (path, e, a))
            .collect(),
        Err(err) => {
            let expected_leaves: Vec<(LeafPath, &Leaf)> = expected
                .leaves_with_paths()
                .into_iter()
                .filter(|(_, leaf)| !leaf.is_none())
                .collect();
            match actual {
                Tree::Sequence(_, items)
                    if items.len() == expected_leaves.len()
                        && items.iter().all(|item| matches!(item, Tree::Leaf(_))) =>
                {
                    expected_leaves
                        .into_iter()
                        .zip(actual.leaves())
                        .map(|((path, e), a)| (path, e, a))
                        .collect()
                }
                _ => return Err(err),
            }
        }
    };

    pairs
        .into_iter()
        .try_fold(Discrepancy::zero(), |acc, (path, e, a)| {
            Ok(acc.merge(leaf_diff(path, e, a)?))
        })
}

fn leaf_diff(path: LeafPath, expected: &Leaf, actual: &Leaf) -> Result<Discrepancy, StructuralError> {
    let mut disc = Discrepancy::zero();
    match (expected, actual) {
        (Leaf::None, Leaf::None) => {}
        (Leaf::Tensor(e), Leaf::Tensor(a)) => {
            if e.shape() != a.shape() {
                return Ok(Discrepancy::infinite());
            }
            for (x, y) in e.to_f64_vec().into_iter().zip(a.to_f64_vec()) {
                disc.add_element(x, y);
            }
        }
        (Leaf::Scalar(e), Leaf::Scalar(a)) => disc.add_element(e.as_f64(), a.as_f64()),

        // Runtimes return scalar outputs as one-element tensors.
        (Leaf::Scalar(s), Leaf::Tensor(t)) | (Leaf::Tensor(t), Leaf::Scalar(s)) => {
            let values = t.to_f64_vec();
            if values.len() != 1 {
                return Ok(Discrepancy::infinite());
            }
            disc.add_element(s.as_f64(), values[0]);
        }
        _ => {
            return Err(StructuralError::LeafMismatch {
                path,
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
    Ok(disc)
}

#[cfg(test)]
mod tests {
    use rten_diagnostic_testing::TestCases;
    use rten_tensor::Tensor;

    use super::{max_diff, Discrepancy, DIFF_THRESHOLD};
    use crate::errors::StructuralError;
    use crate::tree::Node;

    fn vector(data: &[f32]) -> Node {
        Node::tensor(Tensor::from_data(&[data.len()], data.to_vec()))
    }

    #[test]
    fn test_max_diff() {
        #[derive(Debug)]
        struct Case {
            expected: Node,
            actual: Node,
            abs: f64,
            rel: f64,
        }

        let cases = [
            Case {
                expected: vector(&[1., 2., 3.]),
                actual: vector(&[1., 2., 3.]),
                abs: 0.,
                rel: 0.,
            },
            Case {
                expected: vector(&[1., 2., 4.]),
                actual: vector(&[1., 2.5, 3.]),
                abs: 1.,
                rel: 0.25,
            },
            Case {
                expected: vector(&[f32::NAN, 1.]),
                actual: vector(&[f32::NAN, 1.]),
                abs: 0.,
                rel: 0.,
            },
            Case {
                expected: vector(&[f32::NAN, 1.]),
                actual: vector(&[0., 1.]),
                abs: f64::INFINITY,
                rel: f64::INFINITY,
            },
            Case {
                expected: vector(&[1., 2.]),
                actual: vector(&[1., 2., 3.]),
                abs: f64::INFINITY,
                rel: f64::INFINITY,
            },
            Case {
                expected: Node::int(3),
                actual: Node::tensor(Tensor::from_data(&[1], vec![3i32])),
                abs: 0.,
                rel: 0.,
            },
        ];

        cases.test_each(|case| {
            let disc = max_diff(&case.expected, &case.actual).unwrap();
            assert_eq!(disc.abs, case.abs);
            assert!((disc.rel - case.rel).abs() < 1e-6 || disc.rel == case.rel);
        })
    }

    #[test]
    fn test_max_diff_zero_expected() {
        let disc = max_diff(&vector(&[0.]), &vector(&[0.5])).unwrap();
        assert_eq!(disc.abs, 0.5);
        assert!(disc.rel.is_finite());
        assert!(disc.rel > 1e8);
    }

    #[test]
    fn test_nested_outputs() {
        let expected = Node::tuple(vec![
            vector(&[1., 2.]),
            Node::dynamic_cache(
                vec![Tensor::from_data(&[2], vec![0.5f32, 0.5]).into()],
                vec![Tensor::from_data(&[2], vec![1.0f32, 1.0]).into()],
            ),
        ]);
        let mut actual = expected.clone();
        if let crate::tree::Tree::Sequence(_, items) = &mut actual {
            items[0] = vector(&[1., 2.05]);
        }
        let disc = max_diff(&expected, &actual).unwrap();
        assert!((disc.abs - 0.05).abs() < 1e-6);
        assert_eq!(disc.n, 6);

        // Flat runtime outputs are compared against the flattened leaves.
        let flat = Node::list(vec![
            vector(&[1., 2.]),
            vector(&[0.5, 0.5]),
            vector(&[1., 1.]),
        ]);
        assert_eq!(max_diff(&expected, &flat).unwrap().abs, 0.);

        let short = Node::list(vec![vector(&[1., 2.])]);
        assert!(matches!(
            max_diff(&expected, &short),
            Err(StructuralError::ContainerMismatch { .. })
        ));
    }

    #[test]
    fn test_leaf_mismatch() {
        let err = max_diff(&vector(&[1.]), &Node::none()).unwrap_err();
        assert!(matches!(err, StructuralError::LeafMismatch { .. }));
    }

    #[test]
    fn test_threshold_boundary() {
        let at = Discrepancy {
            abs: DIFF_THRESHOLD,
            ..Discrepancy::zero()
        };
        assert!(!at.is_success());

        let below = Discrepancy {
            abs: 0.0999999,
            ..Discrepancy::zero()
        };
        assert!(below.is_success());
        assert!(!Discrepancy::infinite().is_success());
    }
}
