//! Internal testing utilities for the rten-diagnostic crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

use rten_tensor::Tensor;

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// Create a `Debug` struct, conventionally named `Case`, holding the data for
/// one test, build a collection of cases and call `cases.test_each` with the
/// test function. Every case is run, panics are caught and the failing cases
/// are reported together at the end.
///
/// ```
/// use rten_diagnostic_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///   name: &'static str,
///   expected: &'static str,
/// }
///
/// let cases = [Case { name: "export-strict", expected: "export" }];
/// cases.test_each(|case| {
///   assert_eq!(case.name.split('-').next(), Some(case.expected));
/// });
/// ```
///
/// Test cases and captured values must be
/// [unwind safe](https://doc.rust-lang.org/std/panic/fn.catch_unwind.html).
/// Cases holding values which are not (eg. boxed trait objects) should
/// describe how to build the value instead, or use `test_each_value`.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with a reference to each case, catching panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases by
    /// value. The debug representation of each case is captured before the
    /// test function is called.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        assert_eq!(
            failures.len(),
            0,
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let test = &test;
            let case_str = format!("{:?}", case);
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        assert_eq!(
            failures.len(),
            0,
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }
}

/// Create a float tensor with the given shape filled with values in `[-1, 1)`
/// from a seeded generator, so that test inputs are reproducible.
pub fn random_tensor(shape: &[usize], seed: u64) -> Tensor<f32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.f32() * 2.0 - 1.0).collect();
    Tensor::from_data(shape, data)
}

/// Create an int tensor with the given shape filled with values in
/// `[0, high)` from a seeded generator.
pub fn random_ids(shape: &[usize], high: i32, seed: u64) -> Tensor<i32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let len = shape.iter().product();
    let data: Vec<i32> = (0..len).map(|_| rng.i32(0..high)).collect();
    Tensor::from_data(shape, data)
}
