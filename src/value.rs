//! Value types which appear as the leaves of model inputs and outputs.

use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of a tensor value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Float,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> u8 {
        4
    }

    fn rust_name(self) -> &'static str {
        match self {
            DataType::Float => "f32",
            DataType::Int32 => "i32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rust_name())
    }
}

/// Errors when casting a [`Value`] or [`Leaf`] to a tensor of a specific type.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CastError {
    #[error("expected tensor with type {expected} but has type {actual}")]
    WrongType { actual: DataType, expected: DataType },

    /// The leaf is a scalar or `None` rather than a tensor.
    #[error("expected a tensor but found {0}")]
    NotATensor(String),

    /// An integer scalar does not fit in an `i32` tensor.
    #[error("integer {0} is out of range for an i32 tensor")]
    ScalarOutOfRange(i64),
}

/// An owned tensor which appears as a leaf of a model input or output.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    FloatTensor(Tensor<f32>),
    Int32Tensor(Tensor<i32>),
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match self {
            Value::FloatTensor(_) => DataType::Float,
            Value::Int32Tensor(_) => DataType::Int32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::FloatTensor(t) => t.shape(),
            Value::Int32Tensor(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the elements in logical order, widened to `f64` for comparison.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Value::FloatTensor(t) => t.iter().map(|&x| x as f64).collect(),
            Value::Int32Tensor(t) => t.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Borrow the tensor if its elements have type `T`.
    pub fn as_tensor<'a, T>(&'a self) -> Option<&'a Tensor<T>>
    where
        &'a Tensor<T>: TryFrom<&'a Value>,
    {
        <&Tensor<T>>::try_from(self).ok()
    }

    /// Take the tensor if its elements have type `T`.
    pub fn into_tensor<T>(self) -> Option<Tensor<T>>
    where
        Tensor<T>: TryFrom<Value>,
    {
        Tensor::<T>::try_from(self).ok()
    }
}

macro_rules! tensor_value {
    ($variant:ident, $elem:ty, $dtype:expr) => {
        impl From<Tensor<$elem>> for Value {
            fn from(t: Tensor<$elem>) -> Value {
                Value::$variant(t)
            }
        }

        impl TryFrom<Value> for Tensor<$elem> {
            type Error = CastError;

            fn try_from(value: Value) -> Result<Tensor<$elem>, CastError> {
                match value {
                    Value::$variant(t) => Ok(t),
                    other => Err(CastError::WrongType {
                        actual: other.dtype(),
                        expected: $dtype,
                    }),
                }
            }
        }

        impl<'a> TryFrom<&'a Value> for &'a Tensor<$elem> {
            type Error = CastError;

            fn try_from(value: &'a Value) -> Result<&'a Tensor<$elem>, CastError> {
                match value {
                    Value::$variant(t) => Ok(t),
                    other => Err(CastError::WrongType {
                        actual: other.dtype(),
                        expected: $dtype,
                    }),
                }
            }
        }
    };
}

tensor_value!(FloatTensor, f32, DataType::Float);
tensor_value!(Int32Tensor, i32, DataType::Int32);

/// A non-tensor number passed to or returned from a model.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(x) => x as f64,
            Scalar::Float(x) => x,
        }
    }

    /// Convert this scalar into a one-element tensor.
    ///
    /// Graph runtimes do not accept rank-0 feeds, so the tensor has shape
    /// `[1]`.
    pub fn to_value(self) -> Result<Value, CastError> {
        match self {
            Scalar::Int(x) => {
                let x = i32::try_from(x).map_err(|_| CastError::ScalarOutOfRange(x))?;
                Ok(Tensor::from_data(&[1], vec![x]).into())
            }
            Scalar::Float(x) => Ok(Tensor::from_data(&[1], vec![x as f32]).into()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(x) => write!(f, "int {}", x),
            Scalar::Float(x) => write!(f, "float {}", x),
        }
    }
}

/// A leaf of a nested model input or output.
#[derive(Clone, Debug, PartialEq)]
pub enum Leaf {
    Tensor(Value),
    Scalar(Scalar),
    None,
}

impl Leaf {
    /// Return the tensor held by this leaf, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Leaf::Tensor(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Leaf::None)
    }

    /// Convert this leaf into a tensor which can be fed to a graph runtime.
    pub fn to_feed(&self) -> Result<Value, CastError> {
        match self {
            Leaf::Tensor(value) => Ok(value.clone()),
            Leaf::Scalar(scalar) => scalar.to_value(),
            Leaf::None => Err(CastError::NotATensor(self.to_string())),
        }
    }
}

impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leaf::Tensor(value) => write!(f, "{} {:?}", value.dtype(), value.shape()),
            Leaf::Scalar(scalar) => write!(f, "{}", scalar),
            Leaf::None => write!(f, "None"),
        }
    }
}

impl From<Value> for Leaf {
    fn from(value: Value) -> Leaf {
        Leaf::Tensor(value)
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{CastError, DataType, Leaf, Scalar, Value};

    #[test]
    fn test_value_conversions() {
        let value: Value = Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]).into();
        assert_eq!(value.dtype(), DataType::Float);
        assert_eq!(value.shape(), &[2, 2]);
        assert_eq!(value.len(), 4);
        assert!(value.as_tensor::<f32>().is_some());
        assert!(value.as_tensor::<i32>().is_none());
        assert_eq!(value.dtype().to_string(), "f32");

        let ids: Value = Tensor::from_data(&[1, 3], vec![1, 2, 3]).into();
        assert_eq!(ids.dtype(), DataType::Int32);
        assert_eq!(ids.to_f64_vec(), [1., 2., 3.]);

        let err = Tensor::<f32>::try_from(ids).err();
        assert_eq!(
            err,
            Some(CastError::WrongType {
                actual: DataType::Int32,
                expected: DataType::Float,
            })
        );
    }

    #[test]
    fn test_scalar_feeds() {
        let feed = Leaf::Scalar(Scalar::Int(3)).to_feed().unwrap();
        assert_eq!(feed.shape(), &[1]);
        assert_eq!(feed.to_f64_vec(), [3.]);

        let feed = Leaf::Scalar(Scalar::Float(0.5)).to_feed().unwrap();
        assert_eq!(feed.dtype(), DataType::Float);

        assert_eq!(
            Scalar::Int(i64::MAX).to_value().err(),
            Some(CastError::ScalarOutOfRange(i64::MAX))
        );
        assert!(Leaf::None.to_feed().is_err());
    }
}
