use std::fmt;
use std::rc::Rc;

use crate::dynamic_shapes::InputShapes;
use crate::errors::RunError;
use crate::tree::{ExampleInput, Node};
use crate::value::Value;

/// A model which can be run eagerly.
///
/// Models take ownership of their inputs, so a model which updates an input
/// in place cannot affect the caller's copy.
pub trait Model {
    /// Return the name of the model, used in reports and error messages.
    fn name(&self) -> &str;

    /// Run the model.
    fn forward(&self, inputs: ExampleInput) -> Result<Node, RunError>;

    /// Return the weights of the model.
    fn parameters(&self) -> Vec<&Value> {
        Vec::new()
    }

    /// Return the names of the keyword inputs accepted by
    /// [`forward`](Model::forward), or `None` if the model accepts any input.
    fn input_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Return true if the operations run by the model depend on the values
    /// of its inputs, not just their shapes. Strict exporters reject such
    /// models.
    fn data_dependent_control_flow(&self) -> bool {
        false
    }
}

/// A runnable artifact which accepts the same inputs as the model it was
/// exported from.
pub trait Callable {
    fn call(&self, inputs: ExampleInput) -> Result<Node, RunError>;
}

/// Callable which runs a model eagerly.
pub struct EagerCallable(pub Rc<dyn Model>);

impl Callable for EagerCallable {
    fn call(&self, inputs: ExampleInput) -> Result<Node, RunError> {
        self.0.forward(inputs)
    }
}

/// Function which creates a fresh instance of a model.
pub type ModelFactory = Rc<dyn Fn() -> Rc<dyn Model>>;

/// A model to evaluate along with the example inputs to evaluate it with.
#[derive(Clone)]
pub struct ModelCase {
    pub name: String,
    factory: ModelFactory,

    /// Example inputs. All examples share the same signature and only differ
    /// in tensor sizes.
    pub inputs: Vec<ExampleInput>,

    /// Dynamic shapes to use for dynamic exports. If absent, they are guessed
    /// from the example inputs.
    pub dynamic_shapes: Option<InputShapes>,
}

impl ModelCase {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> Rc<dyn Model> + 'static,
        inputs: Vec<ExampleInput>,
    ) -> ModelCase {
        ModelCase {
            name: name.into(),
            factory: Rc::new(factory),
            inputs,
            dynamic_shapes: None,
        }
    }

    pub fn with_dynamic_shapes(mut self, shapes: InputShapes) -> ModelCase {
        self.dynamic_shapes = Some(shapes);
        self
    }

    /// Create a fresh instance of the model.
    pub fn build(&self) -> Rc<dyn Model> {
        (self.factory)()
    }
}

impl fmt::Debug for ModelCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCase")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("dynamic_shapes", &self.dynamic_shapes.is_some())
            .finish()
    }
}
