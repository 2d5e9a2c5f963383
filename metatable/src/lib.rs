pub mod error;
pub mod catalog;
pub mod metadata;
pub mod model;
pub mod access;
pub mod validation;
pub mod db;
pub mod engine;
pub mod workflow;

pub use access::{Action, ActorContext, PermissionManager};
pub use engine::{Engine, ListOptions, OperationReport};
pub use error::{MetatableError, Result, ValidationErrors};
pub use model::{Field, FieldModel, FieldModelBuilder};
pub use workflow::{TransitionOutcome, WorkflowEngine};
