//! Shared row, schema, error and run model types for rowpipe.
//!
//! This crate has no runtime dependencies so both the engine and individual
//! transforms can use it without pulling in the executor.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod envelope;
pub mod error;
pub mod metric;
pub mod options;
pub mod schema;
pub mod state;
pub mod value;
pub mod variables;

pub mod prelude {
    pub use crate::envelope::{ErrorRecord, Timestamp};
    pub use crate::error::{ErrorCategory, TransformError, ValidationResult, ValidationStatus};
    pub use crate::metric::CounterSnapshot;
    pub use crate::options::{FieldList, FieldSpec, FileList, FileSpec};
    pub use crate::schema::{FieldDescriptor, RowSchema, TrimType, ValueType, UNSPECIFIED};
    pub use crate::value::{Row, Value};
    pub use crate::variables::{VariableSpace, Variables};
}
