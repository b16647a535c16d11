pub mod field;

pub use field::{FieldPath, FieldPathError};
