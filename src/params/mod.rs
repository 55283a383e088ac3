//! Parameter synchronization between typed values and OpenFOAM dictionaries.

pub mod codec;
pub mod dictionary;
pub mod manager;
pub mod schema;

pub use codec::ParameterCodec;
pub use manager::ParameterManager;
pub use schema::{DictKind, FieldKind, FieldSpec};
