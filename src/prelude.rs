//! # skillrt Prelude
//!
//! Convenient re-exports of the types nearly every user of the runtime
//! touches. Import this module to get going quickly.

/// The main error type for all runtime operations
pub use crate::Error;

/// The result type used throughout the runtime
pub use crate::Result;

/// A SKilL file materialized as a live object graph
pub use crate::state::SkillState;

/// Handle to one field of one pool
pub use crate::state::FieldId;

/// The SKilL field-type catalogue
pub use crate::fieldtypes::FieldType;

/// Dynamic field values
pub use crate::fieldtypes::FieldValue;

/// Instances and their shared handles
pub use crate::objects::{Obj, SkillObject};

/// Storage pools and their handles
pub use crate::pools::{Pool, PoolId};

/// Field storage strategies and restrictions
pub use crate::fields::{FieldRestriction, FieldStrategy};

/// The string pool
pub use crate::strings::StringPool;
