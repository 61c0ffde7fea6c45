//! Dynamic field values.
//!
//! [`FieldValue`] is the uniform value representation used by the reflective
//! access API and by the generic field storage strategies. Generated bindings
//! would use typed accessors instead; the runtime itself only ever moves
//! values of this type around.

use std::fmt;
use std::sync::Arc;

use crate::objects::Obj;

/// A single field value of any SKilL field type.
///
/// `Null` stands in for absent references, absent strings and absent
/// collections alike; the field type decides how it is encoded. Collections
/// of every kind (constant/variable arrays, lists, sets) use the `List`
/// variant, maps preserve their entry order in a pair vector.
#[derive(Clone, Default)]
pub enum FieldValue {
    /// Absent reference, string, or collection.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// 8 bit signed integer.
    I8(i8),
    /// 16 bit signed integer.
    I16(i16),
    /// 32 bit signed integer.
    I32(i32),
    /// 64 bit signed integer; also carries v64-typed values.
    I64(i64),
    /// IEEE-754 single.
    F32(f32),
    /// IEEE-754 double.
    F64(f64),
    /// Interned string.
    String(Arc<str>),
    /// Reference to another object, possibly across pools.
    Ref(Obj),
    /// Elements of an array, list or set field.
    List(Vec<FieldValue>),
    /// Entries of a map field in insertion order.
    Map(Vec<(FieldValue, FieldValue)>),
}

impl FieldValue {
    /// Returns true for the `Null` variant.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// The value as an i64 if it carries any integer variant.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I8(v) => Some(i64::from(*v)),
            FieldValue::I16(v) => Some(i64::from(*v)),
            FieldValue::I32(v) => Some(i64::from(*v)),
            FieldValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// The referenced object if this is a non-null reference.
    #[must_use]
    pub fn as_ref_obj(&self) -> Option<&Obj> {
        match self {
            FieldValue::Ref(o) => Some(o),
            _ => None,
        }
    }

    /// The string content if this is a non-null string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (F32(a), F32(b)) => a == b,
            (F64(a), F64(b)) => a == b,
            (String(a), String(b)) => a == b,
            // references are equal iff they point at the same object
            (Ref(a), Ref(b)) => Arc::ptr_eq(a, b),
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FieldValue::*;
        match self {
            Null => write!(f, "null"),
            Bool(v) => write!(f, "{v}"),
            I8(v) => write!(f, "{v}i8"),
            I16(v) => write!(f, "{v}i16"),
            I32(v) => write!(f, "{v}i32"),
            I64(v) => write!(f, "{v}i64"),
            F32(v) => write!(f, "{v}f32"),
            F64(v) => write!(f, "{v}f64"),
            String(s) => write!(f, "{s:?}"),
            Ref(o) => write!(f, "ref#{}", o.skill_id()),
            List(xs) => f.debug_list().entries(xs).finish(),
            Map(xs) => f.debug_map().entries(xs.iter().map(|(k, v)| (k, v))).finish(),
        }
    }
}
