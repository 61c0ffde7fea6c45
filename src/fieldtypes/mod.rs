//! The SKilL field-type catalogue.
//!
//! [`FieldType`] is the closed set of types a field can carry: constant
//! integers, primitives, strings, annotations, references to pools, and the
//! compound types (constant/variable arrays, lists, sets, maps). Every
//! variant obeys one uniform contract:
//!
//! - `read` decodes a single value from a mapped region,
//! - `write` encodes a single value,
//! - `offset` predicts the encoded size, and for every value `v` exactly
//!   `offset(v)` bytes are emitted by `write(v)`.
//!
//! Constant types are special: their value lives in the type itself, so they
//! consume and emit no bytes at all.
//!
//! # Reference
//! - SKilL v1.0 reference manual §G

pub mod value;

pub use value::FieldValue;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::objects::Obj;
use crate::pools::{PoolId, TypeForest};
use crate::streams::{v64_offset, BinaryOut, MapReader};
use crate::strings::StringPool;
use crate::{Error, Result};

/// Everything a decoder needs besides the raw bytes: the pool forest for
/// resolving references and the string pool for resolving string IDs.
pub(crate) struct ReadContext<'a> {
    pub forest: &'a TypeForest,
    pub strings: &'a StringPool,
}

/// Everything an encoder needs besides the sink: the pool forest for
/// annotation targets and the string→ID map built by the string pool's
/// prepare phase.
pub(crate) struct WriteContext<'a> {
    pub forest: &'a TypeForest,
    pub string_ids: &'a FxHashMap<Arc<str>, i64>,
}

/// A SKilL field type.
///
/// Type IDs are stable: 0–4 constants, 5 annotation, 6 bool, 7–13 the
/// fixed and variable width numerics, 14 string, 15 constant-length array,
/// 17–19 the single-argument containers, 20 map, and ≥ 32 user pools.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    /// Constant i8 baked into the schema.
    ConstantI8(i8),
    /// Constant i16 baked into the schema.
    ConstantI16(i16),
    /// Constant i32 baked into the schema.
    ConstantI32(i32),
    /// Constant i64 baked into the schema.
    ConstantI64(i64),
    /// Constant v64 baked into the schema.
    ConstantV64(i64),
    /// Reference to an object of any pool, encoded with its type.
    Annotation,
    /// One-byte boolean.
    Bool,
    /// Fixed width 8 bit signed integer.
    I8,
    /// Fixed width 16 bit signed integer.
    I16,
    /// Fixed width 32 bit signed integer.
    I32,
    /// Fixed width 64 bit signed integer.
    I64,
    /// Variable width signed integer, 1–9 bytes.
    V64,
    /// IEEE-754 single.
    F32,
    /// IEEE-754 double.
    F64,
    /// Reference into the string pool.
    Str,
    /// Array of exactly `length` ground-typed elements, no length prefix.
    ConstantLengthArray {
        /// Element count baked into the schema
        length: u64,
        /// Element type
        ground: Box<FieldType>,
    },
    /// Length-prefixed array of ground-typed elements.
    VariableLengthArray(Box<FieldType>),
    /// Length-prefixed list of ground-typed elements.
    List(Box<FieldType>),
    /// Length-prefixed set of ground-typed elements.
    Set(Box<FieldType>),
    /// Length-prefixed sequence of key/value pairs.
    Map(Box<FieldType>, Box<FieldType>),
    /// Reference to an instance of the pool with index `typeID - 32`.
    Reference(usize),
}

impl FieldType {
    /// The stable SKilL type ID of this type.
    #[must_use]
    pub fn type_id(&self) -> i64 {
        use FieldType::*;
        match self {
            ConstantI8(_) => 0,
            ConstantI16(_) => 1,
            ConstantI32(_) => 2,
            ConstantI64(_) => 3,
            ConstantV64(_) => 4,
            Annotation => 5,
            Bool => 6,
            I8 => 7,
            I16 => 8,
            I32 => 9,
            I64 => 10,
            V64 => 11,
            F32 => 12,
            F64 => 13,
            Str => 14,
            ConstantLengthArray { .. } => 15,
            VariableLengthArray(_) => 17,
            List(_) => 18,
            Set(_) => 19,
            Map(..) => 20,
            Reference(idx) => 32 + *idx as i64,
        }
    }

    /// Whether values of this type contain strings at any nesting depth.
    ///
    /// Used by the serializer to decide which fields to walk during string
    /// collection.
    #[must_use]
    pub fn contains_string(&self) -> bool {
        use FieldType::*;
        match self {
            Str => true,
            ConstantLengthArray { ground, .. }
            | VariableLengthArray(ground)
            | List(ground)
            | Set(ground) => ground.contains_string(),
            Map(k, v) => k.contains_string() || v.contains_string(),
            _ => false,
        }
    }

    fn resolve(forest: &TypeForest, pool: usize, id: i64) -> Option<Obj> {
        let data = forest.base_data_of(PoolId(pool));
        let index = id - 1;
        if index < 0 || index as usize >= data.len() {
            return None;
        }
        Some(data[index as usize].clone())
    }

    /// Decode one value.
    pub(crate) fn read(&self, r: &mut MapReader<'_>, cx: &ReadContext<'_>) -> Result<FieldValue> {
        use FieldType::*;
        Ok(match self {
            ConstantI8(v) => FieldValue::I8(*v),
            ConstantI16(v) => FieldValue::I16(*v),
            ConstantI32(v) => FieldValue::I32(*v),
            ConstantI64(v) | ConstantV64(v) => FieldValue::I64(*v),
            Annotation => {
                let t = r.v64()?;
                let id = r.v64()?;
                if t == 0 {
                    FieldValue::Null
                } else {
                    let pool = (t - 1) as usize;
                    if pool >= cx.forest.len() {
                        return Err(malformed_error!("annotation names unknown type {}", t + 31));
                    }
                    match Self::resolve(cx.forest, pool, id) {
                        Some(o) => FieldValue::Ref(o),
                        None => FieldValue::Null,
                    }
                }
            }
            Bool => FieldValue::Bool(r.boolean()?),
            I8 => FieldValue::I8(r.i8()?),
            I16 => FieldValue::I16(r.i16()?),
            I32 => FieldValue::I32(r.i32()?),
            I64 => FieldValue::I64(r.i64()?),
            V64 => FieldValue::I64(r.v64()?),
            F32 => FieldValue::F32(r.f32()?),
            F64 => FieldValue::F64(r.f64()?),
            Str => match cx.strings.get(r.v64()?)? {
                Some(s) => FieldValue::String(s),
                None => FieldValue::Null,
            },
            ConstantLengthArray { length, ground } => {
                let mut xs = Vec::with_capacity(*length as usize);
                for _ in 0..*length {
                    xs.push(ground.read(r, cx)?);
                }
                FieldValue::List(xs)
            }
            VariableLengthArray(ground) | List(ground) | Set(ground) => {
                let n = r.v64()?;
                let mut xs = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    xs.push(ground.read(r, cx)?);
                }
                FieldValue::List(xs)
            }
            Map(kt, vt) => {
                let n = r.v64()?;
                let mut xs = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    let k = kt.read(r, cx)?;
                    let v = vt.read(r, cx)?;
                    xs.push((k, v));
                }
                FieldValue::Map(xs)
            }
            Reference(pool) => {
                if *pool >= cx.forest.len() {
                    return Err(malformed_error!("reference names unknown type {}", 32 + pool));
                }
                match Self::resolve(cx.forest, *pool, r.v64()?) {
                    Some(o) => FieldValue::Ref(o),
                    None => FieldValue::Null,
                }
            }
        })
    }

    fn mismatch(&self, v: &FieldValue) -> Error {
        Error::Internal(format!("can not encode {v:?} as {self}"))
    }

    /// Encode one value. Emits exactly [`FieldType::offset`] bytes.
    pub(crate) fn write<W: BinaryOut>(
        &self,
        v: &FieldValue,
        w: &mut W,
        cx: &WriteContext<'_>,
    ) -> Result<()> {
        use FieldType::*;
        match (self, v) {
            (ConstantI8(_) | ConstantI16(_) | ConstantI32(_) | ConstantI64(_) | ConstantV64(_), _) => {}
            (Bool, FieldValue::Bool(b)) => w.boolean(*b)?,
            (Bool, FieldValue::Null) => w.boolean(false)?,
            (I8, FieldValue::I8(x)) => w.i8(*x)?,
            (I8, FieldValue::Null) => w.i8(0)?,
            (I16, FieldValue::I16(x)) => w.i16(*x)?,
            (I16, FieldValue::Null) => w.i16(0)?,
            (I32, FieldValue::I32(x)) => w.i32(*x)?,
            (I32, FieldValue::Null) => w.i32(0)?,
            (I64, FieldValue::I64(x)) => w.i64(*x)?,
            (I64, FieldValue::Null) => w.i64(0)?,
            (V64, FieldValue::I64(x)) => w.v64(*x)?,
            (V64, FieldValue::Null) => w.v64(0)?,
            (F32, FieldValue::F32(x)) => w.f32(*x)?,
            (F32, FieldValue::Null) => w.f32(0.0)?,
            (F64, FieldValue::F64(x)) => w.f64(*x)?,
            (F64, FieldValue::Null) => w.f64(0.0)?,
            (Str, FieldValue::Null) => w.i8(0)?,
            (Str, FieldValue::String(s)) => {
                let id = cx
                    .string_ids
                    .get(s)
                    .ok_or_else(|| Error::Internal(format!("string {s:?} was not collected")))?;
                w.v64(*id)?;
            }
            (Annotation, FieldValue::Null) => {
                w.v64(0)?;
                w.v64(0)?;
            }
            (Annotation, FieldValue::Ref(o)) => {
                let id = o.skill_id();
                if id == 0 {
                    // deleted referent degrades to null
                    w.v64(0)?;
                    w.v64(0)?;
                } else {
                    w.v64(o.pool().0 as i64 + 1)?;
                    w.v64(id)?;
                }
            }
            (Reference(_), FieldValue::Null) => w.i8(0)?,
            (Reference(_), FieldValue::Ref(o)) => w.v64(o.skill_id())?,
            (ConstantLengthArray { length, ground }, FieldValue::List(xs)) => {
                if xs.len() as u64 != *length {
                    return Err(Error::WrongArrayLength {
                        expected: *length,
                        actual: xs.len() as u64,
                    });
                }
                for x in xs {
                    ground.write(x, w, cx)?;
                }
            }
            (ConstantLengthArray { length, .. }, FieldValue::Null) => {
                if *length != 0 {
                    return Err(Error::WrongArrayLength {
                        expected: *length,
                        actual: 0,
                    });
                }
            }
            (VariableLengthArray(ground) | List(ground) | Set(ground), FieldValue::List(xs)) => {
                w.v64(xs.len() as i64)?;
                for x in xs {
                    ground.write(x, w, cx)?;
                }
            }
            (VariableLengthArray(_) | List(_) | Set(_), FieldValue::Null) => w.v64(0)?,
            (Map(kt, vt), FieldValue::Map(xs)) => {
                w.v64(xs.len() as i64)?;
                for (k, v) in xs {
                    kt.write(k, w, cx)?;
                    vt.write(v, w, cx)?;
                }
            }
            (Map(..), FieldValue::Null) => w.v64(0)?,
            (_, other) => return Err(self.mismatch(other)),
        }
        Ok(())
    }

    /// Number of bytes [`FieldType::write`] will emit for `v`.
    pub(crate) fn offset(&self, v: &FieldValue, cx: &WriteContext<'_>) -> Result<u64> {
        use FieldType::*;
        Ok(match (self, v) {
            (ConstantI8(_) | ConstantI16(_) | ConstantI32(_) | ConstantI64(_) | ConstantV64(_), _) => 0,
            (Bool | I8, _) => 1,
            (I16, _) => 2,
            (I32 | F32, _) => 4,
            (I64 | F64, _) => 8,
            (V64, FieldValue::I64(x)) => v64_offset(*x),
            (V64, FieldValue::Null) => 1,
            (Str, FieldValue::Null) => 1,
            (Str, FieldValue::String(s)) => {
                let id = cx
                    .string_ids
                    .get(s)
                    .ok_or_else(|| Error::Internal(format!("string {s:?} was not collected")))?;
                v64_offset(*id)
            }
            (Annotation, FieldValue::Null) => 2,
            (Annotation, FieldValue::Ref(o)) => {
                let id = o.skill_id();
                if id == 0 {
                    2
                } else {
                    v64_offset(o.pool().0 as i64 + 1) + v64_offset(id)
                }
            }
            (Reference(_), FieldValue::Null) => 1,
            (Reference(_), FieldValue::Ref(o)) => v64_offset(o.skill_id()),
            (ConstantLengthArray { length, ground }, FieldValue::List(xs)) => {
                if xs.len() as u64 != *length {
                    return Err(Error::WrongArrayLength {
                        expected: *length,
                        actual: xs.len() as u64,
                    });
                }
                let mut sum = 0;
                for x in xs {
                    sum += ground.offset(x, cx)?;
                }
                sum
            }
            (ConstantLengthArray { length, .. }, FieldValue::Null) => {
                if *length != 0 {
                    return Err(Error::WrongArrayLength {
                        expected: *length,
                        actual: 0,
                    });
                }
                0
            }
            (VariableLengthArray(ground) | List(ground) | Set(ground), FieldValue::List(xs)) => {
                let mut sum = v64_offset(xs.len() as i64);
                for x in xs {
                    sum += ground.offset(x, cx)?;
                }
                sum
            }
            (VariableLengthArray(_) | List(_) | Set(_) | Map(..), FieldValue::Null) => 1,
            (Map(kt, vt), FieldValue::Map(xs)) => {
                let mut sum = v64_offset(xs.len() as i64);
                for (k, v) in xs {
                    sum += kt.offset(k, cx)?;
                    sum += vt.offset(v, cx)?;
                }
                sum
            }
            (_, other) => return Err(self.mismatch(other)),
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FieldType::*;
        match self {
            ConstantI8(v) => write!(f, "const i8 = {v}"),
            ConstantI16(v) => write!(f, "const i16 = {v}"),
            ConstantI32(v) => write!(f, "const i32 = {v}"),
            ConstantI64(v) => write!(f, "const i64 = {v}"),
            ConstantV64(v) => write!(f, "const v64 = {v:016X}"),
            Annotation => write!(f, "annotation"),
            Bool => write!(f, "bool"),
            I8 => write!(f, "i8"),
            I16 => write!(f, "i16"),
            I32 => write!(f, "i32"),
            I64 => write!(f, "i64"),
            V64 => write!(f, "v64"),
            F32 => write!(f, "f32"),
            F64 => write!(f, "f64"),
            Str => write!(f, "string"),
            ConstantLengthArray { length, ground } => write!(f, "{ground}[{length}]"),
            VariableLengthArray(g) => write!(f, "{g}[]"),
            List(g) => write!(f, "list<{g}>"),
            Set(g) => write!(f, "set<{g}>"),
            Map(k, v) => write!(f, "map<{k}, {v}>"),
            Reference(idx) => write!(f, "ref#{}", 32 + idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{FileInput, OutBuffer};
    use std::sync::Arc as StdArc;

    fn write_cx<'a>(
        forest: &'a TypeForest,
        ids: &'a FxHashMap<StdArc<str>, i64>,
    ) -> WriteContext<'a> {
        WriteContext {
            forest,
            string_ids: ids,
        }
    }

    /// write must emit exactly offset() bytes, for every type and value
    #[test]
    fn offset_matches_written_bytes() {
        let forest = TypeForest::new();
        let ids = FxHashMap::default();
        let cx = write_cx(&forest, &ids);

        let cases: Vec<(FieldType, FieldValue)> = vec![
            (FieldType::Bool, FieldValue::Bool(true)),
            (FieldType::I8, FieldValue::I8(-3)),
            (FieldType::I16, FieldValue::I16(1000)),
            (FieldType::I32, FieldValue::I32(-1)),
            (FieldType::I64, FieldValue::I64(i64::MIN)),
            (FieldType::V64, FieldValue::I64(16384)),
            (FieldType::V64, FieldValue::I64(-1)),
            (FieldType::F32, FieldValue::F32(3.5)),
            (FieldType::F64, FieldValue::F64(-0.25)),
            (FieldType::ConstantI32(42), FieldValue::I32(42)),
            (FieldType::Reference(0), FieldValue::Null),
            (FieldType::Annotation, FieldValue::Null),
            (
                FieldType::List(Box::new(FieldType::I16)),
                FieldValue::List(vec![FieldValue::I16(1), FieldValue::I16(2)]),
            ),
            (
                FieldType::Map(Box::new(FieldType::I8), Box::new(FieldType::V64)),
                FieldValue::Map(vec![(FieldValue::I8(1), FieldValue::I64(300))]),
            ),
            (FieldType::Map(Box::new(FieldType::I8), Box::new(FieldType::I8)), FieldValue::Null),
        ];

        for (ft, v) in cases {
            let mut out = OutBuffer::new();
            ft.write(&v, &mut out, &cx).unwrap();
            assert_eq!(
                out.len() as u64,
                ft.offset(&v, &cx).unwrap(),
                "offset mismatch for {ft} / {v:?}"
            );
        }
    }

    /// a null reference is the single byte 0x00
    #[test]
    fn null_reference_is_one_zero_byte() {
        let forest = TypeForest::new();
        let ids = FxHashMap::default();
        let cx = write_cx(&forest, &ids);

        let mut out = OutBuffer::new();
        FieldType::Reference(0)
            .write(&FieldValue::Null, &mut out, &cx)
            .unwrap();
        assert_eq!(out.as_slice(), &[0x00]);
    }

    #[test]
    fn constant_length_array_rejects_wrong_size() {
        let forest = TypeForest::new();
        let ids = FxHashMap::default();
        let cx = write_cx(&forest, &ids);

        let ft = FieldType::ConstantLengthArray {
            length: 3,
            ground: Box::new(FieldType::I8),
        };
        let bad = FieldValue::List(vec![FieldValue::I8(1)]);
        let mut out = OutBuffer::new();
        assert!(matches!(
            ft.write(&bad, &mut out, &cx),
            Err(Error::WrongArrayLength {
                expected: 3,
                actual: 1
            })
        ));
        assert!(ft.offset(&bad, &cx).is_err());
    }

    #[test]
    fn constants_consume_and_emit_nothing() {
        let forest = TypeForest::new();
        let input = FileInput::empty();
        let strings = StringPool::new(StdArc::new(input));
        let rcx = ReadContext {
            forest: &forest,
            strings: &strings,
        };

        let ft = FieldType::ConstantV64(0x5C11);
        let mut r = MapReader::new(&[]);
        assert_eq!(ft.read(&mut r, &rcx).unwrap(), FieldValue::I64(0x5C11));

        let ids = FxHashMap::default();
        let cx = write_cx(&forest, &ids);
        assert_eq!(ft.offset(&FieldValue::I64(0x5C11), &cx).unwrap(), 0);
    }

    #[test]
    fn container_roundtrip() {
        let forest = TypeForest::new();
        let input = FileInput::empty();
        let strings = StringPool::new(StdArc::new(input));
        let rcx = ReadContext {
            forest: &forest,
            strings: &strings,
        };
        let ids = FxHashMap::default();
        let cx = write_cx(&forest, &ids);

        let ft = FieldType::VariableLengthArray(Box::new(FieldType::V64));
        let v = FieldValue::List(vec![
            FieldValue::I64(0),
            FieldValue::I64(127),
            FieldValue::I64(128),
        ]);

        let mut out = OutBuffer::new();
        ft.write(&v, &mut out, &cx).unwrap();
        let bytes = out.into_vec();
        let mut r = MapReader::new(&bytes);
        assert_eq!(ft.read(&mut r, &rcx).unwrap(), v);
        assert!(r.eof());
    }
}
