//! Field declarations and their storage strategies.
//!
//! A [`FieldDeclaration`] ties a name and a [`FieldType`] to an owning pool
//! and records where in the file its payload lives (the chunk list). Because
//! this runtime has no generated per-field code, values are held by one of
//! two generic strategies:
//!
//! - **direct** - a dense column indexed by base-array position, the default
//!   for fields materialized by the parser;
//! - **distributed** - identity-keyed maps routed on the object's ID, the
//!   strategy of on-demand fields.
//!
//! Lazy fields use distributed storage and defer chunk decoding until first
//! access; the serializer forces them before string collection.
//!
//! Storage sits behind a mutex so that the parallel decode and write phases
//! can run against a shared state; distinct fields never contend, and
//! multiple chunks of one field serialize on its lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::fieldtypes::{FieldType, FieldValue, ReadContext, WriteContext};
use crate::objects::{Obj, ObjKey, ID_UNASSIGNED};
use crate::pools::blocks::{Block, Chunk};
use crate::pools::PoolId;
use crate::streams::{MapReader, MapWriter};
use crate::{Error, Result};

/// How a field stores its values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldStrategy {
    /// Dense column indexed by base-array position.
    Direct,
    /// Identity-keyed maps; values move between the new and existing map on
    /// serialization.
    Distributed,
    /// Distributed storage whose chunks decode on first access.
    Lazy,
}

/// A predicate checked against every value of a field.
///
/// This is the hook point for the restriction catalogue; the two variants
/// here cover the common cases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldRestriction {
    /// The value must not be null.
    NonNull,
    /// Integer values must lie within the closed range.
    IntRange {
        /// Smallest allowed value
        min: i64,
        /// Largest allowed value
        max: i64,
    },
}

impl FieldRestriction {
    /// Check one value, describing the failure on rejection.
    ///
    /// # Errors
    /// Returns a human readable reason when the value is rejected.
    pub fn check(&self, v: &FieldValue) -> std::result::Result<(), String> {
        match self {
            FieldRestriction::NonNull => {
                if v.is_null() {
                    return Err("null value on non-null field".into());
                }
            }
            FieldRestriction::IntRange { min, max } => {
                if let Some(x) = v.as_i64() {
                    if x < *min || x > *max {
                        return Err(format!("{x} outside [{min}, {max}]"));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Value storage of one field.
pub(crate) enum FieldData {
    /// Dense column parallel to the base array plus a side map for objects
    /// without an ID.
    Direct {
        data: Vec<FieldValue>,
        new_data: FxHashMap<ObjKey, FieldValue>,
    },
    /// Identity-keyed maps for existing and new objects.
    Distributed {
        data: FxHashMap<ObjKey, FieldValue>,
        new_data: FxHashMap<ObjKey, FieldValue>,
    },
}

impl FieldData {
    fn for_strategy(strategy: FieldStrategy, base_len: usize) -> FieldData {
        match strategy {
            FieldStrategy::Direct => FieldData::Direct {
                data: vec![FieldValue::Null; base_len],
                new_data: FxHashMap::default(),
            },
            FieldStrategy::Distributed | FieldStrategy::Lazy => FieldData::Distributed {
                data: FxHashMap::default(),
                new_data: FxHashMap::default(),
            },
        }
    }

    /// Read the value of `obj`, routing by its ID.
    pub fn get(&self, obj: &Obj) -> FieldValue {
        let id = obj.skill_id();
        match self {
            FieldData::Direct { data, new_data } => {
                if id == ID_UNASSIGNED {
                    new_data.get(&ObjKey(obj.clone())).cloned().unwrap_or_default()
                } else if id > 0 {
                    data.get(id as usize - 1).cloned().unwrap_or_default()
                } else {
                    FieldValue::Null
                }
            }
            FieldData::Distributed { data, new_data } => {
                let key = ObjKey(obj.clone());
                let (first, second) = if id == ID_UNASSIGNED {
                    (new_data, data)
                } else {
                    (data, new_data)
                };
                first
                    .get(&key)
                    .or_else(|| second.get(&key))
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    /// Store the value of `obj`, routing by its ID.
    pub fn set(&mut self, obj: &Obj, v: FieldValue) {
        let id = obj.skill_id();
        match self {
            FieldData::Direct { data, new_data } => {
                if id > 0 && (id as usize) <= data.len() {
                    data[id as usize - 1] = v;
                } else {
                    new_data.insert(ObjKey(obj.clone()), v);
                }
            }
            FieldData::Distributed { data, new_data } => {
                let key = ObjKey(obj.clone());
                if id == ID_UNASSIGNED {
                    new_data.insert(key, v);
                } else {
                    data.insert(key, v);
                }
            }
        }
    }

    /// Store a decoded value for the object at `base_index`.
    pub fn store_decoded(&mut self, base_index: usize, obj: &Obj, v: FieldValue) {
        match self {
            FieldData::Direct { data, .. } => data[base_index] = v,
            FieldData::Distributed { data, .. } => {
                data.insert(ObjKey(obj.clone()), v);
            }
        }
    }

    /// Read the value for the object at `base_index` during offset and write
    /// phases.
    pub fn value_at(&self, base_index: usize, obj: &Obj) -> FieldValue {
        match self {
            FieldData::Direct { data, .. } => {
                data.get(base_index).cloned().unwrap_or_default()
            }
            FieldData::Distributed { data, .. } => {
                data.get(&ObjKey(obj.clone())).cloned().unwrap_or_default()
            }
        }
    }

    /// Grow the column to the base array's new length.
    pub fn resize_base(&mut self, len: usize) {
        if let FieldData::Direct { data, .. } = self {
            if data.len() < len {
                data.resize(len, FieldValue::Null);
            }
        }
    }

    /// Move values of freshly assigned objects into their final place.
    ///
    /// For direct storage the column must already be sized to the new base
    /// array; for distributed storage this is the `compress` merge of the new
    /// map into the existing one.
    pub fn migrate_new(&mut self) {
        match self {
            FieldData::Direct { data, new_data } => {
                for (key, v) in new_data.drain() {
                    let id = key.0.skill_id();
                    if id > 0 && (id as usize) <= data.len() {
                        data[id as usize - 1] = v;
                    }
                }
            }
            FieldData::Distributed { data, new_data } => {
                data.extend(new_data.drain());
            }
        }
    }

    /// Merge the new-object map of a distributed field into its main map;
    /// no-op for direct storage, whose migration needs assigned IDs.
    pub fn compress_distributed(&mut self) {
        if let FieldData::Distributed { data, new_data } = self {
            data.extend(new_data.drain());
        }
    }

    /// Rebuild the column in the order of the freshly compressed base array.
    ///
    /// Objects still carry their pre-compression IDs when this runs; `order`
    /// is the new base array.
    pub fn remap(&mut self, order: &[Obj]) {
        match self {
            FieldData::Direct { data, new_data } => {
                let old = std::mem::take(data);
                let mut fresh = Vec::with_capacity(order.len());
                for obj in order {
                    let id = obj.skill_id();
                    let v = if id > 0 {
                        old.get(id as usize - 1).cloned().unwrap_or_default()
                    } else {
                        new_data.remove(&ObjKey(obj.clone())).unwrap_or_default()
                    };
                    fresh.push(v);
                }
                *data = fresh;
                new_data.clear();
            }
            FieldData::Distributed { data, new_data } => {
                data.extend(new_data.drain());
            }
        }
    }
}

/// One field of a pool.
///
/// Data fields have `index > 0`; auto fields have `index <= 0`, carry no
/// serialized data and live in the owner's separate auto-field list.
pub struct FieldDeclaration {
    pub(crate) field_type: FieldType,
    name: Arc<str>,
    index: i32,
    owner: PoolId,
    /// Restrictions checked by [`SkillState::check`](crate::SkillState::check).
    pub(crate) restrictions: Vec<FieldRestriction>,
    /// File spans of this field's payload, one per block it has data in.
    pub(crate) data_chunks: Vec<Chunk>,
    pub(crate) storage: Mutex<FieldData>,
    lazy: bool,
    loaded: AtomicBool,
    refined: bool,
}

impl FieldDeclaration {
    pub(crate) fn new(
        field_type: FieldType,
        name: Arc<str>,
        index: i32,
        owner: PoolId,
        strategy: FieldStrategy,
        base_len: usize,
    ) -> FieldDeclaration {
        let lazy = strategy == FieldStrategy::Lazy;
        FieldDeclaration {
            field_type,
            name,
            index,
            owner,
            restrictions: Vec::new(),
            data_chunks: Vec::new(),
            storage: Mutex::new(FieldData::for_strategy(strategy, base_len)),
            lazy,
            loaded: AtomicBool::new(!lazy),
            refined: false,
        }
    }

    /// The field's interned name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The field's type.
    #[must_use]
    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    /// Declaration index; positive for data fields, ≤ 0 for auto fields.
    #[must_use]
    pub fn index(&self) -> i32 {
        self.index
    }

    /// The pool this field belongs to.
    #[must_use]
    pub fn owner(&self) -> PoolId {
        self.owner
    }

    /// Whether this field defers chunk decoding until first access.
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Whether all chunks of this field have been decoded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Attach a restriction to this field.
    pub fn add_restriction(&mut self, r: FieldRestriction) {
        self.restrictions.push(r);
    }

    /// Replace a placeholder type with the concrete one.
    ///
    /// A field's type may change exactly once, when the parser learns the
    /// concrete pool behind a forward reference; any further retyping is
    /// rejected.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the type was already refined.
    pub fn refine_type(&mut self, concrete: FieldType) -> Result<()> {
        if self.refined {
            return Err(Error::Internal(format!(
                "type of field '{}' was already refined",
                self.name
            )));
        }
        self.field_type = concrete;
        self.refined = true;
        Ok(())
    }

    pub(crate) fn storage(&self) -> Result<MutexGuard<'_, FieldData>> {
        self.storage.lock().map_err(|_| Error::LockFailed)
    }

    pub(crate) fn last_chunk(&self) -> Option<Chunk> {
        self.data_chunks.last().copied()
    }
}

/// Decode `field`'s payload for the instances at base indices
/// `[begin, end)`.
pub(crate) fn read_simple_chunk(
    field: &FieldDeclaration,
    base: &[Obj],
    storage: &mut FieldData,
    begin: usize,
    end: usize,
    r: &mut MapReader<'_>,
    cx: &ReadContext<'_>,
) -> Result<()> {
    if end > base.len() {
        return Err(malformed_error!(
            "chunk of field '{}' covers [{begin}, {end}) beyond base array of {}",
            field.name(),
            base.len()
        ));
    }
    for i in begin..end {
        let v = field.field_type.read(r, cx)?;
        storage.store_decoded(i, &base[i], v);
    }
    Ok(())
}

/// Decode `field`'s payload for the owner's first `block_count` blocks.
pub(crate) fn read_bulk_chunk(
    field: &FieldDeclaration,
    base: &[Obj],
    storage: &mut FieldData,
    blocks: &[Block],
    block_count: usize,
    r: &mut MapReader<'_>,
    cx: &ReadContext<'_>,
) -> Result<()> {
    for b in blocks.iter().take(block_count) {
        read_simple_chunk(field, base, storage, b.bpo, b.bpo + b.dynamic_count, r, cx)?;
    }
    Ok(())
}

/// Byte length of `field`'s payload for the instances at base indices
/// `[begin, end)`.
pub(crate) fn range_offset(
    field: &FieldDeclaration,
    base: &[Obj],
    storage: &FieldData,
    begin: usize,
    end: usize,
    cx: &WriteContext<'_>,
) -> Result<u64> {
    let mut sum = 0;
    for (i, obj) in base.iter().enumerate().take(end).skip(begin) {
        sum += field.field_type.offset(&storage.value_at(i, obj), cx)?;
    }
    Ok(sum)
}

/// Encode `field`'s payload for the instances at base indices `[begin, end)`.
pub(crate) fn write_range(
    field: &FieldDeclaration,
    base: &[Obj],
    storage: &FieldData,
    begin: usize,
    end: usize,
    w: &mut MapWriter<'_>,
    cx: &WriteContext<'_>,
) -> Result<()> {
    for (i, obj) in base.iter().enumerate().take(end).skip(begin) {
        field
            .field_type
            .write(&storage.value_at(i, obj), w, cx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::SkillObject;

    fn direct_field() -> FieldDeclaration {
        FieldDeclaration::new(
            FieldType::I32,
            Arc::from("x"),
            1,
            PoolId(0),
            FieldStrategy::Direct,
            2,
        )
    }

    #[test]
    fn direct_storage_routes_by_id() {
        let field = direct_field();
        let live = SkillObject::new(2, PoolId(0));
        let fresh = SkillObject::new(ID_UNASSIGNED, PoolId(0));

        let mut storage = field.storage().unwrap();
        storage.set(&live, FieldValue::I32(7));
        storage.set(&fresh, FieldValue::I32(9));

        assert_eq!(storage.get(&live), FieldValue::I32(7));
        assert_eq!(storage.get(&fresh), FieldValue::I32(9));

        // the column slot of the live object holds the value
        assert_eq!(storage.value_at(1, &live), FieldValue::I32(7));
    }

    #[test]
    fn remap_reorders_and_drops() {
        let field = direct_field();
        let a = SkillObject::new(1, PoolId(0));
        let b = SkillObject::new(2, PoolId(0));
        let fresh = SkillObject::new(ID_UNASSIGNED, PoolId(0));

        let mut storage = field.storage().unwrap();
        storage.set(&a, FieldValue::I32(10));
        storage.set(&b, FieldValue::I32(20));
        storage.set(&fresh, FieldValue::I32(30));

        // a is dropped, order becomes [b, fresh]
        storage.remap(&[b.clone(), fresh.clone()]);
        assert_eq!(storage.value_at(0, &b), FieldValue::I32(20));
        assert_eq!(storage.value_at(1, &fresh), FieldValue::I32(30));
    }

    #[test]
    fn restrictions_reject_and_accept() {
        let r = FieldRestriction::IntRange { min: 0, max: 10 };
        assert!(r.check(&FieldValue::I32(5)).is_ok());
        assert!(r.check(&FieldValue::I32(11)).is_err());
        assert!(FieldRestriction::NonNull.check(&FieldValue::Null).is_err());
    }

    #[test]
    fn refine_type_is_one_shot() {
        let mut field = direct_field();
        field.refine_type(FieldType::Reference(0)).unwrap();
        assert!(field.refine_type(FieldType::Reference(1)).is_err());
    }
}
