//! Instances of user types.
//!
//! Every object is a [`SkillObject`]: a stable identity carrying its pool
//! membership and a mutable ID. Field values are held by the owning field
//! declarations, keyed either by base-array position or by object identity,
//! so an object itself stays small and cheap to share across the graph.
//!
//! The ID encodes the lifecycle: `-1` for objects created in memory and not
//! yet flushed, `0` for deleted objects, and `n > 0` for objects inside a
//! file, where `n - 1` is the object's index into its base pool's backing
//! array.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::pools::PoolId;

/// ID of an object that has been created but not yet written.
pub const ID_UNASSIGNED: i64 = -1;
/// ID of a deleted object.
pub const ID_DELETED: i64 = 0;

/// The root representation of instances of user types.
///
/// Objects are shared by [`Obj`] handles; references between objects are
/// plain handle clones, so cyclic graphs need no special treatment. The ID is
/// atomic because write tasks read it concurrently while encoding reference
/// fields.
pub struct SkillObject {
    id: AtomicI64,
    pool: PoolId,
}

/// Shared handle to a [`SkillObject`].
pub type Obj = Arc<SkillObject>;

impl SkillObject {
    /// Create an object with the given ID belonging to `pool`.
    #[must_use]
    pub(crate) fn new(id: i64, pool: PoolId) -> Obj {
        Arc::new(SkillObject {
            id: AtomicI64::new(id),
            pool,
        })
    }

    /// The object's current ID; index+1 into the base array when live.
    #[must_use]
    pub fn skill_id(&self) -> i64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_skill_id(&self, id: i64) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Whether the object has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.skill_id() == ID_DELETED
    }

    /// Whether the object was created in memory and has no ID yet.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.skill_id() == ID_UNASSIGNED
    }

    /// The pool holding this object's dynamic type.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

impl fmt::Debug for SkillObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SkillObject(pool: {:?}, id: {})",
            self.pool,
            self.skill_id()
        )
    }
}

/// Identity key for object-keyed field storage.
///
/// Hashes and compares by handle identity, not by content, matching the
/// semantics of distributed field maps.
#[derive(Clone)]
pub struct ObjKey(pub Obj);

impl ObjKey {
    /// Borrow the underlying handle.
    #[must_use]
    pub fn object(&self) -> &Obj {
        &self.0
    }
}

impl PartialEq for ObjKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjKey {}

impl Hash for ObjKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn lifecycle_flags() {
        let o = SkillObject::new(ID_UNASSIGNED, PoolId(0));
        assert!(o.is_unassigned());
        assert!(!o.is_deleted());

        o.set_skill_id(3);
        assert_eq!(o.skill_id(), 3);

        o.set_skill_id(ID_DELETED);
        assert!(o.is_deleted());
    }

    #[test]
    fn keys_compare_by_identity() {
        let a = SkillObject::new(1, PoolId(0));
        let b = SkillObject::new(1, PoolId(0));

        let mut map: FxHashMap<ObjKey, i32> = FxHashMap::default();
        map.insert(ObjKey(a.clone()), 10);
        map.insert(ObjKey(b.clone()), 20);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&ObjKey(a)], 10);
        assert_eq!(map[&ObjKey(b)], 20);
    }
}
