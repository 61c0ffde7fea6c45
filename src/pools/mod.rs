//! Storage pools and the type forest.
//!
//! A [`Pool`] holds all instances of one user type. Pools of one type
//! hierarchy share a single contiguous backing array owned by the hierarchy's
//! base pool; an object's ID is its index+1 into that array, which makes
//! ID→object lookup O(1). Subpools reference their base by index, never by
//! pointer, so the forest is a plain vector.
//!
//! The forest also maintains the *weak type order*: a depth-first pre-order
//! linearization of each hierarchy through the `next_pool` links. File
//! layout, iteration order and ID assignment during a full rewrite all follow
//! this order.
//!
//! Two bookkeeping transitions mirror the two serialization modes: a full
//! rewrite reissues dense IDs, drops deleted instances and collapses each
//! pool's block list to a single block; an append adds one block per affected
//! pool and produces the chunk list the write pipeline works off.

pub mod blocks;
pub mod iterators;

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use crate::fields::{FieldDeclaration, FieldStrategy};
use crate::fieldtypes::FieldType;
use crate::objects::{Obj, SkillObject, ID_UNASSIGNED};
use crate::{Error, Result};

use blocks::{Block, Chunk};

/// Index of a pool within its state's type forest.
///
/// The pool's SKilL type ID is `32 + index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) usize);

impl PoolId {
    /// The SKilL type ID of this pool.
    #[must_use]
    pub fn type_id(&self) -> i64 {
        32 + self.0 as i64
    }
}

/// Key of a field within the shared chunk map: pool index and data-field
/// index.
pub(crate) type FieldKey = (usize, usize);

/// The container for all instances of a single user type.
pub struct Pool {
    name: Arc<str>,
    super_pool: Option<PoolId>,
    base_pool: PoolId,
    type_hierarchy_height: u32,
    next_pool: Option<PoolId>,
    /// Backing array of the whole hierarchy; populated on base pools only.
    pub(crate) data: Vec<Obj>,
    /// This pool's slice of every file block it appears in.
    pub(crate) blocks: Vec<Block>,
    /// Serialized fields, at index `field.index() - 1`.
    pub(crate) data_fields: Vec<FieldDeclaration>,
    /// Auto fields, at index `-field.index()`; never serialized.
    pub(crate) auto_fields: Vec<FieldDeclaration>,
    /// Instances created in memory since the last flush.
    pub(crate) new_objects: Vec<Obj>,
    /// Non-new instances whose dynamic type is exactly this pool's type.
    pub(crate) static_data_instances: usize,
    pub(crate) deleted_count: usize,
    fixed: bool,
    pub(crate) cached_size: usize,
}

impl Pool {
    /// The pool's interned type name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The direct super pool, if this is not a base pool.
    #[must_use]
    pub fn super_pool(&self) -> Option<PoolId> {
        self.super_pool
    }

    /// The base pool of this hierarchy; the pool itself if it is a base.
    #[must_use]
    pub fn base_pool(&self) -> PoolId {
        self.base_pool
    }

    /// Distance to the base pool; 0 for base pools.
    #[must_use]
    pub fn type_hierarchy_height(&self) -> u32 {
        self.type_hierarchy_height
    }

    /// Next pool in weak type order, if any.
    #[must_use]
    pub fn next_pool(&self) -> Option<PoolId> {
        self.next_pool
    }

    /// Number of instances with dynamic type exactly this pool's type,
    /// including deleted ones.
    #[must_use]
    pub fn static_size(&self) -> usize {
        self.static_data_instances + self.new_objects.len()
    }

    /// Whether the pool is currently fixed.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// The pool's block list.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The pool's serialized fields.
    #[must_use]
    pub fn data_fields(&self) -> &[FieldDeclaration] {
        &self.data_fields
    }

    /// The pool's auto fields.
    #[must_use]
    pub fn auto_fields(&self) -> &[FieldDeclaration] {
        &self.auto_fields
    }

    fn last_block(&self) -> Option<Block> {
        self.blocks.last().copied()
    }
}

/// All pools of one state, in creation (= type ID) order.
#[derive(Default)]
pub struct TypeForest {
    pub(crate) pools: Vec<Pool>,
    by_name: FxHashMap<Arc<str>, PoolId>,
}

impl TypeForest {
    /// Create an empty forest.
    #[must_use]
    pub fn new() -> TypeForest {
        TypeForest::default()
    }

    /// Number of pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns true if the forest holds no pools.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// All pool IDs in type ID order.
    pub fn ids(&self) -> impl Iterator<Item = PoolId> {
        (0..self.pools.len()).map(PoolId)
    }

    /// Borrow a pool.
    #[must_use]
    pub fn pool(&self, pid: PoolId) -> &Pool {
        &self.pools[pid.0]
    }

    pub(crate) fn pool_mut(&mut self, pid: PoolId) -> &mut Pool {
        &mut self.pools[pid.0]
    }

    /// Look a pool up by its type name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<PoolId> {
        self.by_name.get(name).copied()
    }

    /// The backing array of `pid`'s hierarchy.
    #[must_use]
    pub fn base_data_of(&self, pid: PoolId) -> &[Obj] {
        let base = self.pools[pid.0].base_pool;
        &self.pools[base.0].data
    }

    /// Create a pool. `super_pool` must already exist; `None` creates a new
    /// base pool.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the name is already taken.
    pub fn make_pool(&mut self, name: Arc<str>, super_pool: Option<PoolId>) -> Result<PoolId> {
        if self.by_name.contains_key(&name) {
            return Err(Error::Internal(format!("type '{name}' already exists")));
        }
        let pid = PoolId(self.pools.len());
        let (base_pool, type_hierarchy_height) = match super_pool {
            None => (pid, 0),
            Some(sp) => {
                let parent = &self.pools[sp.0];
                (parent.base_pool, parent.type_hierarchy_height + 1)
            }
        };
        self.pools.push(Pool {
            name: name.clone(),
            super_pool,
            base_pool,
            type_hierarchy_height,
            next_pool: None,
            data: Vec::new(),
            blocks: Vec::new(),
            data_fields: Vec::new(),
            auto_fields: Vec::new(),
            new_objects: Vec::new(),
            static_data_instances: 0,
            deleted_count: 0,
            fixed: false,
            cached_size: 0,
        });
        self.by_name.insert(name, pid);
        self.establish_type_order();
        Ok(pid)
    }

    /// Rebuild the `next_pool` links so iteration follows depth-first
    /// pre-order within each hierarchy.
    ///
    /// Walks the pool list in reverse once, splicing each subpool into its
    /// parent's chain while tracking the last unlinked descendant per pool.
    pub fn establish_type_order(&mut self) {
        let n = self.pools.len();
        for p in &mut self.pools {
            p.next_pool = None;
        }

        let mut last: Vec<Option<usize>> = vec![None; n];
        for i in (0..n).rev() {
            let Some(parent) = self.pools[i].super_pool else {
                // base pools are linked by their subpools
                continue;
            };
            let p = parent.0;

            if last[i].is_none() {
                last[i] = Some(i);
            }

            match self.pools[p].next_pool {
                None => last[p] = last[i],
                Some(pn) => {
                    let l = last[i].expect("descendant tracked above");
                    self.pools[l].next_pool = Some(pn);
                }
            }
            self.pools[p].next_pool = Some(PoolId(i));
        }
    }

    /// Pool indices of `pid`'s subtree in weak type order, starting with
    /// `pid` itself.
    #[must_use]
    pub(crate) fn hierarchy_ids(&self, pid: PoolId) -> Vec<usize> {
        let mut out = vec![pid.0];
        let height = self.pools[pid.0].type_hierarchy_height;
        let mut cur = self.pools[pid.0].next_pool;
        while let Some(next) = cur {
            if self.pools[next.0].type_hierarchy_height <= height {
                break;
            }
            out.push(next.0);
            cur = self.pools[next.0].next_pool;
        }
        out
    }

    /// Number of non-deleted instances of `pid` and all its subtypes.
    ///
    /// O(1) while the pool is fixed, otherwise linear in the number of
    /// subtypes.
    #[must_use]
    pub fn size(&self, pid: PoolId) -> usize {
        let pool = &self.pools[pid.0];
        if pool.fixed {
            return pool.cached_size;
        }
        self.hierarchy_ids(pid)
            .iter()
            .map(|&i| self.pools[i].static_size() - self.pools[i].deleted_count)
            .sum()
    }

    /// Number of instances created in memory in `pid`'s subtree.
    #[must_use]
    pub(crate) fn new_dynamic_instances_size(&self, pid: PoolId) -> usize {
        self.hierarchy_ids(pid)
            .iter()
            .map(|&i| self.pools[i].new_objects.len())
            .sum()
    }

    /// O(1) lookup of the instance with the given ID.
    ///
    /// Returns `None` for IDs outside the backing array; no subtree
    /// membership check is performed.
    #[must_use]
    pub fn get_by_id(&self, pid: PoolId, id: i64) -> Option<Obj> {
        let data = self.base_data_of(pid);
        let index = id - 1;
        if index < 0 || index as usize >= data.len() {
            return None;
        }
        Some(data[index as usize].clone())
    }

    /// Register an instance created in memory.
    ///
    /// # Errors
    /// Returns [`Error::PoolFixed`] while the pool is fixed.
    pub fn add(&mut self, pid: PoolId, obj: Obj) -> Result<()> {
        let pool = &mut self.pools[pid.0];
        if pool.fixed {
            return Err(Error::PoolFixed(pool.name.to_string()));
        }
        pool.new_objects.push(obj);
        Ok(())
    }

    /// Create and register a default-initialized instance.
    ///
    /// # Errors
    /// Returns [`Error::PoolFixed`] while the pool is fixed.
    pub fn make(&mut self, pid: PoolId) -> Result<Obj> {
        let obj = SkillObject::new(ID_UNASSIGNED, pid);
        self.add(pid, obj.clone())?;
        Ok(obj)
    }

    /// Mark an object deleted. Idempotent; the object keeps its slot in the
    /// backing array until the next full rewrite.
    pub fn delete(&mut self, obj: &Obj) {
        if !obj.is_deleted() {
            obj.set_skill_id(0);
            self.pools[obj.pool().0].deleted_count += 1;
        }
    }

    /// Reserve capacity for `n` additional new objects.
    pub fn hint_new_objects_size(&mut self, pid: PoolId, n: usize) {
        self.pools[pid.0].new_objects.reserve(n);
    }

    /// Create a serialized field on `pid` and return its declaration index.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the field name is already taken.
    pub fn add_field(
        &mut self,
        pid: PoolId,
        name: Arc<str>,
        field_type: FieldType,
        strategy: FieldStrategy,
    ) -> Result<i32> {
        if self.field_index_by_name(pid, &name).is_some() {
            return Err(Error::Internal(format!(
                "field '{name}' already exists on '{}'",
                self.pools[pid.0].name
            )));
        }
        let base_len = self.base_data_of(pid).len();
        let pool = &mut self.pools[pid.0];
        let index = pool.data_fields.len() as i32 + 1;
        pool.data_fields.push(FieldDeclaration::new(
            field_type, name, index, pid, strategy, base_len,
        ));
        Ok(index)
    }

    /// Create an auto field on `pid` and return its (non-positive)
    /// declaration index.
    pub fn add_auto_field(&mut self, pid: PoolId, name: Arc<str>, field_type: FieldType) -> i32 {
        let pool = &mut self.pools[pid.0];
        let index = -(pool.auto_fields.len() as i32);
        pool.auto_fields.push(FieldDeclaration::new(
            field_type,
            name,
            index,
            pid,
            FieldStrategy::Distributed,
            0,
        ));
        index
    }

    /// Index into `data_fields` of the field named `name`, if present.
    #[must_use]
    pub fn field_index_by_name(&self, pid: PoolId, name: &str) -> Option<usize> {
        self.pools[pid.0]
            .data_fields
            .iter()
            .position(|f| &**f.name() == name)
    }

    /// Fix every pool: cache sizes net of deletions and propagate them up
    /// the hierarchy. While fixed, pools reject structural mutation.
    pub fn fix(&mut self) {
        for p in &mut self.pools {
            p.cached_size = p.static_size() - p.deleted_count;
            p.fixed = true;
        }
        // children first, so parents see cached subtree sizes
        for i in (0..self.pools.len()).rev() {
            if let Some(sp) = self.pools[i].super_pool {
                let c = self.pools[i].cached_size;
                self.pools[sp.0].cached_size += c;
            }
        }
    }

    /// Clear the fixed flag on every pool.
    pub fn unfix(&mut self) {
        for p in &mut self.pools {
            p.fixed = false;
        }
    }

    /// Fill freshly allocated base-array slots of `pid`'s latest block with
    /// default instances.
    pub(crate) fn allocate_instances(&mut self, pid: PoolId) {
        let Some(block) = self.pools[pid.0].last_block() else {
            return;
        };
        let base = self.pools[pid.0].base_pool;
        for i in block.bpo..block.bpo + block.static_count {
            self.pools[base.0].data[i] = SkillObject::new(i as i64 + 1, pid);
        }
        self.pools[pid.0].static_data_instances += block.static_count;
    }

    /// Reissue dense IDs for a full rewrite.
    ///
    /// Rebuilds every base array in weak type order, skipping deleted
    /// instances, remaps direct field columns into the new order and returns
    /// the base-pool offset of each pool's dynamic region.
    ///
    /// Must run on fixed pools; objects keep their old IDs until all field
    /// storage is remapped.
    pub(crate) fn compress_ids(&mut self) -> Result<Vec<usize>> {
        let n = self.pools.len();
        let mut lbpo = vec![0usize; n];
        let bases: Vec<usize> = (0..n)
            .filter(|&i| self.pools[i].super_pool.is_none())
            .collect();

        for b in bases {
            let hier = self.hierarchy_ids(PoolId(b));
            let mut order: Vec<Obj> = Vec::with_capacity(self.pools[b].cached_size);
            for &pid in &hier {
                lbpo[pid] = order.len();
                let blocks = self.pools[pid].blocks.clone();
                for blk in blocks {
                    for i in blk.bpo..blk.bpo + blk.static_count {
                        let o = self.pools[b].data[i].clone();
                        if !o.is_deleted() {
                            order.push(o);
                        }
                    }
                }
                for o in &self.pools[pid].new_objects {
                    if !o.is_deleted() {
                        order.push(o.clone());
                    }
                }
            }

            // remap columns while objects still carry their old IDs
            for &pid in &hier {
                for f in &self.pools[pid].data_fields {
                    f.storage()?.remap(&order);
                }
            }

            for (i, o) in order.iter().enumerate() {
                o.set_skill_id(i as i64 + 1);
            }
            self.pools[b].data = order;
        }
        Ok(lbpo)
    }

    /// Post-write bookkeeping of a full rewrite: absorb new objects, drop
    /// deletion counters and collapse the block list to a single block.
    pub(crate) fn commit_compress(&mut self, lbpo: &[usize]) {
        for i in 0..self.pools.len() {
            let pool = &mut self.pools[i];
            pool.static_data_instances =
                pool.static_data_instances + pool.new_objects.len() - pool.deleted_count;
            pool.deleted_count = 0;
            pool.new_objects.clear();
            pool.blocks.clear();
            pool.blocks
                .push(Block::new(lbpo[i], pool.cached_size, pool.static_data_instances));
        }
    }

    /// Extend every base array with the new instances of its hierarchy in
    /// weak type order and assign their IDs; grows direct columns
    /// accordingly. Returns the base-array offset of each pool's new region.
    pub(crate) fn prepare_append_ids(&mut self) -> Result<Vec<usize>> {
        let n = self.pools.len();
        let mut lbpo = vec![0usize; n];
        let bases: Vec<usize> = (0..n)
            .filter(|&i| self.pools[i].super_pool.is_none())
            .collect();

        for b in bases {
            let hier = self.hierarchy_ids(PoolId(b));
            let old_len = self.pools[b].data.len();

            let mut pos = old_len;
            for &pid in &hier {
                lbpo[pid] = pos;
                pos += self.pools[pid].new_objects.len();
            }

            let mut appended: Vec<Obj> = Vec::with_capacity(pos - old_len);
            for &pid in &hier {
                for o in &self.pools[pid].new_objects {
                    appended.push(o.clone());
                }
            }
            for (k, o) in appended.iter().enumerate() {
                if !o.is_deleted() {
                    o.set_skill_id((old_len + k) as i64 + 1);
                }
            }
            self.pools[b].data.extend(appended);
            let new_len = self.pools[b].data.len();

            for &pid in &hier {
                for f in &self.pools[pid].data_fields {
                    let mut storage = f.storage()?;
                    storage.resize_base(new_len);
                    storage.migrate_new();
                }
            }
        }
        Ok(lbpo)
    }

    /// Append-mode bookkeeping for one pool: add a block if the pool is new,
    /// gained instances or gained a field, and produce the chunks the write
    /// pipeline must emit. Chunks go into the shared `chunk_map`.
    ///
    /// Returns true if a block was added, i.e. the pool appears in the
    /// appended type section.
    pub(crate) fn prepare_append_block(
        &mut self,
        pid: PoolId,
        lbpo_map: &[usize],
        chunk_map: &DashMap<FieldKey, Chunk>,
    ) -> Result<bool> {
        let new_instances = self.new_dynamic_instances_size(pid) > 0;
        let lcount = self.new_dynamic_instances_size(pid);
        let total = self.size(pid);

        let pool = &mut self.pools[pid.0];
        let new_pool = pool.blocks.is_empty();
        let new_field = pool.data_fields.iter().any(|f| f.data_chunks.is_empty());

        let added = new_pool || new_instances || new_field;
        if added {
            let bpo = if lcount == 0 { 0 } else { lbpo_map[pid.0] };
            pool.blocks
                .push(Block::new(bpo, lcount, pool.new_objects.len()));
            let block_count = pool.blocks.len();
            pool.static_data_instances += pool.new_objects.len();

            if new_instances || !new_pool {
                for (fi, f) in pool.data_fields.iter_mut().enumerate() {
                    let chunk = if f.data_chunks.is_empty() && block_count != 1 {
                        Chunk::Bulk {
                            begin: 0,
                            end: 0,
                            count: total,
                            block_count,
                        }
                    } else if new_instances {
                        Chunk::Simple {
                            begin: 0,
                            end: 0,
                            bpo,
                            count: lcount,
                        }
                    } else {
                        continue;
                    };
                    f.data_chunks.push(chunk);
                    chunk_map.insert((pid.0, fi), chunk);
                }
            }
        }

        // new objects are regular objects by now
        pool.new_objects.clear();
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest_with_hierarchy() -> (TypeForest, PoolId, PoolId, PoolId, PoolId) {
        let mut forest = TypeForest::new();
        let a = forest.make_pool(Arc::from("a"), None).unwrap();
        let b = forest.make_pool(Arc::from("b"), Some(a)).unwrap();
        let c = forest.make_pool(Arc::from("c"), Some(a)).unwrap();
        let d = forest.make_pool(Arc::from("d"), Some(b)).unwrap();
        (forest, a, b, c, d)
    }

    #[test]
    fn type_order_is_depth_first_preorder() {
        let (forest, a, b, c, d) = forest_with_hierarchy();
        // a -> b -> d -> c
        assert_eq!(forest.pool(a).next_pool(), Some(b));
        assert_eq!(forest.pool(b).next_pool(), Some(d));
        assert_eq!(forest.pool(d).next_pool(), Some(c));
        assert_eq!(forest.pool(c).next_pool(), None);

        assert_eq!(forest.hierarchy_ids(a), vec![0, 1, 3, 2]);
        assert_eq!(forest.hierarchy_ids(b), vec![1, 3]);
        assert_eq!(forest.hierarchy_ids(c), vec![2]);
    }

    #[test]
    fn sizes_follow_the_hierarchy() {
        let (mut forest, a, b, _c, _d) = forest_with_hierarchy();
        forest.make(a).unwrap();
        forest.make(b).unwrap();
        forest.make(b).unwrap();

        assert_eq!(forest.size(a), 3);
        assert_eq!(forest.size(b), 2);
        assert_eq!(forest.pool(a).static_size(), 1);
        assert_eq!(forest.pool(b).static_size(), 2);
    }

    #[test]
    fn fix_is_idempotent() {
        let (mut forest, a, b, _c, _d) = forest_with_hierarchy();
        forest.make(a).unwrap();
        forest.make(b).unwrap();

        forest.fix();
        let first = forest.pool(a).cached_size;
        assert_eq!(first, 2);

        forest.fix();
        assert_eq!(forest.pool(a).cached_size, first);

        forest.unfix();
        forest.fix();
        assert_eq!(forest.pool(a).cached_size, first);
    }

    #[test]
    fn fixed_pools_reject_mutation() {
        let (mut forest, a, ..) = forest_with_hierarchy();
        forest.fix();
        assert!(matches!(forest.make(a), Err(Error::PoolFixed(_))));
        forest.unfix();
        assert!(forest.make(a).is_ok());
    }

    #[test]
    fn delete_is_idempotent_and_affects_size() {
        let (mut forest, a, ..) = forest_with_hierarchy();
        let o = forest.make(a).unwrap();
        forest.make(a).unwrap();

        forest.delete(&o);
        forest.delete(&o);
        assert_eq!(forest.pool(a).deleted_count, 1);
        assert_eq!(forest.size(a), 1);
    }

    #[test]
    fn get_by_id_checks_bounds() {
        let (mut forest, a, ..) = forest_with_hierarchy();
        forest.pool_mut(a).blocks.push(Block::new(0, 2, 2));
        forest.pool_mut(a).data = vec![
            SkillObject::new(1, a),
            SkillObject::new(2, a),
        ];

        assert_eq!(forest.get_by_id(a, 1).unwrap().skill_id(), 1);
        assert_eq!(forest.get_by_id(a, 2).unwrap().skill_id(), 2);
        assert!(forest.get_by_id(a, 0).is_none());
        assert!(forest.get_by_id(a, 3).is_none());
    }

    #[test]
    fn compress_reissues_dense_ids() {
        let (mut forest, a, b, _c, _d) = forest_with_hierarchy();
        // two file-backed instances of a, one deleted
        forest.pool_mut(a).blocks.push(Block::new(0, 2, 2));
        forest.pool_mut(a).data =
            vec![SkillObject::new(1, a), SkillObject::new(2, a)];
        forest.pool_mut(a).static_data_instances = 2;
        let doomed = forest.get_by_id(a, 2).unwrap();
        forest.delete(&doomed);
        // plus one new instance of b
        let fresh = forest.make(b).unwrap();

        forest.fix();
        let lbpo = forest.compress_ids().unwrap();
        forest.commit_compress(&lbpo);
        forest.unfix();

        assert_eq!(forest.base_data_of(a).len(), 2);
        assert_eq!(forest.get_by_id(a, 1).unwrap().skill_id(), 1);
        assert_eq!(fresh.skill_id(), 2);
        assert_eq!(lbpo[b.0], 1);
        assert_eq!(forest.pool(a).blocks().len(), 1);
        assert_eq!(forest.pool(a).blocks()[0].dynamic_count, 2);
        assert_eq!(forest.pool(a).blocks()[0].static_count, 1);
    }
}
