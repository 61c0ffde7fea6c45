//! The state: one SKilL file materialized in memory.
//!
//! [`SkillState`] owns the string pool, the type forest and the mapped input,
//! and is the surface generated bindings (or reflective users) talk to:
//! pool and field creation, instance creation and deletion, value access, and
//! the two serialization modes.
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use skillrt::{FieldType, FieldValue, SkillState};
//!
//! let mut state = SkillState::create();
//! let node = state.make_base_pool("node")?;
//! let weight = state.add_field(node, "weight", FieldType::I32)?;
//!
//! let obj = state.make(node)?;
//! state.set(&obj, weight, FieldValue::I32(7))?;
//! state.write("graph.sf")?;
//!
//! let state = SkillState::open("graph.sf")?;
//! let node = state.pool_by_name("node").unwrap();
//! let weight = state.field_by_name(node, "weight").unwrap();
//! let obj = state.get_by_id(node, 1).unwrap();
//! assert_eq!(state.get(&obj, weight)?, FieldValue::I32(7));
//! # Ok::<(), skillrt::Error>(())
//! ```
//!
//! # Thread Safety
//!
//! All mutation goes through `&mut self`; the interior locks exist for the
//! two parallel phases (field decode and field write), which run over a
//! shared `&SkillState`.

pub(crate) mod appender;
pub(crate) mod parser;
pub(crate) mod ser;
pub(crate) mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fields::{FieldDeclaration, FieldRestriction, FieldStrategy};
use crate::fieldtypes::{FieldType, FieldValue, ReadContext};
use crate::objects::Obj;
use crate::pools::blocks::Chunk;
use crate::pools::iterators::{DynamicDataIterator, TypeHierarchyIterator, TypeOrderIterator};
use crate::pools::{Pool, PoolId, TypeForest};
use crate::streams::FileInput;
use crate::strings::StringPool;
use crate::{Error, Result};

/// Handle to one field of one pool.
///
/// Positive indices address serialized data fields, non-positive ones auto
/// fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldId {
    pub(crate) pool: PoolId,
    pub(crate) index: i32,
}

impl FieldId {
    /// The pool the field belongs to.
    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

/// A SKilL file materialized as a live object graph.
pub struct SkillState {
    pub(crate) path: Option<PathBuf>,
    pub(crate) input: Arc<FileInput>,
    pub(crate) strings: StringPool,
    pub(crate) forest: TypeForest,
}

impl SkillState {
    /// Read a SKilL file, decoding all field data eagerly and in parallel.
    ///
    /// # Errors
    /// Surfaces parse errors, chunk size mismatches and restriction
    /// violations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SkillState> {
        parser::read(path.as_ref(), FieldStrategy::Direct)
    }

    /// Read a SKilL file, materializing parsed fields with the given storage
    /// strategy. `Lazy` defers all field decoding to first access.
    ///
    /// # Errors
    /// Surfaces parse errors, chunk size mismatches and restriction
    /// violations.
    pub fn open_with_strategy<P: AsRef<Path>>(
        path: P,
        strategy: FieldStrategy,
    ) -> Result<SkillState> {
        parser::read(path.as_ref(), strategy)
    }

    /// Create an empty state with no backing file.
    #[must_use]
    pub fn create() -> SkillState {
        SkillState {
            path: None,
            input: Arc::new(FileInput::empty()),
            strings: StringPool::new(Arc::new(FileInput::empty())),
            forest: TypeForest::new(),
        }
    }

    /// The state's string pool.
    #[must_use]
    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    /// All pools in type ID order.
    pub fn types(&self) -> impl Iterator<Item = PoolId> {
        self.forest.ids()
    }

    /// Borrow a pool.
    #[must_use]
    pub fn pool(&self, pid: PoolId) -> &Pool {
        self.forest.pool(pid)
    }

    /// Look a pool up by its type name.
    #[must_use]
    pub fn pool_by_name(&self, name: &str) -> Option<PoolId> {
        self.forest.by_name(name)
    }

    /// Create a new base pool.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the name is taken.
    pub fn make_base_pool(&mut self, name: &str) -> Result<PoolId> {
        let name = self.strings.add(name);
        self.forest.make_pool(name, None)
    }

    /// Create a new subpool of `super_pool`.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the name is taken.
    pub fn make_sub_pool(&mut self, super_pool: PoolId, name: &str) -> Result<PoolId> {
        let name = self.strings.add(name);
        self.forest.make_pool(name, Some(super_pool))
    }

    /// Add a serialized field with direct (column) storage.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the field name is taken.
    pub fn add_field(&mut self, pid: PoolId, name: &str, ft: FieldType) -> Result<FieldId> {
        self.add_field_with(pid, name, ft, FieldStrategy::Direct)
    }

    /// Add a serialized field with an explicit storage strategy.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the field name is taken.
    pub fn add_field_with(
        &mut self,
        pid: PoolId,
        name: &str,
        ft: FieldType,
        strategy: FieldStrategy,
    ) -> Result<FieldId> {
        let name = self.strings.add(name);
        let index = self.forest.add_field(pid, name, ft, strategy)?;
        Ok(FieldId { pool: pid, index })
    }

    /// Add a field known to a generated binding: direct storage plus its
    /// restriction set.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the field name is taken.
    pub fn add_known_field(
        &mut self,
        pid: PoolId,
        name: &str,
        ft: FieldType,
        restrictions: Vec<FieldRestriction>,
    ) -> Result<FieldId> {
        let fid = self.add_field(pid, name, ft)?;
        for r in restrictions {
            self.add_restriction(fid, r)?;
        }
        Ok(fid)
    }

    /// Add an auto field; never serialized.
    pub fn add_auto_field(&mut self, pid: PoolId, name: &str, ft: FieldType) -> FieldId {
        let name = self.strings.add(name);
        let index = self.forest.add_auto_field(pid, name, ft);
        FieldId { pool: pid, index }
    }

    /// Attach a restriction to a field.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] for a dangling field handle.
    pub fn add_restriction(&mut self, fid: FieldId, r: FieldRestriction) -> Result<()> {
        let decl = self.field_decl_mut(fid)?;
        decl.add_restriction(r);
        Ok(())
    }

    /// Find a data field by name on `pid` or its superpools.
    #[must_use]
    pub fn field_by_name(&self, pid: PoolId, name: &str) -> Option<FieldId> {
        let mut current = Some(pid);
        while let Some(p) = current {
            if let Some(fi) = self.forest.field_index_by_name(p, name) {
                return Some(FieldId {
                    pool: p,
                    index: fi as i32 + 1,
                });
            }
            current = self.forest.pool(p).super_pool();
        }
        None
    }

    /// Handles of all data fields declared directly on `pid`.
    #[must_use]
    pub fn fields_of(&self, pid: PoolId) -> Vec<FieldId> {
        (0..self.forest.pool(pid).data_fields().len())
            .map(|fi| FieldId {
                pool: pid,
                index: fi as i32 + 1,
            })
            .collect()
    }

    /// Number of non-deleted instances of `pid` including subtypes.
    #[must_use]
    pub fn size(&self, pid: PoolId) -> usize {
        self.forest.size(pid)
    }

    /// Number of instances with dynamic type exactly `pid`, including
    /// deleted ones.
    #[must_use]
    pub fn static_size(&self, pid: PoolId) -> usize {
        self.forest.pool(pid).static_size()
    }

    /// O(1) ID lookup; `None` for out-of-range IDs.
    #[must_use]
    pub fn get_by_id(&self, pid: PoolId, id: i64) -> Option<Obj> {
        self.forest.get_by_id(pid, id)
    }

    /// Create and register a default-initialized instance of `pid`.
    ///
    /// # Errors
    /// Returns [`Error::PoolFixed`] while the pool is fixed.
    pub fn make(&mut self, pid: PoolId) -> Result<Obj> {
        self.forest.make(pid)
    }

    /// Register an instance created elsewhere in this state.
    ///
    /// # Errors
    /// Returns [`Error::PoolFixed`] while the pool is fixed.
    pub fn add(&mut self, pid: PoolId, obj: Obj) -> Result<()> {
        self.forest.add(pid, obj)
    }

    /// Mark an object deleted; idempotent. The slot is reclaimed by the next
    /// full rewrite.
    pub fn delete(&mut self, obj: &Obj) {
        self.forest.delete(obj);
    }

    /// Reserve capacity for `n` additional new objects on `pid`.
    pub fn hint_new_objects_size(&mut self, pid: PoolId, n: usize) {
        self.forest.hint_new_objects_size(pid, n);
    }

    /// Instances of `pid` including subtypes: file blocks, then new objects.
    ///
    /// Deleted instances are yielded; filter with
    /// [`SkillObject::is_deleted`](crate::SkillObject::is_deleted).
    #[must_use]
    pub fn iter(&self, pid: PoolId) -> DynamicDataIterator<'_> {
        DynamicDataIterator::new(&self.forest, pid)
    }

    /// Instances of `pid` grouped by dynamic type in weak type order.
    #[must_use]
    pub fn type_order_iter(&self, pid: PoolId) -> TypeOrderIterator<'_> {
        TypeOrderIterator::new(&self.forest, pid)
    }

    /// Pools of `pid`'s subtree in weak type order.
    #[must_use]
    pub fn hierarchy(&self, pid: PoolId) -> TypeHierarchyIterator<'_> {
        TypeHierarchyIterator::new(&self.forest, pid)
    }

    pub(crate) fn field_decl(&self, fid: FieldId) -> Result<&FieldDeclaration> {
        let pool = self.forest.pool(fid.pool);
        let decl = if fid.index > 0 {
            pool.data_fields().get(fid.index as usize - 1)
        } else {
            pool.auto_fields().get((-fid.index) as usize)
        };
        decl.ok_or_else(|| Error::Internal(format!("dangling field handle {fid:?}")))
    }

    fn field_decl_mut(&mut self, fid: FieldId) -> Result<&mut FieldDeclaration> {
        let pool = self.forest.pool_mut(fid.pool);
        let decl = if fid.index > 0 {
            pool.data_fields.get_mut(fid.index as usize - 1)
        } else {
            pool.auto_fields.get_mut((-fid.index) as usize)
        };
        decl.ok_or_else(|| Error::Internal(format!("dangling field handle {fid:?}")))
    }

    /// Force decoding of a lazy field's chunks.
    ///
    /// # Errors
    /// Surfaces decode errors of the deferred chunks.
    pub fn ensure_loaded(&self, fid: FieldId) -> Result<()> {
        let decl = self.field_decl(fid)?;
        if !decl.is_lazy() || decl.is_loaded() {
            return Ok(());
        }
        let mut storage = decl.storage()?;
        if decl.is_loaded() {
            return Ok(());
        }

        let base = self.forest.base_data_of(decl.owner());
        let cx = ReadContext {
            forest: &self.forest,
            strings: &self.strings,
        };
        let blocks = self.forest.pool(decl.owner()).blocks();
        for chunk in &decl.data_chunks {
            if chunk.begin() == 0 && chunk.end() == 0 {
                // bookkeeping chunk without file backing
                continue;
            }
            let mut r = self.input.map(chunk.begin(), chunk.end())?;
            match *chunk {
                Chunk::Simple { bpo, count, .. } => crate::fields::read_simple_chunk(
                    decl,
                    base,
                    &mut storage,
                    bpo,
                    bpo + count,
                    &mut r,
                    &cx,
                )?,
                Chunk::Bulk { block_count, .. } => crate::fields::read_bulk_chunk(
                    decl,
                    base,
                    &mut storage,
                    blocks,
                    block_count,
                    &mut r,
                    &cx,
                )?,
            }
        }
        decl.mark_loaded();
        Ok(())
    }

    /// Read a field value of `obj`.
    ///
    /// Unset values read as [`FieldValue::Null`]; lazy fields decode on
    /// first access.
    ///
    /// # Errors
    /// Surfaces lazy decode errors and poisoned locks.
    pub fn get(&self, obj: &Obj, fid: FieldId) -> Result<FieldValue> {
        self.ensure_loaded(fid)?;
        let decl = self.field_decl(fid)?;
        Ok(decl.storage()?.get(obj))
    }

    /// Store a field value of `obj`.
    ///
    /// # Errors
    /// Surfaces lazy decode errors and poisoned locks.
    pub fn set(&mut self, obj: &Obj, fid: FieldId, v: FieldValue) -> Result<()> {
        self.ensure_loaded(fid)?;
        let decl = self.field_decl(fid)?;
        decl.storage()?.set(obj, v);
        Ok(())
    }

    /// Run every field restriction over all non-deleted instances.
    ///
    /// # Errors
    /// Returns [`Error::RestrictionViolation`] on the first failing check.
    pub fn check(&self) -> Result<()> {
        for pid in self.forest.ids() {
            let pool = self.forest.pool(pid);
            for decl in pool.data_fields().iter().chain(pool.auto_fields()) {
                if decl.restrictions.is_empty() {
                    continue;
                }
                if decl.index() > 0 {
                    self.ensure_loaded(FieldId {
                        pool: pid,
                        index: decl.index(),
                    })?;
                }
                let storage = decl.storage()?;
                for obj in DynamicDataIterator::new(&self.forest, pid) {
                    if obj.is_deleted() {
                        continue;
                    }
                    let v = storage.get(&obj);
                    for r in &decl.restrictions {
                        r.check(&v).map_err(|reason| Error::RestrictionViolation {
                            field: decl.name().to_string(),
                            reason,
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize the full state to `path`: reissues dense IDs, drops deleted
    /// instances, and rewrites everything. The state's backing file becomes
    /// `path`.
    ///
    /// # Errors
    /// Surfaces restriction violations, offset/write mismatches and I/O
    /// failures.
    pub fn write<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        writer::write(self, path.as_ref())?;
        self.path = Some(path.as_ref().to_path_buf());
        Ok(())
    }

    /// Append all changes since the last flush to the backing file. Existing
    /// string IDs and object IDs are preserved.
    ///
    /// # Errors
    /// Returns [`Error::NoBackingFile`] for states without one, and
    /// surfaces restriction violations and I/O failures.
    pub fn append(&mut self) -> Result<()> {
        appender::append(self)
    }

    /// Flush and drop the state.
    ///
    /// # Errors
    /// Currently infallible; kept fallible for parity with the stream layer.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
