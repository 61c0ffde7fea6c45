//! Lazy, position-indexed string pool.
//!
//! Strings in a SKilL file are referenced by ID everywhere else in the file,
//! so the parser only records a position table `ID → (absolute offset,
//! length)` and defers the actual UTF-8 decode until somebody asks. The first
//! [`StringPool::get`] of an ID reads the bytes from the input, interns the
//! result and caches it; every later lookup is a map hit. ID 0 is reserved
//! for the null string.
//!
//! Because field decoding runs massively in parallel and string-typed fields
//! resolve IDs through this pool, `get` is callable from any worker: one
//! pool-wide mutex serializes the rare cache misses, which are disk-bound
//! anyway.
//!
//! On serialization the pool owns ID assignment: a full rewrite re-enumerates
//! every known string, an append keeps all previously assigned IDs and only
//! emits strings that never had one. Both emit the block format `v64 count`,
//! `count` big-endian i32 cumulative end offsets, then the concatenated UTF-8
//! runs.
//!
//! # Note
//!
//! `add` is O(1) and may duplicate a string that exists in the file but was
//! never materialized; this is the documented trade-off for lazy loading.

use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::streams::{BinaryOut, FileInput, OutBuffer};
use crate::{Error, Result};

/// The type ID strings carry in field declarations.
pub const STRING_TYPE_ID: i64 = 14;

struct Inner {
    /// ID ⇀ (absolute offset, length); entry 0 is a sentinel.
    positions: Vec<(u64, u32)>,
    /// ID ⇀ materialized string; entry 0 is the null string.
    id_map: Vec<Option<Arc<str>>>,
    /// Every string that was materialized or added.
    known: FxHashSet<Arc<str>>,
    /// String ⇀ ID, rebuilt by the serialization prepare phases.
    ids: FxHashMap<Arc<str>, i64>,
}

/// The string pool of one state.
pub struct StringPool {
    input: Arc<FileInput>,
    inner: Mutex<Inner>,
}

impl StringPool {
    /// Create the pool over the given input.
    #[must_use]
    pub fn new(input: Arc<FileInput>) -> StringPool {
        StringPool {
            input,
            inner: Mutex::new(Inner {
                positions: vec![(0, 0)],
                id_map: vec![None],
                known: FxHashSet::default(),
                ids: FxHashMap::default(),
            }),
        }
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::LockFailed)
    }

    /// Record the position of the next file-backed string.
    pub(crate) fn push_position(&self, offset: u64, length: u32) -> Result<()> {
        let mut inner = self.inner()?;
        inner.positions.push((offset, length));
        inner.id_map.push(None);
        Ok(())
    }

    /// Number of known strings.
    ///
    /// Strings that exist in the file but were never materialized are not
    /// counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner().map(|i| i.known.len()).unwrap_or(0)
    }

    /// Returns true if no string is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of IDs the pool can currently resolve, including ID 0.
    #[must_use]
    pub fn id_count(&self) -> usize {
        self.inner().map(|i| i.id_map.len()).unwrap_or(0)
    }

    /// Resolve a string ID.
    ///
    /// ID 0 resolves to `None`. The first lookup of a file-backed ID reads
    /// and interns the string; this is safe to call concurrently from the
    /// parallel field decoders.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPoolIndex`] for IDs outside the table and
    /// [`Error::Malformed`] for invalid UTF-8 content.
    pub fn get(&self, id: i64) -> Result<Option<Arc<str>>> {
        if id == 0 {
            return Ok(None);
        }

        let mut inner = self.inner()?;
        let index =
            usize::try_from(id).ok().filter(|&i| i < inner.id_map.len()).ok_or_else(|| {
                Error::InvalidPoolIndex {
                    index: id,
                    size: inner.id_map.len(),
                    pool: "string".into(),
                }
            })?;

        if let Some(s) = &inner.id_map[index] {
            return Ok(Some(s.clone()));
        }

        // load from the file under the pool mutex
        let (offset, length) = inner.positions[index];
        let bytes = self.input.read_at(offset, length as usize)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| malformed_error!("invalid UTF-8 in string {}", id))?;
        let interned: Arc<str> = match inner.known.get(text) {
            Some(existing) => existing.clone(),
            None => {
                let fresh: Arc<str> = Arc::from(text);
                inner.known.insert(fresh.clone());
                fresh
            }
        };
        inner.id_map[index] = Some(interned.clone());
        Ok(Some(interned))
    }

    /// Intern a string into the pool.
    ///
    /// Returns the interned handle; adding an already known string is a
    /// no-op returning the existing handle.
    pub fn add(&self, s: &str) -> Arc<str> {
        let mut inner = match self.inner() {
            Ok(inner) => inner,
            Err(_) => return Arc::from(s),
        };
        match inner.known.get(s) {
            Some(existing) => existing.clone(),
            None => {
                let fresh: Arc<str> = Arc::from(s);
                inner.known.insert(fresh.clone());
                fresh
            }
        }
    }

    /// The ID currently assigned to `s`, if the prepare phase assigned one.
    #[must_use]
    pub fn id_of(&self, s: &str) -> Option<i64> {
        self.inner().ok()?.ids.get(s).copied()
    }

    /// Snapshot of the string→ID map for the parallel write phase.
    pub(crate) fn ids_snapshot(&self) -> Result<FxHashMap<Arc<str>, i64>> {
        Ok(self.inner()?.ids.clone())
    }

    /// All known strings, in enumeration (= serialization) order.
    #[must_use]
    pub fn known_strings(&self) -> Vec<Arc<str>> {
        match self.inner() {
            Ok(inner) => {
                let mut all: Vec<Arc<str>> = inner.known.iter().cloned().collect();
                all.sort();
                all
            }
            Err(_) => Vec::new(),
        }
    }

    /// Drop all string IDs; invoked at begin and end of serialization.
    pub fn reset_ids(&self) {
        if let Ok(mut inner) = self.inner() {
            inner.ids.clear();
        }
    }

    fn write_block(out: &mut OutBuffer, todo: &[Arc<str>]) -> Result<()> {
        out.v64(todo.len() as i64)?;
        let mut end = 0u64;
        for s in todo {
            end += s.len() as u64;
            let end = i32::try_from(end)
                .map_err(|_| malformed_error!("string data exceeds block limit at {}", end))?;
            out.i32(end)?;
        }
        for s in todo {
            out.bytes(s.as_bytes())?;
        }
        Ok(())
    }

    /// Re-enumerate every known string and emit the full string block.
    ///
    /// Previously assigned IDs are discarded: ID 1 goes to the first string
    /// in enumeration order. Used by the full-rewrite path.
    ///
    /// # Errors
    /// Returns [`Error::LockFailed`] on a poisoned pool or
    /// [`Error::Malformed`] if the string data overflows the offset encoding.
    pub fn prepare_and_write(&self, out: &mut OutBuffer) -> Result<()> {
        let mut inner = self.inner()?;

        // prior IDs are no longer valid
        inner.ids.clear();
        inner.id_map.clear();
        inner.id_map.push(None);
        inner.positions.clear();
        inner.positions.push((0, 0));

        let mut todo: Vec<Arc<str>> = inner.known.iter().cloned().collect();
        todo.sort();
        for s in &todo {
            let id = inner.id_map.len() as i64;
            inner.ids.insert(s.clone(), id);
            inner.id_map.push(Some(s.clone()));
            inner.positions.push((0, 0));
        }
        drop(inner);

        Self::write_block(out, &todo)
    }

    /// Assign IDs to strings that have none yet and emit a string block
    /// containing only those.
    ///
    /// All previously assigned IDs are preserved, so references written by
    /// earlier blocks stay valid. Used by the append path.
    ///
    /// # Errors
    /// Returns [`Error::LockFailed`] on a poisoned pool or
    /// [`Error::Malformed`] if the string data overflows the offset encoding.
    pub fn prepare_and_append(&self, out: &mut OutBuffer) -> Result<()> {
        let mut inner = self.inner()?;

        // rebuild the inverse map from the existing ID assignment
        inner.ids.clear();
        for index in 1..inner.id_map.len() {
            if let Some(s) = inner.id_map[index].clone() {
                inner.ids.insert(s, index as i64);
            }
        }

        let mut todo: Vec<Arc<str>> = inner
            .known
            .iter()
            .filter(|s| !inner.ids.contains_key(*s))
            .cloned()
            .collect();
        todo.sort();
        for s in &todo {
            let id = inner.id_map.len() as i64;
            inner.ids.insert(s.clone(), id);
            inner.id_map.push(Some(s.clone()));
            inner.positions.push((0, 0));
        }
        drop(inner);

        Self::write_block(out, &todo)
    }
}
