//! Iteration over pools and instances.
//!
//! Three orders matter:
//!
//! - [`TypeHierarchyIterator`] walks a pool's subtree in weak type order;
//! - [`DynamicDataIterator`] yields a pool's instances including subtypes:
//!   the pool's file blocks first, then the new objects of the whole subtree;
//! - [`TypeOrderIterator`] yields instances grouped by dynamic type in weak
//!   type order, per pool existing instances before new ones. This is the
//!   order a full rewrite lays instances out in.
//!
//! Deleted instances are not filtered here; callers that must skip them check
//! [`SkillObject::is_deleted`](crate::objects::SkillObject::is_deleted).

use crate::objects::Obj;
use crate::pools::{PoolId, TypeForest};

/// Pools of a subtree in weak type order.
pub struct TypeHierarchyIterator<'a> {
    forest: &'a TypeForest,
    current: Option<PoolId>,
    height: u32,
}

impl<'a> TypeHierarchyIterator<'a> {
    pub(crate) fn new(forest: &'a TypeForest, start: PoolId) -> Self {
        TypeHierarchyIterator {
            forest,
            current: Some(start),
            height: forest.pool(start).type_hierarchy_height(),
        }
    }
}

impl Iterator for TypeHierarchyIterator<'_> {
    type Item = PoolId;

    fn next(&mut self) -> Option<PoolId> {
        let current = self.current?;
        let next = self.forest.pool(current).next_pool().filter(|&n| {
            self.forest.pool(n).type_hierarchy_height() > self.height
        });
        self.current = next;
        Some(current)
    }
}

/// Ranges of the base array plus trailing new-object lists, the shared
/// mechanics of the two instance iterators.
struct Ranges {
    /// (begin, end) index pairs into the base array
    spans: Vec<(usize, usize)>,
    /// pools whose new objects follow, in order
    new_of: Vec<usize>,
}

/// Instances of a pool and its subtypes: file blocks first, then new
/// objects across the subtree.
pub struct DynamicDataIterator<'a> {
    forest: &'a TypeForest,
    base: usize,
    ranges: Ranges,
    span: usize,
    pos: usize,
    new_pool: usize,
    new_pos: usize,
}

impl<'a> DynamicDataIterator<'a> {
    pub(crate) fn new(forest: &'a TypeForest, start: PoolId) -> Self {
        let spans = forest
            .pool(start)
            .blocks()
            .iter()
            .map(|b| (b.bpo, b.bpo + b.dynamic_count))
            .collect();
        let new_of = forest.hierarchy_ids(start);
        let pos = match forest.pool(start).blocks().first() {
            Some(b) => b.bpo,
            None => 0,
        };
        DynamicDataIterator {
            forest,
            base: forest.pool(start).base_pool().0,
            ranges: Ranges { spans, new_of },
            span: 0,
            pos,
            new_pool: 0,
            new_pos: 0,
        }
    }
}

impl Iterator for DynamicDataIterator<'_> {
    type Item = Obj;

    fn next(&mut self) -> Option<Obj> {
        while self.span < self.ranges.spans.len() {
            let (_, end) = self.ranges.spans[self.span];
            if self.pos < end {
                let obj = self.forest.pools[self.base].data[self.pos].clone();
                self.pos += 1;
                return Some(obj);
            }
            self.span += 1;
            if let Some(&(begin, _)) = self.ranges.spans.get(self.span) {
                self.pos = begin;
            }
        }
        while self.new_pool < self.ranges.new_of.len() {
            let pool = &self.forest.pools[self.ranges.new_of[self.new_pool]];
            if self.new_pos < pool.new_objects.len() {
                let obj = pool.new_objects[self.new_pos].clone();
                self.new_pos += 1;
                return Some(obj);
            }
            self.new_pool += 1;
            self.new_pos = 0;
        }
        None
    }
}

/// Instances grouped by dynamic type in weak type order; per pool, existing
/// static instances precede new objects.
pub struct TypeOrderIterator<'a> {
    forest: &'a TypeForest,
    base: usize,
    /// per subtree pool: its static spans
    pools: Vec<(usize, Vec<(usize, usize)>)>,
    pool: usize,
    span: usize,
    pos: usize,
    in_new: bool,
    new_pos: usize,
}

impl<'a> TypeOrderIterator<'a> {
    pub(crate) fn new(forest: &'a TypeForest, start: PoolId) -> Self {
        let pools: Vec<(usize, Vec<(usize, usize)>)> = forest
            .hierarchy_ids(start)
            .into_iter()
            .map(|i| {
                let spans = forest.pools[i]
                    .blocks()
                    .iter()
                    .map(|b| (b.bpo, b.bpo + b.static_count))
                    .collect();
                (i, spans)
            })
            .collect();
        let pos = pools
            .first()
            .and_then(|(_, spans)| spans.first())
            .map_or(0, |&(begin, _)| begin);
        TypeOrderIterator {
            forest,
            base: forest.pool(start).base_pool().0,
            pools,
            pool: 0,
            span: 0,
            pos,
            in_new: false,
            new_pos: 0,
        }
    }
}

impl Iterator for TypeOrderIterator<'_> {
    type Item = Obj;

    fn next(&mut self) -> Option<Obj> {
        while self.pool < self.pools.len() {
            let (pid, spans) = &self.pools[self.pool];
            if !self.in_new {
                while self.span < spans.len() {
                    let (_, end) = spans[self.span];
                    if self.pos < end {
                        let obj = self.forest.pools[self.base].data[self.pos].clone();
                        self.pos += 1;
                        return Some(obj);
                    }
                    self.span += 1;
                    if let Some(&(begin, _)) = spans.get(self.span) {
                        self.pos = begin;
                    }
                }
                self.in_new = true;
                self.new_pos = 0;
            }
            let pool = &self.forest.pools[*pid];
            if self.new_pos < pool.new_objects.len() {
                let obj = pool.new_objects[self.new_pos].clone();
                self.new_pos += 1;
                return Some(obj);
            }
            // advance to the next pool of the subtree
            self.pool += 1;
            self.span = 0;
            self.in_new = false;
            self.pos = self
                .pools
                .get(self.pool)
                .and_then(|(_, spans)| spans.first())
                .map_or(0, |&(begin, _)| begin);
        }
        None
    }
}
