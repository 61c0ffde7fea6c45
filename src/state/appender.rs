//! Incremental ("append") mode.
//!
//! An append leaves every existing byte of the backing file untouched: new
//! strings keep their predecessors' IDs valid, new instances extend the base
//! arrays past the old high-water mark, and one new top-level block describes
//! only the pools that gained instances or fields.

use dashmap::DashMap;

use crate::fieldtypes::WriteContext;
use crate::pools::blocks::Chunk;
use crate::pools::{FieldKey, PoolId};
use crate::state::ser::{self, Task};
use crate::state::SkillState;
use crate::streams::{BinaryOut, FileOutput, OutBuffer};
use crate::{Error, Result};

pub(crate) fn append(state: &mut SkillState) -> Result<()> {
    let path = state.path.clone().ok_or(Error::NoBackingFile)?;

    ser::prepare(state)?;
    state.forest.fix();

    let result = append_fixed(state, &path);

    state.forest.unfix();
    state.strings.reset_ids();
    result
}

fn append_fixed(state: &mut SkillState, path: &std::path::Path) -> Result<()> {
    let pool_count = state.forest.len();

    // block origins: base-array lengths before the new instances land
    let old_base_len: Vec<usize> = (0..pool_count)
        .map(|i| state.forest.base_data_of(PoolId(i)).len())
        .collect();
    let was_new: Vec<bool> = (0..pool_count)
        .map(|i| state.forest.pools[i].blocks().is_empty())
        .collect();

    let lbpo = state.forest.prepare_append_ids()?;

    let chunk_map: DashMap<FieldKey, Chunk> = DashMap::new();
    let mut listed: Vec<usize> = Vec::new();
    for i in 0..pool_count {
        if state
            .forest
            .prepare_append_block(PoolId(i), &lbpo, &chunk_map)?
        {
            listed.push(i);
        }
    }

    let mut head = OutBuffer::new();
    state.strings.prepare_and_append(&mut head)?;
    let string_ids = state.strings.ids_snapshot()?;

    let name_id = |s: &str| -> Result<i64> {
        state
            .strings
            .id_of(s)
            .ok_or_else(|| Error::Internal(format!("name {s:?} was not collected")))
    };

    // type section: only pools that gained a block
    head.v64(listed.len() as i64)?;
    for &i in &listed {
        let pool = &state.forest.pools[i];
        let block = *pool.blocks().last().expect("pool was just given a block");

        head.v64(name_id(pool.name())?)?;
        head.v64(block.dynamic_count as i64)?;
        head.i8(0)?; // restrictions
        if was_new[i] {
            match pool.super_pool() {
                None => head.v64(0)?,
                Some(sp) => head.v64(sp.0 as i64 + 1)?,
            }
        }
        if block.dynamic_count > 0 && pool.super_pool().is_some() {
            head.v64((block.bpo - old_base_len[i]) as i64)?;
        }
        let in_file = pool
            .data_fields()
            .iter()
            .filter(|f| !f.data_chunks.is_empty())
            .count();
        head.v64(in_file as i64)?;
    }

    // field section: entries for exactly the chunks this block carries
    let cx = WriteContext {
        forest: &state.forest,
        string_ids: &string_ids,
    };
    let mut tasks: Vec<Task> = Vec::new();
    let mut end = 0u64;
    for &i in &listed {
        for fi in 0..state.forest.pools[i].data_fields.len() {
            if !chunk_map.contains_key(&(i, fi)) {
                continue;
            }
            let length = ser::field_data_length(state, i, fi, &cx)?;
            let begin = end;
            end += length;

            let decl = &state.forest.pools[i].data_fields[fi];
            head.v64(name_id(decl.name())?)?;
            if decl.data_chunks.len() == 1 {
                // first appearance of this field in the file
                ser::write_field_type(decl.field_type(), &mut head)?;
                head.i8(0)?; // restrictions
            }
            head.v64(end as i64)?;
            tasks.push(Task {
                pool: i,
                field: fi,
                begin,
                end,
            });
        }
    }

    let total = tasks.last().map_or(0, |t| t.end);
    log::debug!(
        "append: {} pools listed, {} chunks, {} head bytes, {} data bytes",
        listed.len(),
        tasks.len(),
        head.len(),
        total
    );

    let mut output = FileOutput::append(path, head.len() as u64 + total)?;
    ser::write_field_data(state, &mut output, head.as_slice(), &tasks, &string_ids)?;
    output.finish()
}
