//! Full rewrite ("compress") mode.
//!
//! A full write drops deleted instances, reissues dense IDs in weak type
//! order and emits the whole state as a single block: prologue, string
//! block, type section, field section with end offsets, then the field data
//! written in parallel.

use std::path::Path;

use crate::fieldtypes::WriteContext;
use crate::pools::blocks::Chunk;
use crate::state::ser::{self, Task};
use crate::state::SkillState;
use crate::streams::{BinaryOut, FileOutput, OutBuffer};
use crate::{Error, Result};

/// File prologue: magic bytes and format version.
pub(crate) const MAGIC: [u8; 4] = *b"SKiL";
/// Supported format version.
pub(crate) const VERSION: i8 = 1;

pub(crate) fn write(state: &mut SkillState, path: &Path) -> Result<()> {
    ser::prepare(state)?;
    state.forest.fix();

    let result = write_fixed(state, path);

    state.forest.unfix();
    state.strings.reset_ids();
    result
}

fn write_fixed(state: &mut SkillState, path: &Path) -> Result<()> {
    let lbpo = state.forest.compress_ids()?;

    // every field now covers exactly its owner's dynamic region
    for i in 0..state.forest.pools.len() {
        let cached = state.forest.pools[i].cached_size;
        let bpo = lbpo[i];
        for f in state.forest.pools[i].data_fields.iter_mut() {
            f.data_chunks.clear();
            f.data_chunks.push(Chunk::Simple {
                begin: 0,
                end: 0,
                bpo,
                count: cached,
            });
        }
    }

    let mut head = OutBuffer::new();
    head.bytes(&MAGIC)?;
    head.i8(VERSION)?;

    let mut tasks: Vec<Task> = Vec::new();
    let mut string_ids = Default::default();

    // a state without types and strings is the canonical empty file
    if !(state.forest.is_empty() && state.strings.is_empty()) {
        state.strings.prepare_and_write(&mut head)?;
        string_ids = state.strings.ids_snapshot()?;

        let name_id = |s: &str| -> Result<i64> {
            state
                .strings
                .id_of(s)
                .ok_or_else(|| Error::Internal(format!("name {s:?} was not collected")))
        };

        // type section
        head.v64(state.forest.len() as i64)?;
        for i in 0..state.forest.len() {
            let pool = &state.forest.pools[i];
            head.v64(name_id(pool.name())?)?;
            head.v64(pool.cached_size as i64)?;
            head.i8(0)?; // restrictions
            match pool.super_pool() {
                None => head.v64(0)?,
                Some(sp) => {
                    head.v64(sp.0 as i64 + 1)?;
                    if pool.cached_size > 0 {
                        head.v64(lbpo[i] as i64)?;
                    }
                }
            }
            head.v64(pool.data_fields.len() as i64)?;
        }

        // field section, computing the layout as we go
        let cx = WriteContext {
            forest: &state.forest,
            string_ids: &string_ids,
        };
        let mut end = 0u64;
        for i in 0..state.forest.len() {
            for fi in 0..state.forest.pools[i].data_fields.len() {
                let length = ser::field_data_length(state, i, fi, &cx)?;
                let begin = end;
                end += length;

                let decl = &state.forest.pools[i].data_fields[fi];
                head.v64(name_id(decl.name())?)?;
                ser::write_field_type(decl.field_type(), &mut head)?;
                head.i8(0)?; // restrictions
                head.v64(end as i64)?;
                tasks.push(Task {
                    pool: i,
                    field: fi,
                    begin,
                    end,
                });
            }
        }
    }

    let total = tasks.last().map_or(0, |t| t.end);
    log::debug!(
        "full write: {} pools, {} fields, {} head bytes, {} data bytes",
        state.forest.len(),
        tasks.len(),
        head.len(),
        total
    );

    let mut output = FileOutput::create(path, head.len() as u64 + total)?;
    ser::write_field_data(state, &mut output, head.as_slice(), &tasks, &string_ids)?;
    output.finish()?;

    state.forest.commit_compress(&lbpo);
    Ok(())
}
