//! Shared serialization machinery.
//!
//! Both write modes run the same prologue (force-load lazy fields, collect
//! every live string, merge distributed field buffers, run restriction
//! checks) and the same epilogue (partition the mapped output into disjoint
//! per-field windows and write them in parallel). The mode-specific drivers
//! in [`writer`](super::writer) and [`appender`](super::appender) only differ
//! in layout planning.

use std::sync::Arc;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::fields::{range_offset, write_range};
use crate::fieldtypes::{FieldType, FieldValue, WriteContext};
use crate::pools::blocks::Chunk;
use crate::pools::iterators::DynamicDataIterator;
use crate::pools::PoolId;
use crate::state::{FieldId, SkillState};
use crate::streams::{BinaryOut, FileOutput, MapWriter, OutBuffer};
use crate::{Error, Result};

/// One parallel write job: a field's last chunk and its absolute window in
/// the field-data region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Task {
    pub pool: usize,
    pub field: usize,
    /// Offset relative to the field-data origin.
    pub begin: u64,
    pub end: u64,
}

fn collect_value(state: &SkillState, v: &FieldValue) {
    match v {
        FieldValue::String(s) => {
            state.strings.add(s);
        }
        FieldValue::List(xs) => {
            for x in xs {
                collect_value(state, x);
            }
        }
        FieldValue::Map(xs) => {
            for (k, val) in xs {
                collect_value(state, k);
                collect_value(state, val);
            }
        }
        _ => {}
    }
}

/// Common serialization prologue.
///
/// Interns pool and field names, force-loads lazy fields, gathers every
/// string reachable from string-typed positions (including nested container
/// and map positions), merges distributed new-object buffers, runs the
/// restriction checks and resets string IDs.
pub(crate) fn prepare(state: &SkillState) -> Result<()> {
    for pid in state.forest.ids() {
        state.strings.add(state.forest.pool(pid).name());

        let field_count = state.forest.pool(pid).data_fields().len();
        for fi in 0..field_count {
            let fid = FieldId {
                pool: pid,
                index: fi as i32 + 1,
            };
            state.ensure_loaded(fid)?;

            let decl = state.field_decl(fid)?;
            state.strings.add(decl.name());

            if decl.field_type().contains_string() {
                let storage = decl.storage()?;
                for obj in DynamicDataIterator::new(&state.forest, pid) {
                    if !obj.is_deleted() {
                        collect_value(state, &storage.get(&obj));
                    }
                }
            }

            decl.storage()?.compress_distributed();
        }
    }

    state.check()?;
    state.strings.reset_ids();
    Ok(())
}

/// Emit the tagged schema encoding of a field type.
pub(crate) fn write_field_type(ft: &FieldType, out: &mut OutBuffer) -> Result<()> {
    match ft {
        FieldType::ConstantI8(v) => {
            out.i8(0)?;
            out.i8(*v)?;
        }
        FieldType::ConstantI16(v) => {
            out.i8(1)?;
            out.i16(*v)?;
        }
        FieldType::ConstantI32(v) => {
            out.i8(2)?;
            out.i32(*v)?;
        }
        FieldType::ConstantI64(v) => {
            out.i8(3)?;
            out.i64(*v)?;
        }
        FieldType::ConstantV64(v) => {
            out.i8(4)?;
            out.v64(*v)?;
        }
        FieldType::ConstantLengthArray { length, ground } => {
            out.i8(0x0F)?;
            out.v64(*length as i64)?;
            out.v64(ground.type_id())?;
        }
        FieldType::VariableLengthArray(ground) => {
            out.i8(0x11)?;
            out.v64(ground.type_id())?;
        }
        FieldType::List(ground) => {
            out.i8(0x12)?;
            out.v64(ground.type_id())?;
        }
        FieldType::Set(ground) => {
            out.i8(0x13)?;
            out.v64(ground.type_id())?;
        }
        FieldType::Map(k, v) => {
            out.i8(0x14)?;
            write_field_type(k, out)?;
            write_field_type(v, out)?;
        }
        other => out.v64(other.type_id())?,
    }
    Ok(())
}

/// Byte length of a field's last chunk, the one the pending write will emit.
pub(crate) fn field_data_length(
    state: &SkillState,
    pool: usize,
    field: usize,
    cx: &WriteContext<'_>,
) -> Result<u64> {
    let p = &state.forest.pools[pool];
    let decl = &p.data_fields[field];
    let base = state.forest.base_data_of(PoolId(pool));
    let storage = decl.storage()?;

    match decl.last_chunk() {
        None => Ok(0),
        Some(Chunk::Simple { bpo, count, .. }) => {
            range_offset(decl, base, &storage, bpo, bpo + count, cx)
        }
        Some(Chunk::Bulk { block_count, .. }) => {
            let mut sum = 0;
            for b in p.blocks().iter().take(block_count) {
                sum += range_offset(decl, base, &storage, b.bpo, b.bpo + b.dynamic_count, cx)?;
            }
            Ok(sum)
        }
    }
}

fn run_write_task(
    state: &SkillState,
    task: &Task,
    window: &mut [u8],
    string_ids: &FxHashMap<Arc<str>, i64>,
) -> Result<()> {
    let pool = &state.forest.pools[task.pool];
    let decl = &pool.data_fields[task.field];
    let base = state.forest.base_data_of(PoolId(task.pool));
    let storage = decl.storage()?;
    let cx = WriteContext {
        forest: &state.forest,
        string_ids,
    };

    let mut w = MapWriter::new(window);
    match decl.last_chunk().ok_or_else(|| {
        Error::Internal(format!("field '{}' scheduled without a chunk", decl.name()))
    })? {
        Chunk::Simple { bpo, count, .. } => {
            write_range(decl, base, &storage, bpo, bpo + count, &mut w, &cx)?;
        }
        Chunk::Bulk { block_count, .. } => {
            for b in pool.blocks().iter().take(block_count) {
                write_range(decl, base, &storage, b.bpo, b.bpo + b.dynamic_count, &mut w, &cx)?;
            }
        }
    }

    if w.remaining() != 0 {
        return Err(Error::Internal(format!(
            "field '{}' wrote {} bytes short of its predicted size",
            decl.name(),
            w.remaining()
        )));
    }
    Ok(())
}

/// Write the file head and all field payloads.
///
/// The head goes out sequentially; the field-data region is split into one
/// disjoint window per task and written in parallel. All tasks run to
/// completion; the first error is returned and the rest are logged.
pub(crate) fn write_field_data(
    state: &SkillState,
    output: &mut FileOutput,
    head: &[u8],
    tasks: &[Task],
    string_ids: &FxHashMap<Arc<str>, i64>,
) -> Result<()> {
    let region = output.region();
    region[..head.len()].copy_from_slice(head);

    let mut rest: &mut [u8] = &mut region[head.len()..];
    let mut work: Vec<(&Task, &mut [u8])> = Vec::with_capacity(tasks.len());
    let mut consumed = 0u64;
    for task in tasks {
        if task.begin != consumed {
            return Err(Error::Internal(format!(
                "write task at {} does not continue at {}",
                task.begin, consumed
            )));
        }
        let len = (task.end - task.begin) as usize;
        let (window, tail) = std::mem::take(&mut rest).split_at_mut(len);
        rest = tail;
        consumed = task.end;
        work.push((task, window));
    }

    log::debug!("dispatching {} field write tasks", work.len());
    let results: Vec<Result<()>> = work
        .into_par_iter()
        .map(|(task, window)| run_write_task(state, task, window, string_ids))
        .collect();

    let mut first = None;
    for r in results {
        if let Err(e) = r {
            if first.is_none() {
                first = Some(e);
            } else {
                log::warn!("suppressed write error: {e}");
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
