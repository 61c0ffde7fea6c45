//! File parse driver.
//!
//! A SKilL file is a prologue followed by a sequence of blocks; each block
//! carries a string-pool delta, a type section, a field section and the
//! concatenated field payloads. The driver builds pools and field
//! declarations single-threaded, records every field's payload span as a
//! chunk, and finally dispatches all chunk decodes onto the worker pool at
//! once.
//!
//! String payloads are never decoded here; only their positions are recorded
//! so the string pool can materialize them on demand.

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;

use crate::fields::{read_bulk_chunk, read_simple_chunk, FieldStrategy};
use crate::fieldtypes::{FieldType, ReadContext};
use crate::pools::blocks::{Block, Chunk};
use crate::pools::{PoolId, TypeForest};
use crate::state::writer::{MAGIC, VERSION};
use crate::state::SkillState;
use crate::streams::{FileInput, MapReader};
use crate::strings::StringPool;
use crate::{Error, Result};

pub(crate) fn read(path: &Path, strategy: FieldStrategy) -> Result<SkillState> {
    let input = Arc::new(FileInput::open(path)?);

    let data = input.data();
    if data.len() < MAGIC.len() + 1 || data[..MAGIC.len()] != MAGIC {
        return Err(Error::NotSupported);
    }
    if data[MAGIC.len()] as i8 != VERSION {
        return Err(Error::NotSupported);
    }

    let strings = StringPool::new(input.clone());
    let mut forest = TypeForest::new();

    {
        let mut r = input.map(0, input.len() as u64)?;
        r.seek(MAGIC.len() + 1)?;
        while !r.eof() {
            read_string_block(&mut r, &strings)?;
            read_type_block(&mut r, &mut forest, &strings, strategy)?;
        }
    }
    forest.establish_type_order();

    let state = SkillState {
        path: Some(path.to_path_buf()),
        input,
        strings,
        forest,
    };
    finish(&state)?;
    state.check()?;
    Ok(state)
}

fn read_string_block(r: &mut MapReader<'_>, strings: &StringPool) -> Result<()> {
    let count = r.v64()?;
    if count < 0 {
        return Err(malformed_error!("negative string count {}", count));
    }

    let mut ends = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ends.push(i64::from(r.i32()?));
    }

    let data_start = r.position() as u64;
    let mut prev = 0i64;
    for end in ends {
        if end < prev {
            return Err(malformed_error!("string offsets decrease at {}", end));
        }
        strings.push_position(data_start + prev as u64, (end - prev) as u32)?;
        prev = end;
    }
    r.seek((data_start + prev as u64) as usize)
}

struct TypeEntry {
    pid: PoolId,
    count: usize,
    lbpo_rel: usize,
    field_count: usize,
    known_before: usize,
}

fn block_count_of(r: &mut MapReader<'_>, what: &str) -> Result<usize> {
    let v = r.v64()?;
    usize::try_from(v).map_err(|_| malformed_error!("negative {} {}", what, v))
}

fn read_type_block(
    r: &mut MapReader<'_>,
    forest: &mut TypeForest,
    strings: &StringPool,
    strategy: FieldStrategy,
) -> Result<()> {
    let type_count = block_count_of(r, "type count")?;

    // type section
    let mut entries: Vec<TypeEntry> = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        let name = strings
            .get(r.v64()?)?
            .ok_or_else(|| malformed_error!("type declaration with null name"))?;
        let count = block_count_of(r, "instance count")?;
        if r.i8()? != 0 {
            return Err(malformed_error!("type restrictions are not supported"));
        }

        let pid = match forest.by_name(&name) {
            Some(pid) => pid,
            None => {
                let super_id = r.v64()?;
                let super_pool = match super_id {
                    0 => None,
                    id if id > 0 && (id as usize) <= forest.len() => {
                        Some(PoolId(id as usize - 1))
                    }
                    id => return Err(malformed_error!("invalid super type {}", id)),
                };
                forest.make_pool(name, super_pool)?
            }
        };

        let lbpo_rel = if count > 0 && forest.pool(pid).super_pool().is_some() {
            block_count_of(r, "base pool offset")?
        } else {
            0
        };
        let field_count = block_count_of(r, "field count")?;
        let known_before = forest.pool(pid).data_fields().len();
        entries.push(TypeEntry {
            pid,
            count,
            lbpo_rel,
            field_count,
            known_before,
        });
    }

    // block origin per touched hierarchy: the base array length before this
    // block's instances land
    let mut block_base: Vec<(usize, usize)> = Vec::new();
    for e in &entries {
        let base = forest.pool(e.pid).base_pool().0;
        if !block_base.iter().any(|&(b, _)| b == base) {
            block_base.push((base, forest.base_data_of(PoolId(base)).len()));
        }
    }
    let base_origin = |base: usize| -> usize {
        block_base
            .iter()
            .find(|&&(b, _)| b == base)
            .map(|&(_, len)| len)
            .expect("origin recorded above")
    };

    // derive static counts: dynamic minus the direct children's dynamic
    let mut static_counts: Vec<usize> = entries.iter().map(|e| e.count).collect();
    for e in &entries {
        let Some(sp) = forest.pool(e.pid).super_pool() else {
            continue;
        };
        match entries.iter().position(|x| x.pid == sp) {
            Some(parent) => {
                static_counts[parent] =
                    static_counts[parent].checked_sub(e.count).ok_or_else(|| {
                        malformed_error!(
                            "subtype '{}' outgrows its super type",
                            forest.pool(e.pid).name()
                        )
                    })?;
            }
            None if e.count > 0 => {
                return Err(malformed_error!(
                    "subtype '{}' has instances but its super type is absent",
                    forest.pool(e.pid).name()
                ));
            }
            None => {}
        }
    }

    // record blocks and grow the base arrays
    for (idx, e) in entries.iter().enumerate() {
        let base = forest.pool(e.pid).base_pool().0;
        let origin = base_origin(base);
        let bpo = if forest.pool(e.pid).super_pool().is_some() {
            origin + e.lbpo_rel
        } else {
            origin
        };
        forest
            .pool_mut(e.pid)
            .blocks
            .push(Block::new(bpo, e.count, static_counts[idx]));
    }
    for e in &entries {
        if forest.pool(e.pid).super_pool().is_none() {
            let base = e.pid.0;
            let new_len = base_origin(base) + e.count;
            let placeholder_pool = e.pid;
            let pool = forest.pool_mut(PoolId(base));
            while pool.data.len() < new_len {
                let index = pool.data.len() as i64;
                pool.data
                    .push(crate::objects::SkillObject::new(index + 1, placeholder_pool));
            }
        }
    }
    for e in &entries {
        forest.allocate_instances(e.pid);
    }

    // field section
    let mut block_chunks: Vec<(PoolId, usize, Chunk)> = Vec::new();
    let mut prev_end = 0u64;
    for e in &entries {
        let new_fields = e.field_count.checked_sub(e.known_before).ok_or_else(|| {
            malformed_error!(
                "field count of '{}' shrank to {}",
                forest.pool(e.pid).name(),
                e.field_count
            )
        })?;
        // blocks with instances re-list every known field; others only new ones
        let known_entries = if e.count > 0 { e.known_before } else { 0 };
        let entry_count = known_entries + new_fields;

        for _ in 0..entry_count {
            let fname = strings
                .get(r.v64()?)?
                .ok_or_else(|| malformed_error!("field declaration with null name"))?;

            let (fi, chunk) = match forest.field_index_by_name(e.pid, &fname) {
                Some(fi) => {
                    // known field: this block only adds instances
                    let end = block_count_of(r, "field end offset")? as u64;
                    let block = *forest
                        .pool(e.pid)
                        .blocks()
                        .last()
                        .expect("entry pools have a block");
                    (
                        fi,
                        Chunk::Simple {
                            begin: prev_end,
                            end,
                            bpo: block.bpo,
                            count: block.dynamic_count,
                        },
                    )
                }
                None => {
                    let ft = read_field_type(r)?;
                    if r.i8()? != 0 {
                        return Err(malformed_error!("field restrictions are not supported"));
                    }
                    let end = block_count_of(r, "field end offset")? as u64;
                    let index = forest.add_field(e.pid, fname, ft, strategy)?;
                    let fi = index as usize - 1;

                    let pool = forest.pool(e.pid);
                    let chunk = if pool.blocks().len() > 1 {
                        // the field was added late: its payload spans every
                        // block the pool already has
                        let count = pool.blocks().iter().map(|b| b.dynamic_count).sum();
                        Chunk::Bulk {
                            begin: prev_end,
                            end,
                            count,
                            block_count: pool.blocks().len(),
                        }
                    } else {
                        let block = *pool.blocks().last().expect("entry pools have a block");
                        Chunk::Simple {
                            begin: prev_end,
                            end,
                            bpo: block.bpo,
                            count: block.dynamic_count,
                        }
                    };
                    (fi, chunk)
                }
            };

            if chunk.end() < prev_end {
                return Err(malformed_error!("field data offsets decrease at {}", chunk.end()));
            }
            prev_end = chunk.end();
            block_chunks.push((e.pid, fi, chunk));
        }
    }

    // offsets were relative to this block's field data origin
    let origin = r.position() as u64;
    for (pid, fi, mut chunk) in block_chunks {
        chunk.shift(origin);
        forest.pool_mut(pid).data_fields[fi].data_chunks.push(chunk);
    }
    r.seek((origin + prev_end) as usize)
}

fn read_field_type(r: &mut MapReader<'_>) -> Result<FieldType> {
    let tag = r.v64()?;
    Ok(match tag {
        0 => FieldType::ConstantI8(r.i8()?),
        1 => FieldType::ConstantI16(r.i16()?),
        2 => FieldType::ConstantI32(r.i32()?),
        3 => FieldType::ConstantI64(r.i64()?),
        4 => FieldType::ConstantV64(r.v64()?),
        0x0F => {
            let length = block_count_of(r, "array length")? as u64;
            let ground = ground_type(r.v64()?)?;
            FieldType::ConstantLengthArray {
                length,
                ground: Box::new(ground),
            }
        }
        0x11 => FieldType::VariableLengthArray(Box::new(ground_type(r.v64()?)?)),
        0x12 => FieldType::List(Box::new(ground_type(r.v64()?)?)),
        0x13 => FieldType::Set(Box::new(ground_type(r.v64()?)?)),
        0x14 => {
            let k = read_field_type(r)?;
            let v = read_field_type(r)?;
            FieldType::Map(Box::new(k), Box::new(v))
        }
        other => ground_type(other)?,
    })
}

fn ground_type(id: i64) -> Result<FieldType> {
    Ok(match id {
        5 => FieldType::Annotation,
        6 => FieldType::Bool,
        7 => FieldType::I8,
        8 => FieldType::I16,
        9 => FieldType::I32,
        10 => FieldType::I64,
        11 => FieldType::V64,
        12 => FieldType::F32,
        13 => FieldType::F64,
        14 => FieldType::Str,
        id if id >= 32 => FieldType::Reference((id - 32) as usize),
        _ => return Err(malformed_error!("invalid field type {}", id)),
    })
}

#[derive(Clone, Copy)]
struct Job {
    pool: usize,
    field: usize,
    chunk: usize,
}

/// Dispatch one decode job per non-lazy chunk and await them all.
///
/// Jobs of distinct fields run concurrently; the first error is returned
/// after every job has finished, the rest are logged.
fn finish(state: &SkillState) -> Result<()> {
    let mut jobs: Vec<Job> = Vec::new();
    for pid in state.forest.ids() {
        let base_len = state.forest.base_data_of(pid).len();
        for (fi, f) in state.forest.pool(pid).data_fields().iter().enumerate() {
            f.storage()?.resize_base(base_len);
            if f.is_lazy() {
                continue;
            }
            for ci in 0..f.data_chunks.len() {
                jobs.push(Job {
                    pool: pid.0,
                    field: fi,
                    chunk: ci,
                });
            }
        }
    }

    log::debug!("dispatching {} field decode jobs", jobs.len());
    let results: Vec<Result<()>> = jobs
        .par_iter()
        .map(|job| run_read_job(state, job))
        .collect();

    let mut first = None;
    for r in results {
        if let Err(e) = r {
            if first.is_none() {
                first = Some(e);
            } else {
                log::warn!("suppressed decode error: {e}");
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn run_read_job(state: &SkillState, job: &Job) -> Result<()> {
    let pool = &state.forest.pools[job.pool];
    let decl = &pool.data_fields[job.field];
    let chunk = decl.data_chunks[job.chunk];

    let mut r = state.input.map(chunk.begin(), chunk.end())?;
    let base = state.forest.base_data_of(PoolId(job.pool));
    let cx = ReadContext {
        forest: &state.forest,
        strings: &state.strings,
    };

    let mismatch = |position: u64| Error::PoolSizeMismatch {
        chunk: job.chunk,
        position,
        begin: chunk.begin(),
        end: chunk.end(),
        field: decl.name().to_string(),
    };

    let mut storage = decl.storage()?;
    let decoded = match chunk {
        Chunk::Simple { bpo, count, .. } => {
            read_simple_chunk(decl, base, &mut storage, bpo, bpo + count, &mut r, &cx)
        }
        Chunk::Bulk { block_count, .. } => read_bulk_chunk(
            decl,
            base,
            &mut storage,
            pool.blocks(),
            block_count,
            &mut r,
            &cx,
        ),
    };

    match decoded {
        Err(Error::OutOfBounds) => Err(mismatch(r.position() as u64)),
        Err(e) => Err(e),
        Ok(()) => {
            if r.eof() {
                Ok(())
            } else {
                Err(mismatch(r.position() as u64))
            }
        }
    }
}
