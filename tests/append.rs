//! Append-mode scenarios.
//!
//! Appending must leave every existing byte of the file untouched, preserve
//! previously assigned string and object IDs, and emit only new blocks, new
//! strings and new field payloads.

use skillrt::prelude::*;

fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn append_preserves_existing_bytes_and_ids() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "grow.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let x = state.add_field(p, "x", FieldType::I32)?;
    for value in [1, 2] {
        let o = state.make(p)?;
        state.set(&o, x, FieldValue::I32(value))?;
    }
    state.write(&path)?;
    let before = std::fs::read(&path).unwrap();

    let existing = state.get_by_id(p, 1).unwrap();
    for value in [3, 4] {
        let o = state.make(p)?;
        state.set(&o, x, FieldValue::I32(value))?;
    }
    state.append()?;

    // prior bytes untouched, prior IDs unchanged
    let after = std::fs::read(&path).unwrap();
    assert!(after.len() > before.len());
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(existing.skill_id(), 1);

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let x = state.field_by_name(p, "x").unwrap();
    assert_eq!(state.size(p), 4);
    for id in 1..=4 {
        let o = state.get_by_id(p, id).unwrap();
        assert_eq!(state.get(&o, x)?, FieldValue::I32(id as i32));
    }
    Ok(())
}

#[test]
fn append_adds_a_field_to_existing_instances() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "field.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    for _ in 0..3 {
        state.make(p)?;
    }
    state.write(&path)?;

    // the new field's payload must cover the three existing instances
    let mut state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let y = state.add_field(p, "y", FieldType::I8)?;
    for id in 1..=3 {
        let o = state.get_by_id(p, id).unwrap();
        state.set(&o, y, FieldValue::I8(id as i8))?;
    }
    state.append()?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let y = state.field_by_name(p, "y").unwrap();
    assert_eq!(state.size(p), 3);
    for id in 1..=3 {
        let o = state.get_by_id(p, id).unwrap();
        assert_eq!(state.get(&o, y)?, FieldValue::I8(id as i8));
    }
    Ok(())
}

#[test]
fn append_new_pool_and_new_strings() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "pool.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let s = state.add_field(p, "s", FieldType::Str)?;
    let o = state.make(p)?;
    state.set(&o, s, FieldValue::String("old".into()))?;
    state.write(&path)?;

    let q = state.make_base_pool("q")?;
    let t = state.add_field(q, "t", FieldType::Str)?;
    let o = state.make(q)?;
    state.set(&o, t, FieldValue::String("new".into()))?;
    state.append()?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let q = state.pool_by_name("q").unwrap();
    let s = state.field_by_name(p, "s").unwrap();
    let t = state.field_by_name(q, "t").unwrap();
    assert_eq!(
        state.get(&state.get_by_id(p, 1).unwrap(), s)?,
        FieldValue::String("old".into())
    );
    assert_eq!(
        state.get(&state.get_by_id(q, 1).unwrap(), t)?,
        FieldValue::String("new".into())
    );
    Ok(())
}

#[test]
fn append_into_a_hierarchy() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "hier.sf");

    let mut state = SkillState::create();
    let shape = state.make_base_pool("shape")?;
    let circle = state.make_sub_pool(shape, "circle")?;
    let tag = state.add_field(shape, "tag", FieldType::I32)?;
    let s = state.make(shape)?;
    state.set(&s, tag, FieldValue::I32(1))?;
    state.write(&path)?;

    let c = state.make(circle)?;
    state.set(&c, tag, FieldValue::I32(2))?;
    state.append()?;

    let state = SkillState::open(&path)?;
    let shape = state.pool_by_name("shape").unwrap();
    let circle = state.pool_by_name("circle").unwrap();
    let tag = state.field_by_name(circle, "tag").unwrap();

    assert_eq!(state.size(shape), 2);
    assert_eq!(state.size(circle), 1);
    let c = state.get_by_id(circle, 2).unwrap();
    assert_eq!(c.pool(), circle);
    assert_eq!(state.get(&c, tag)?, FieldValue::I32(2));
    Ok(())
}

#[test]
fn double_append_accumulates() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "twice.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let x = state.add_field(p, "x", FieldType::V64)?;
    let o = state.make(p)?;
    state.set(&o, x, FieldValue::I64(100))?;
    state.write(&path)?;

    for round in [200i64, 300] {
        let o = state.make(p)?;
        state.set(&o, x, FieldValue::I64(round))?;
        state.append()?;
    }

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let x = state.field_by_name(p, "x").unwrap();
    assert_eq!(state.size(p), 3);
    for (id, expected) in [(1, 100), (2, 200), (3, 300)] {
        let o = state.get_by_id(p, id).unwrap();
        assert_eq!(state.get(&o, x)?, FieldValue::I64(expected))
    }
    Ok(())
}

#[test]
fn append_without_backing_file_fails() {
    let mut state = SkillState::create();
    state.make_base_pool("p").unwrap();
    assert!(matches!(state.append(), Err(Error::NoBackingFile)));
}
