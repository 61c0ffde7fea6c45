//! End-to-end write/read round trips.
//!
//! These tests build states programmatically, write them to disk, read them
//! back and verify the object graphs by IDs, field values and edge
//! structure.

use skillrt::prelude::*;

fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn empty_state_is_prologue_only() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "empty.sf");

    let mut state = SkillState::create();
    state.write(&path)?;

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 5, "empty file is the prologue alone");

    let mut state = SkillState::open(&path)?;
    assert_eq!(state.types().count(), 0);
    assert_eq!(state.strings().len(), 0);

    // writing back yields identical bytes
    state.write(&path)?;
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
    Ok(())
}

#[test]
fn single_primitive_field() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "prim.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let x = state.add_field(p, "x", FieldType::I32)?;

    let a = state.make(p)?;
    let b = state.make(p)?;
    state.set(&a, x, FieldValue::I32(7))?;
    state.set(&b, x, FieldValue::I32(-1))?;

    assert_eq!(state.size(p), 2);
    assert_eq!(state.static_size(p), 2);
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let x = state.field_by_name(p, "x").unwrap();
    assert_eq!(state.size(p), 2);
    assert_eq!(
        state.get(&state.get_by_id(p, 1).unwrap(), x)?,
        FieldValue::I32(7)
    );
    assert_eq!(
        state.get(&state.get_by_id(p, 2).unwrap(), x)?,
        FieldValue::I32(-1)
    );
    assert!(state.get_by_id(p, 3).is_none());
    Ok(())
}

#[test]
fn v64_boundary_values_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "v64.sf");
    let values = [0i64, 127, 128, 16383, 16384, -1];

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let v = state.add_field(p, "v", FieldType::V64)?;
    for &value in &values {
        let o = state.make(p)?;
        state.set(&o, v, FieldValue::I64(value))?;
    }
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let v = state.field_by_name(p, "v").unwrap();
    for (i, &value) in values.iter().enumerate() {
        let o = state.get_by_id(p, i as i64 + 1).unwrap();
        assert_eq!(state.get(&o, v)?, FieldValue::I64(value));
    }
    Ok(())
}

#[test]
fn strings_are_deduplicated_in_the_file() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "strings.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let s = state.add_field(p, "s", FieldType::Str)?;
    let a = state.make(p)?;
    let b = state.make(p)?;
    state.set(&a, s, FieldValue::String("abc".into()))?;
    state.set(&b, s, FieldValue::String("abc".into()))?;
    state.write(&path)?;

    // the payload appears exactly once in the file
    let bytes = std::fs::read(&path).unwrap();
    let hits = bytes.windows(3).filter(|w| *w == b"abc").count();
    assert_eq!(hits, 1);

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let s = state.field_by_name(p, "s").unwrap();
    let va = state.get(&state.get_by_id(p, 1).unwrap(), s)?;
    let vb = state.get(&state.get_by_id(p, 2).unwrap(), s)?;
    assert_eq!(va, vb);
    // both resolve to the same interned string
    match (va, vb) {
        (FieldValue::String(x), FieldValue::String(y)) => {
            assert!(std::sync::Arc::ptr_eq(&x, &y));
        }
        other => panic!("expected strings, got {other:?}"),
    }
    Ok(())
}

#[test]
fn delete_then_compress_reissues_ids() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "delete.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let x = state.add_field(p, "x", FieldType::I32)?;
    for value in [10, 20, 30] {
        let o = state.make(p)?;
        state.set(&o, x, FieldValue::I32(value))?;
    }
    state.write(&path)?;

    let mut state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let x = state.field_by_name(p, "x").unwrap();
    let doomed = state.get_by_id(p, 2).unwrap();
    state.delete(&doomed);
    assert_eq!(state.size(p), 2);
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let x = state.field_by_name(p, "x").unwrap();
    assert_eq!(state.size(p), 2);
    // the survivor that was ID 3 is now ID 2
    assert_eq!(
        state.get(&state.get_by_id(p, 1).unwrap(), x)?,
        FieldValue::I32(10)
    );
    assert_eq!(
        state.get(&state.get_by_id(p, 2).unwrap(), x)?,
        FieldValue::I32(30)
    );
    assert!(state.get_by_id(p, 3).is_none());
    Ok(())
}

#[test]
fn reference_cycles_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "cycle.sf");

    let mut state = SkillState::create();
    let node = state.make_base_pool("node")?;
    let next = state.add_field(node, "next", FieldType::Reference(0))?;
    let a = state.make(node)?;
    let b = state.make(node)?;
    state.set(&a, next, FieldValue::Ref(b.clone()))?;
    state.set(&b, next, FieldValue::Ref(a.clone()))?;
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let node = state.pool_by_name("node").unwrap();
    let next = state.field_by_name(node, "next").unwrap();
    let a = state.get_by_id(node, 1).unwrap();
    let b = state.get_by_id(node, 2).unwrap();

    match state.get(&a, next)? {
        FieldValue::Ref(o) => assert_eq!(o.skill_id(), b.skill_id()),
        other => panic!("expected a reference, got {other:?}"),
    }
    match state.get(&b, next)? {
        FieldValue::Ref(o) => assert_eq!(o.skill_id(), a.skill_id()),
        other => panic!("expected a reference, got {other:?}"),
    }
    Ok(())
}

#[test]
fn null_reference_occupies_one_byte() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let one = temp_path(&dir, "one.sf");
    let two = temp_path(&dir, "two.sf");

    // identical states except for the number of null references
    for (path, count) in [(&one, 1), (&two, 2)] {
        let mut state = SkillState::create();
        let p = state.make_base_pool("p")?;
        let r = state.add_field(p, "r", FieldType::Reference(0))?;
        for _ in 0..count {
            let o = state.make(p)?;
            state.set(&o, r, FieldValue::Null)?;
        }
        state.write(path)?;
    }

    let first = std::fs::read(&one).unwrap();
    let second = std::fs::read(&two).unwrap();
    // every null reference encodes as the single byte 0x00 at the tail
    assert_eq!(second.len(), first.len() + 1);
    assert_eq!(first.last(), Some(&0x00));
    assert_eq!(&second[second.len() - 2..], &[0x00, 0x00]);
    Ok(())
}

#[test]
fn hierarchy_and_weak_type_order() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "hier.sf");

    let mut state = SkillState::create();
    let shape = state.make_base_pool("shape")?;
    let circle = state.make_sub_pool(shape, "circle")?;
    let area = state.add_field(shape, "area", FieldType::F64)?;

    let s = state.make(shape)?;
    let c = state.make(circle)?;
    state.set(&s, area, FieldValue::F64(1.0))?;
    state.set(&c, area, FieldValue::F64(3.5))?;
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let shape = state.pool_by_name("shape").unwrap();
    let circle = state.pool_by_name("circle").unwrap();
    let area = state.field_by_name(circle, "area").unwrap();

    assert_eq!(state.size(shape), 2);
    assert_eq!(state.size(circle), 1);
    assert_eq!(state.static_size(shape), 1);
    assert_eq!(state.pool(circle).super_pool(), Some(shape));
    assert_eq!(state.pool(shape).next_pool(), Some(circle));

    // base instances precede subtype instances in the backing array
    let ids: Vec<i64> = state.iter(shape).map(|o| o.skill_id()).collect();
    assert_eq!(ids, vec![1, 2]);
    let c = state.get_by_id(circle, 2).unwrap();
    assert_eq!(c.pool(), circle);
    assert_eq!(state.get(&c, area)?, FieldValue::F64(3.5));
    Ok(())
}

#[test]
fn containers_and_maps_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "containers.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let tags = state.add_field(p, "tags", FieldType::List(Box::new(FieldType::Str)))?;
    let counts = state.add_field(
        p,
        "counts",
        FieldType::Map(Box::new(FieldType::Str), Box::new(FieldType::I32)),
    )?;
    let triple = state.add_field(
        p,
        "triple",
        FieldType::ConstantLengthArray {
            length: 3,
            ground: Box::new(FieldType::I8),
        },
    )?;

    let o = state.make(p)?;
    state.set(
        &o,
        tags,
        FieldValue::List(vec![
            FieldValue::String("red".into()),
            FieldValue::String("blue".into()),
        ]),
    )?;
    state.set(
        &o,
        counts,
        FieldValue::Map(vec![(FieldValue::String("red".into()), FieldValue::I32(2))]),
    )?;
    state.set(
        &o,
        triple,
        FieldValue::List(vec![
            FieldValue::I8(1),
            FieldValue::I8(2),
            FieldValue::I8(3),
        ]),
    )?;
    state.write(&path)?;

    let state = SkillState::open(&path)?;
    let p = state.pool_by_name("p").unwrap();
    let o = state.get_by_id(p, 1).unwrap();
    let tags = state.field_by_name(p, "tags").unwrap();
    let counts = state.field_by_name(p, "counts").unwrap();
    let triple = state.field_by_name(p, "triple").unwrap();

    assert_eq!(
        state.get(&o, tags)?,
        FieldValue::List(vec![
            FieldValue::String("red".into()),
            FieldValue::String("blue".into()),
        ])
    );
    assert_eq!(
        state.get(&o, counts)?,
        FieldValue::Map(vec![(FieldValue::String("red".into()), FieldValue::I32(2))])
    );
    assert_eq!(
        state.get(&o, triple)?,
        FieldValue::List(vec![
            FieldValue::I8(1),
            FieldValue::I8(2),
            FieldValue::I8(3),
        ])
    );
    Ok(())
}

#[test]
fn wrong_sized_constant_array_fails_the_write() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "cla.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let triple = state.add_field(
        p,
        "triple",
        FieldType::ConstantLengthArray {
            length: 3,
            ground: Box::new(FieldType::I8),
        },
    )?;
    let o = state.make(p)?;
    state.set(&o, triple, FieldValue::List(vec![FieldValue::I8(1)]))?;

    assert!(matches!(
        state.write(&path),
        Err(Error::WrongArrayLength {
            expected: 3,
            actual: 1
        })
    ));
    Ok(())
}

#[test]
fn restriction_violations_block_serialization() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "restricted.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let s = state.add_known_field(p, "s", FieldType::Str, vec![FieldRestriction::NonNull])?;
    let o = state.make(p)?;
    state.set(&o, s, FieldValue::Null)?;

    assert!(matches!(
        state.write(&path),
        Err(Error::RestrictionViolation { .. })
    ));

    state.set(&o, s, FieldValue::String("ok".into()))?;
    state.write(&path)?;
    Ok(())
}

#[test]
fn lazy_and_distributed_reads_match_eager_ones() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "strategies.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let x = state.add_field(p, "x", FieldType::V64)?;
    let s = state.add_field(p, "s", FieldType::Str)?;
    for i in 0..100 {
        let o = state.make(p)?;
        state.set(&o, x, FieldValue::I64(i * 3))?;
        state.set(&o, s, FieldValue::String(format!("n{i}").into()))?;
    }
    state.write(&path)?;

    let eager = SkillState::open(&path)?;
    for strategy in [FieldStrategy::Lazy, FieldStrategy::Distributed] {
        let other = SkillState::open_with_strategy(&path, strategy)?;
        let p = other.pool_by_name("p").unwrap();
        let x = other.field_by_name(p, "x").unwrap();
        let s = other.field_by_name(p, "s").unwrap();
        let ep = eager.pool_by_name("p").unwrap();
        let ex = eager.field_by_name(ep, "x").unwrap();
        let es = eager.field_by_name(ep, "s").unwrap();
        for id in 1..=100 {
            let o = other.get_by_id(p, id).unwrap();
            let e = eager.get_by_id(ep, id).unwrap();
            assert_eq!(other.get(&o, x)?, eager.get(&e, ex)?);
            assert_eq!(other.get(&o, s)?, eager.get(&e, es)?);
        }
    }
    Ok(())
}

#[test]
fn decode_is_independent_of_worker_count() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "parallel.sf");

    let mut state = SkillState::create();
    let p = state.make_base_pool("p")?;
    let a = state.add_field(p, "a", FieldType::I32)?;
    let b = state.add_field(p, "b", FieldType::V64)?;
    let c = state.add_field(p, "c", FieldType::Str)?;
    let d = state.add_field(p, "d", FieldType::Bool)?;
    for i in 0..500i64 {
        let o = state.make(p)?;
        state.set(&o, a, FieldValue::I32(i as i32))?;
        state.set(&o, b, FieldValue::I64(-i))?;
        state.set(&o, c, FieldValue::String(format!("v{}", i % 7).into()))?;
        state.set(&o, d, FieldValue::Bool(i % 2 == 0))?;
    }
    state.write(&path)?;

    let single = rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .unwrap()
        .install(|| SkillState::open(&path))?;
    let parallel = SkillState::open(&path)?;

    let sp = single.pool_by_name("p").unwrap();
    let pp = parallel.pool_by_name("p").unwrap();
    for name in ["a", "b", "c", "d"] {
        let sf = single.field_by_name(sp, name).unwrap();
        let pf = parallel.field_by_name(pp, name).unwrap();
        for id in 1..=500 {
            let so = single.get_by_id(sp, id).unwrap();
            let po = parallel.get_by_id(pp, id).unwrap();
            assert_eq!(single.get(&so, sf)?, parallel.get(&po, pf)?);
        }
    }
    Ok(())
}
