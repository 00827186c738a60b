use skerry::Config;
use test_log::test;

#[test]
fn compaction_preserves_read_semantics() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;

    // Small segments so the workload spreads over many of them
    let engine = Config::new(&folder).segment_max_size(4 * 1_024).open()?;

    for i in 0..1_000u32 {
        engine.put(format!("key_{i:04}"), format!("value_{i}"))?;
    }

    engine.put("key_0100", "x")?;
    engine.put("key_0100", "y")?;
    engine.put("key_0100", "z")?;
    engine.delete("key_0500")?;

    let before = engine.stats();
    assert!(before.segments > 2);

    engine.force_compaction()?;

    let after = engine.stats();
    assert!(
        after.segments < before.segments,
        "{} -> {}",
        before.segments,
        after.segments,
    );

    assert_eq!(Some("z".into()), engine.get("key_0100")?);
    assert_eq!(None, engine.get("key_0500")?);
    assert_eq!(999, engine.len());

    // Spot-check untouched keys across the whole range
    for i in [0u32, 250, 499, 501, 750, 999] {
        assert_eq!(
            Some(format!("value_{i}").into()),
            engine.get(format!("key_{i:04}"))?,
            "key_{i:04}",
        );
    }

    Ok(())
}

#[test]
fn compaction_then_restart() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Config::new(&folder).segment_max_size(1_024).open()?;

        for i in 0..200u32 {
            engine.put(format!("key_{i:04}"), format!("value_{i}"))?;
        }
        engine.delete("key_0042")?;
        engine.force_compaction()?;
    }

    let engine = Config::new(&folder).segment_max_size(1_024).open()?;

    assert_eq!(199, engine.len());
    assert_eq!(None, engine.get("key_0042")?);
    assert_eq!(Some("value_43".into()), engine.get("key_0043")?);

    Ok(())
}

#[test]
fn repeated_compaction_converges() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Config::new(&folder).segment_max_size(512).open()?;

    // Heavy overwrite load: most records are garbage
    for round in 0..10u32 {
        for i in 0..50u32 {
            engine.put(format!("key_{i:02}"), format!("round_{round}"))?;
        }
    }

    while engine.compact_once()? {}

    let stats = engine.stats();
    assert_eq!(50, stats.keys);
    assert!(stats.segments <= 2, "{}", stats.segments);

    for i in 0..50u32 {
        assert_eq!(Some("round_9".into()), engine.get(format!("key_{i:02}"))?);
    }

    Ok(())
}

#[test]
fn tombstones_are_idempotent() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Config::new(&folder).segment_max_size(256).open()?;

    for i in 0..30u32 {
        engine.put(format!("key_{i:02}"), "v")?;
    }

    engine.delete("key_05")?;
    engine.delete("key_05")?;
    engine.delete("key_05")?;

    engine.force_compaction()?;

    assert_eq!(None, engine.get("key_05")?);
    assert_eq!(29, engine.len());

    Ok(())
}
