use skerry::Config;
use test_log::test;

#[test]
fn engine_survives_restart() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Config::new(&folder).open()?;

        engine.put("a", "1")?;
        engine.put("b", "2")?;
        engine.put("c", "3")?;
        engine.delete("b")?;

        // Dropped without any explicit shutdown, like a crash after the
        // appends hit the file
    }

    let engine = Config::new(&folder).open()?;

    assert_eq!(Some("1".into()), engine.get("a")?);
    assert_eq!(None, engine.get("b")?);
    assert_eq!(Some("3".into()), engine.get("c")?);
    assert_eq!(2, engine.len());

    Ok(())
}

#[test]
fn engine_overwrites_survive_restart() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let engine = Config::new(&folder).segment_max_size(128).open()?;

        for i in 0..50u32 {
            engine.put(format!("key_{i:04}"), format!("value_{i}"))?;
        }

        engine.put("key_0007", "rewritten")?;
    }

    let engine = Config::new(&folder).segment_max_size(128).open()?;

    assert_eq!(Some("rewritten".into()), engine.get("key_0007")?);
    assert_eq!(Some("value_8".into()), engine.get("key_0008")?);
    assert_eq!(50, engine.len());

    Ok(())
}

#[test]
fn engine_drops_torn_record_on_recovery() -> skerry::Result<()> {
    use std::io::Write;

    let folder = tempfile::tempdir()?;

    {
        let engine = Config::new(&folder).open()?;
        engine.put("a", "1")?;
        engine.put("b", "2")?;
    }

    // Corrupt the active segment with a half-written record
    let segment_path = folder.path().join("000000.seg");
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&segment_path)?;

        // Header promises a 100-byte value that never made it to disk
        file.write_all(&[0, 0, 0, 1, 0, 0, 0, 100, 0, b'x'])?;
    }

    let engine = Config::new(&folder).open()?;

    assert_eq!(Some("1".into()), engine.get("a")?);
    assert_eq!(Some("2".into()), engine.get("b")?);
    assert_eq!(2, engine.len());

    // The engine keeps accepting writes after the truncation
    engine.put("c", "3")?;
    assert_eq!(Some("3".into()), engine.get("c")?);

    Ok(())
}

#[test]
fn engine_keys_and_stats() -> skerry::Result<()> {
    let folder = tempfile::tempdir()?;
    let engine = Config::new(&folder).open()?;

    for i in 0..10u32 {
        engine.put(format!("key_{i:04}"), "v")?;
    }
    engine.delete("key_0003")?;

    let mut keys = engine
        .keys()
        .into_iter()
        .map(|k| String::from_utf8_lossy(&k).into_owned())
        .collect::<Vec<_>>();
    keys.sort();

    assert_eq!(9, keys.len());
    assert!(!keys.contains(&"key_0003".to_owned()));

    let stats = engine.stats();
    assert_eq!(9, stats.keys);
    assert!(stats.total_size > 0);
    assert!(stats.segments >= 1);

    assert!(engine.exists("key_0004")?);
    assert!(!engine.exists("key_0003")?);
    assert!(!engine.exists("never_written")?);

    Ok(())
}
