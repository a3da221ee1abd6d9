#![allow(missing_docs)]

use mvtree::{
    storage::{PolicyKind, TreeOptions},
    types::{Result, TreeError, VersionRange},
    MvbTree, TmvbTree,
};

fn options() -> TreeOptions {
    TreeOptions::default()
        .page_size(1024)
        .max_entries_per_page(8)
        .policy(PolicyKind::NonThrashing)
}

#[test]
fn overwritten_value_keeps_its_version() -> Result<()> {
    let mut tree = TmvbTree::<u64, String>::in_memory(options())?;
    let mut first = tree.begin_transaction()?;
    tree.insert(&first, 5, "a".to_string())?;
    assert_eq!(tree.commit(&mut first)?, 1);
    let mut second = tree.begin_transaction()?;
    tree.insert(&second, 5, "b".to_string())?;
    assert_eq!(tree.commit(&mut second)?, 2);

    assert_eq!(tree.tree().get(&5, 1)?, Some("a".to_string()));
    assert_eq!(tree.tree().get(&5, 2)?, Some("b".to_string()));
    assert_eq!(
        tree.history(&5)?,
        vec![
            (VersionRange::new(1, 2), "a".to_string()),
            (VersionRange::new(2, u64::MAX), "b".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn readers_keep_their_snapshot_during_a_write() -> Result<()> {
    let mut tree = TmvbTree::<u64, u64>::in_memory(options())?;
    let mut load = tree.begin_transaction()?;
    for key in 0..200u64 {
        tree.insert(&load, key, 1)?;
    }
    tree.commit(&mut load)?;

    let reader = tree.begin_read_transaction();
    let mut writer = tree.begin_transaction()?;
    for key in (0..200u64).filter(|k| k % 3 == 0) {
        tree.delete(&writer, &key)?;
    }
    assert_eq!(tree.range(&reader, &0, &200)?.len(), 200);
    assert_eq!(tree.range(&writer, &0, &200)?.len(), 133);
    tree.commit(&mut writer)?;
    assert_eq!(tree.range(&reader, &0, &200)?.len(), 200);
    assert_eq!(tree.tree().check_consistency(1)?, 200);
    assert_eq!(tree.tree().check_consistency(2)?, 133);
    Ok(())
}

#[test]
fn auto_commit_versions_count_actions() -> Result<()> {
    let mut tree = MvbTree::<i64, u64>::in_memory(options())?;
    for key in -50..50i64 {
        tree.insert(key, key.unsigned_abs())?;
    }
    assert_eq!(tree.committed_version(), 100);
    assert_eq!(tree.range(&-10, &10, 100)?.len(), 20);
    assert_eq!(tree.range(&-10, &10, 45)?.len(), 5);
    assert!(matches!(
        tree.get(&0, 102),
        Err(TreeError::VersionNotCommitted(102))
    ));
    Ok(())
}
