#![allow(missing_docs)]

use mvtree::{
    storage::{PolicyKind, TreeOptions},
    types::Result,
    CmvbTree,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> TreeOptions {
    TreeOptions::default()
        .page_size(1024)
        .max_entries_per_page(8)
        .policy(PolicyKind::NonThrashing)
        .maintenance_interval(1_000)
}

#[test]
fn committed_marker_moves_to_stable_tree() -> Result<()> {
    init_tracing();
    let tree = CmvbTree::<u64, String>::in_memory(options())?;
    let outsider = tree.begin_read_transaction();
    let mut txn = tree.begin_transaction();
    tree.insert(&txn, 7, "x".to_string())?;
    assert_eq!(tree.get(&txn, &7)?, Some("x".to_string()));
    assert_eq!(tree.get(&outsider, &7)?, None);

    let committed = tree.commit(&mut txn)?;
    assert_eq!(tree.transient_len()?, 1);
    assert!(tree.run_maintenance()?);
    assert_eq!(tree.get_at(&7, committed)?, Some("x".to_string()));
    assert_eq!(tree.transient_len()?, 0);
    assert_eq!(tree.stable_version(), committed);
    assert_eq!(tree.stats().migrated_markers(), 1);
    Ok(())
}

#[test]
fn reads_agree_before_and_after_draining() -> Result<()> {
    init_tracing();
    let tree = CmvbTree::<u64, u64>::in_memory(options())?;
    for round in 1..=20u64 {
        let mut txn = tree.begin_transaction();
        for key in 0..30u64 {
            if key % round == 0 {
                tree.insert(&txn, key, round)?;
            }
        }
        tree.commit(&mut txn)?;
    }
    let readers: Vec<_> = (1..=20).map(|v| tree.begin_read_at(v)).collect::<Result<_>>()?;
    let before: Vec<_> = readers
        .iter()
        .map(|r| tree.range(r, &0, &30))
        .collect::<Result<_>>()?;
    tree.drain()?;
    let after: Vec<_> = readers
        .iter()
        .map(|r| tree.range(r, &0, &30))
        .collect::<Result<_>>()?;
    assert_eq!(before, after);
    assert_eq!(after[19].len(), 30);
    tree.stats().emit_tracing();
    Ok(())
}
