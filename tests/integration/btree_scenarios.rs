#![allow(missing_docs)]

use mvtree::{
    storage::{PolicyKind, TreeOptions},
    types::Result,
    BTree,
};

fn capacity_four(policy: PolicyKind) -> TreeOptions {
    TreeOptions::default()
        .page_size(256)
        .max_entries_per_page(4)
        .policy(policy)
        .cache_pages(32)
}

#[test]
fn ascending_inserts_scan_back_in_order() -> Result<()> {
    const N: u64 = 1_000;
    let mut tree = BTree::<u64, u64>::in_memory(capacity_four(PolicyKind::Fixed))?;
    assert_eq!(tree.capacities(), (4, 4));
    for key in 1..=N {
        tree.insert(key, key * 10)?;
    }
    // ascending splits leave half-full pages behind
    assert!(tree.height() >= 5, "height {}", tree.height());
    assert!(tree.height() <= 11, "height {}", tree.height());

    let scanned = tree.range(&1, &(N + 1))?;
    assert_eq!(scanned.len(), N as usize);
    assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(scanned.first(), Some(&(1, 10)));
    assert_eq!(scanned.last(), Some(&(N, N * 10)));
    assert_eq!(tree.check_consistency()?, N as usize);
    Ok(())
}

#[test]
fn descending_deletes_shrink_back_to_empty() -> Result<()> {
    let mut tree = BTree::<u64, u64>::in_memory(capacity_four(PolicyKind::Ratio))?;
    for key in 1..=400u64 {
        tree.insert(key, key)?;
    }
    let tall = tree.height();
    for key in (1..=400u64).rev() {
        assert_eq!(tree.delete(&key)?, Some(key));
    }
    assert!(tree.is_empty());
    assert!(tree.stats().height_decreases() >= u64::from(tall) - 1);
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    let options = TreeOptions::from_toml_str(
        r#"
        page_size = 256
        max_entries_per_page = 4
        policy = "fixed"
        cache_pages = 32
        "#,
    )?;
    let mut tree = BTree::<u64, u64>::in_memory(options)?;
    for key in 0..50u64 {
        tree.insert(key, key)?;
    }
    assert_eq!(tree.len()?, 50);
    Ok(())
}
