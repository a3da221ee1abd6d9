#![allow(missing_docs)]

use std::sync::Arc;

use mvtree::{
    primitives::io::{FileStorage, PageStorage},
    storage::TreeOptions,
    types::Result,
    CmvbTree, MvbTree,
};
use tempfile::tempdir;

fn options() -> TreeOptions {
    TreeOptions::default().page_size(1024).cache_pages(8)
}

#[test]
fn multiversion_tree_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.mvt");
    let info_page = {
        let storage: Arc<dyn PageStorage> = Arc::new(FileStorage::open(&path, 1024)?);
        let mut tree = MvbTree::<u64, u64>::create(storage, options())?;
        for key in 0..300u64 {
            tree.insert(key, key)?;
        }
        for key in (0..300u64).step_by(2) {
            tree.delete(&key)?;
        }
        tree.flush()?;
        tree.info_page()
    };
    let storage: Arc<dyn PageStorage> = Arc::new(FileStorage::open(&path, 1024)?);
    let tree = MvbTree::<u64, u64>::open(storage, info_page, options())?;
    assert_eq!(tree.committed_version(), 450);
    assert_eq!(tree.check_consistency(300)?, 300);
    assert_eq!(tree.check_consistency(450)?, 150);
    assert_eq!(tree.get(&10, 300)?, Some(10));
    assert_eq!(tree.get(&10, 450)?, None);
    Ok(())
}

#[test]
fn concurrent_tree_reopens_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cmvbt.mvt");
    let (stable, transient) = {
        let storage: Arc<dyn PageStorage> = Arc::new(FileStorage::open(&path, 1024)?);
        let tree = CmvbTree::<u64, u64>::create(storage, options())?;
        for batch in 0..5u64 {
            let mut txn = tree.begin_transaction();
            for key in 0..10u64 {
                tree.insert(&txn, batch * 10 + key, batch)?;
            }
            tree.commit(&mut txn)?;
        }
        tree.flush()?;
        tree.info_pages()
    };
    let storage: Arc<dyn PageStorage> = Arc::new(FileStorage::open(&path, 1024)?);
    let tree = CmvbTree::<u64, u64>::open(storage, stable, transient, options())?;
    assert_eq!(tree.latest_version(), 5);
    let reader = tree.begin_read_transaction();
    assert_eq!(tree.range(&reader, &0, &100)?.len(), 50);
    assert_eq!(tree.get_at(&42, 3)?, None);
    assert_eq!(tree.get_at(&42, 5)?, Some(4));
    Ok(())
}
