use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;

/// A decoded page resident in the cache.
pub(crate) struct Frame<P> {
    pub page: Arc<RwLock<P>>,
    pub dirty: Arc<AtomicBool>,
    pub pin_count: u32,
}

impl<P> Frame<P> {
    pub fn new(page: P, dirty: bool) -> Self {
        Self {
            page: Arc::new(RwLock::new(page)),
            dirty: Arc::new(AtomicBool::new(dirty)),
            pin_count: 0,
        }
    }
}
