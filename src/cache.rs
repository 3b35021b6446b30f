//! Cache coherence around DMA transfers.
//!
//! Every buffer the hardware reads is cleaned before a transfer starts, every
//! buffer it writes is invalidated after completion. Ranges are widened to
//! whole cache lines.

use crate::overlay::Overlay;

/// Data cache line size of the memory subsystem.
pub const CACHE_LINE: usize = 32;

/// Data-cache maintenance primitives provided by the platform.
pub trait DataCache: Send + Sync {
    /// Writes back dirty lines covering `addr..addr + len`.
    fn sync(&self, addr: usize, len: usize);

    /// Drops lines covering `addr..addr + len`.
    fn invalidate(&self, addr: usize, len: usize);
}

impl<C> DataCache for &C
where
    C: DataCache + ?Sized,
{
    fn sync(&self, addr: usize, len: usize) {
        (**self).sync(addr, len)
    }

    fn invalidate(&self, addr: usize, len: usize) {
        (**self).invalidate(addr, len)
    }
}

#[cfg(feature = "alloc")]
impl<C> DataCache for alloc::sync::Arc<C>
where
    C: DataCache + ?Sized,
{
    fn sync(&self, addr: usize, len: usize) {
        (**self).sync(addr, len)
    }

    fn invalidate(&self, addr: usize, len: usize) {
        (**self).invalidate(addr, len)
    }
}

/// For memory that is not cached or kept coherent by hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl DataCache for NoCache {
    fn sync(&self, _addr: usize, _len: usize) {}

    fn invalidate(&self, _addr: usize, _len: usize) {}
}

/// Widens `addr..addr + len` to whole cache lines.
pub const fn align_to_lines(addr: usize, len: usize) -> (usize, usize) {
    let offset = addr % CACHE_LINE;
    let start = addr - offset;
    let len = (len + offset).div_ceil(CACHE_LINE) * CACHE_LINE;

    (start, len)
}

pub struct CacheAdapter<C> {
    cache: C,
}

impl<C> CacheAdapter<C>
where
    C: DataCache,
{
    pub const fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn flush(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }

        let (start, len) = align_to_lines(addr, len);
        log::trace!("cache sync {start:#x} +{len}");
        self.cache.sync(start, len);
    }

    pub fn invalidate(&self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }

        let (start, len) = align_to_lines(addr, len);
        log::trace!("cache invalidate {start:#x} +{len}");
        self.cache.invalidate(start, len);
    }

    pub fn flush_overlay(&self, overlay: &Overlay) {
        self.flush(overlay.fbmem, overlay.fblen);
    }

    pub fn invalidate_overlay(&self, overlay: &Overlay) {
        self.invalidate(overlay.fbmem, overlay.fblen);
    }

    pub fn inner(&self) -> &C {
        &self.cache
    }
}
