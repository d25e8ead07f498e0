//! Registered-memory directory.
//!
//! Every buffer the transport hands out is registered with the device when it
//! is allocated and indexed here by its page-aligned start. Work requests
//! later carry arbitrary addresses inside those buffers, so [`resolve`]
//! walks back page by page from the address until it meets a region start.
//!
//! [`resolve`]: MemoryDirectory::resolve

use std::collections::HashMap;
use std::sync::Arc;

use netbench_transport::TransportError;
use netbench_types::{page_size, AlignedMemory};
use netbench_verbs::{AccessFlags, MrHandle, Sge, Verbs};

/// A block registered for local and remote access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub addr: usize,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
    pub handle: MrHandle,
}

impl RegisteredRegion {
    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_sub(self.addr) {
            Some(offset) => offset <= self.len && len <= self.len - offset,
            None => false,
        }
    }

    /// Scatter/gather entry for a range inside the region.
    pub fn sge(&self, addr: usize, length: u32) -> Sge {
        Sge {
            addr,
            length,
            lkey: self.lkey,
        }
    }
}

/// Index of live registrations, keyed by page-aligned start address.
pub struct MemoryDirectory<V: Verbs> {
    device: Arc<V>,
    regions: HashMap<usize, RegisteredRegion>,
    page_mask: usize,
    probe_limit: usize,
}

impl<V: Verbs> MemoryDirectory<V> {
    pub fn new(device: Arc<V>, probe_limit: usize) -> Self {
        Self {
            device,
            regions: HashMap::new(),
            page_mask: !(page_size() - 1),
            probe_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Register `memory` with the device and index it.
    pub fn register(
        &mut self,
        memory: &Arc<AlignedMemory>,
    ) -> Result<RegisteredRegion, TransportError> {
        let key = memory.addr() & self.page_mask;
        if self.regions.contains_key(&key) {
            return Err(TransportError::Registration(format!(
                "page {key:#x} is already registered"
            )));
        }
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        let mr = self
            .device
            .reg_mr(memory, access)
            .map_err(|e| TransportError::Registration(e.to_string()))?;
        let region = RegisteredRegion {
            addr: mr.addr,
            len: mr.len,
            lkey: mr.lkey,
            rkey: mr.rkey,
            handle: mr.handle,
        };
        tracing::debug!(
            addr = region.addr,
            len = region.len,
            lkey = region.lkey,
            "registered memory region"
        );
        self.regions.insert(key, region);
        Ok(region)
    }

    /// Find the region covering `[addr, addr + len)`.
    ///
    /// Looks up the page of `addr`, then up to `probe_limit` preceding pages.
    /// The first region start found decides: if it does not cover the range,
    /// the address is unresolved.
    pub fn resolve(&self, addr: usize, len: usize) -> Result<RegisteredRegion, TransportError> {
        let unresolved = || TransportError::UnresolvedAddress { addr, len };
        let step = !self.page_mask + 1;
        let mut key = addr & self.page_mask;
        let mut probes = 0;
        loop {
            if let Some(region) = self.regions.get(&key) {
                return if region.contains(addr, len) {
                    Ok(*region)
                } else {
                    Err(unresolved())
                };
            }
            if probes == self.probe_limit {
                return Err(unresolved());
            }
            key = key.checked_sub(step).ok_or_else(unresolved)?;
            probes += 1;
        }
    }

    /// Deregister every region. Failures are logged and skipped.
    pub fn deregister_all(&mut self) {
        for (_, region) in self.regions.drain() {
            if let Err(e) = self.device.dereg_mr(region.handle) {
                tracing::error!(
                    addr = region.addr,
                    error = %e,
                    "failed to deregister memory region"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbench_verbs::{SoftDevice, SoftFabric};

    fn directory(probe_limit: usize) -> MemoryDirectory<SoftDevice> {
        let fabric = SoftFabric::new();
        MemoryDirectory::new(Arc::new(fabric.open_device("soft_0")), probe_limit)
    }

    fn block(len: usize) -> Arc<AlignedMemory> {
        Arc::new(AlignedMemory::zeroed(len).unwrap())
    }

    #[test]
    fn test_resolve_start_and_interior() {
        let mut dir = directory(1000);
        let mem = block(3 * page_size() + 100);
        let region = dir.register(&mem).unwrap();

        assert_eq!(dir.resolve(mem.addr(), mem.len()).unwrap(), region);
        let interior = mem.addr() + 2 * page_size() + 17;
        assert_eq!(dir.resolve(interior, 64).unwrap(), region);
    }

    #[test]
    fn test_resolve_unregistered() {
        let mut dir = directory(1000);
        let mem = block(64);
        dir.register(&mem).unwrap();
        let other = block(64);
        assert!(matches!(
            dir.resolve(other.addr(), 64),
            Err(TransportError::UnresolvedAddress { .. })
        ));
    }

    #[test]
    fn test_range_past_region_end() {
        let mut dir = directory(1000);
        let mem = block(100);
        dir.register(&mem).unwrap();
        assert!(dir.resolve(mem.addr() + 50, 50).is_ok());
        assert!(dir.resolve(mem.addr() + 50, 51).is_err());
    }

    #[test]
    fn test_probe_limit_bounds_walk() {
        let mut dir = directory(2);
        let mem = block(4 * page_size());
        dir.register(&mem).unwrap();
        assert!(dir.resolve(mem.addr() + 2 * page_size(), 8).is_ok());
        assert!(dir.resolve(mem.addr() + 3 * page_size(), 8).is_err());
    }

    #[test]
    fn test_probe_stops_at_address_zero() {
        let dir = directory(usize::MAX);
        assert!(matches!(
            dir.resolve(page_size() + 1, 1),
            Err(TransportError::UnresolvedAddress { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dir = directory(1000);
        let mem = block(64);
        dir.register(&mem).unwrap();
        assert!(matches!(
            dir.register(&mem),
            Err(TransportError::Registration(_))
        ));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_deregister_all() {
        let fabric = SoftFabric::new();
        let dev = Arc::new(fabric.open_device("soft_0"));
        let mut dir = MemoryDirectory::new(Arc::clone(&dev), 1000);
        let a = block(64);
        let b = block(64);
        dir.register(&a).unwrap();
        dir.register(&b).unwrap();
        assert_eq!(dev.resource_counts().mrs, 2);

        dir.deregister_all();
        assert!(dir.is_empty());
        assert_eq!(dev.resource_counts().mrs, 0);
        assert!(dir.resolve(a.addr(), 1).is_err());
    }
}
