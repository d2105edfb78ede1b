//! One manager per resource kind: owns the handle vector, the ordered
//! client-address map, the deleted-address archive, and the modified set
//! consumed by the checkpoint engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::{ResourceTypeId, HANDLE_DEFAULT_SIZE, MOCK_ADDR_BASE, MOCK_ADDR_END};

use super::{required_parents, Handle, HandleStatus};

/// Related handles passed into allocation, typed by resource kind.
pub type RelatedHandles = BTreeMap<ResourceTypeId, Vec<Arc<Handle>>>;

pub struct HandleManager {
    pub resource_type: ResourceTypeId,
    passthrough: bool,
    base_ptr: u64,
    end_addr: u64,

    handles: Vec<Arc<Handle>>,
    /// Ordered by mock address; greatest-lower-bound serves offset lookups.
    address_map: BTreeMap<u64, Arc<Handle>>,
    /// Archive of addresses whose handles went `DeletePending`/`Deleted`.
    deleted_map: HashMap<u64, Arc<Handle>>,
    /// Handles modified since the last checkpoint tick, keyed by address.
    modified: BTreeMap<u64, Arc<Handle>>,

    /// Last-used handle of this kind (e.g. the current device).
    pub latest_used: Option<Arc<Handle>>,
}

impl HandleManager {
    pub fn new(resource_type: ResourceTypeId) -> Self {
        Self {
            resource_type,
            passthrough: resource_type.is_passthrough(),
            base_ptr: MOCK_ADDR_BASE,
            end_addr: MOCK_ADDR_END,
            handles: Vec::new(),
            address_map: BTreeMap::new(),
            deleted_map: HashMap::new(),
            modified: BTreeMap::new(),
            latest_used: None,
        }
    }

    /// Allocate a new mocked resource.
    ///
    /// Non-passthrough handles receive the next mock address (or
    /// `expected_addr`) and enter the address map immediately; passthrough
    /// handles register their address later via `set_passthrough_addr`.
    pub fn allocate_mocked(
        &mut self,
        related: &RelatedHandles,
        size: u64,
        expected_addr: Option<u64>,
        state_size: u64,
    ) -> ShadeResult<Arc<Handle>> {
        let mut parents: Vec<Arc<Handle>> = Vec::new();
        for required in required_parents(self.resource_type) {
            match related.get(required).and_then(|v| v.first()) {
                Some(parent) => parents.push(parent.clone()),
                None => {
                    return Err(ShadeError::InvalidInput(format!(
                        "no {required:?} parent provided for {:?} allocation",
                        self.resource_type
                    )))
                }
            }
        }

        let size = if size == 0 { HANDLE_DEFAULT_SIZE } else { size };

        let handle = if self.passthrough {
            Handle::new(self.resource_type, 0, size, state_size)
        } else {
            if let Some(expected) = expected_addr {
                self.base_ptr = expected;
            }
            if self.end_addr - self.base_ptr < size {
                return Err(ShadeError::Drain {
                    requested: size,
                    remaining: self.end_addr - self.base_ptr,
                });
            }
            let handle = Handle::new(self.resource_type, self.base_ptr, size, state_size);
            self.address_map.insert(self.base_ptr, handle.clone());
            self.base_ptr += size;
            handle
        };

        for parent in parents {
            handle.record_parent(parent);
        }

        debug!(
            resource_type = ?self.resource_type,
            client_addr = format_args!("{:#x}", handle.client_addr()),
            size,
            "allocated mocked resource"
        );

        self.handles.push(handle.clone());
        Ok(handle)
    }

    /// Register the device-assigned address of a passthrough handle, making
    /// it visible to lookups.
    pub fn set_passthrough_addr(&mut self, handle: &Arc<Handle>, addr: u64) -> ShadeResult<()> {
        if self.address_map.contains_key(&addr) {
            return Err(ShadeError::AlreadyExist(format!(
                "passthrough address {addr:#x} already mapped"
            )));
        }
        handle.set_client_addr(addr);
        handle.set_server_addr(addr);
        self.address_map.insert(addr, handle.clone());
        Ok(())
    }

    /// Look up a handle by client-side address: exact hit or
    /// greatest-lower-bound range match against `[base, base + size)`.
    pub fn get_by_client_addr(&self, addr: u64) -> ShadeResult<(Arc<Handle>, u64)> {
        if let Some((base, handle)) = self.address_map.range(..=addr).next_back() {
            debug_assert!(!matches!(
                handle.status(),
                HandleStatus::Deleted | HandleStatus::DeletePending
            ));
            if let Some(offset) = handle.addr_in_range(addr) {
                debug_assert_eq!(handle.client_addr(), *base);
                return Ok((handle.clone(), offset));
            }
        }
        Err(ShadeError::NotExist(format!(
            "no {:?} handle covers address {addr:#x}",
            self.resource_type
        )))
    }

    /// Perform a status transition. `DeletePending`/`Deleted` also move the
    /// address-map entry into the deleted archive, so lookups stop returning
    /// the handle while late in-flight ops can still be diagnosed.
    pub fn mark_status(&mut self, handle: &Arc<Handle>, status: HandleStatus) {
        match status {
            HandleStatus::DeletePending | HandleStatus::Deleted => {
                let addr = handle.client_addr();
                if let Some(entry) = self.address_map.remove(&addr) {
                    self.deleted_map.insert(addr, entry);
                }
                self.modified.remove(&addr);
            }
            _ => {}
        }
        handle.set_status(status);
        debug!(
            resource_type = ?self.resource_type,
            client_addr = format_args!("{:#x}", handle.client_addr()),
            ?status,
            "marked handle status"
        );
    }

    /// Archived handle for a deleted address, if any.
    pub fn get_deleted(&self, addr: u64) -> Option<Arc<Handle>> {
        self.deleted_map.get(&addr).cloned()
    }

    pub fn record_modified(&mut self, handle: &Arc<Handle>) {
        self.modified.insert(handle.client_addr(), handle.clone());
    }

    /// Take and clear the modified set.
    pub fn drain_modified(&mut self) -> Vec<Arc<Handle>> {
        let drained: Vec<_> = self.modified.values().cloned().collect();
        self.modified.clear();
        drained
    }

    pub fn modified_is_empty(&self) -> bool {
        self.modified.is_empty()
    }

    pub fn nb_handles(&self) -> u64 {
        self.handles.len() as u64
    }

    pub fn handles(&self) -> &[Arc<Handle>] {
        &self.handles
    }

    /// Adopt an already-constructed handle during restore, re-registering
    /// its client address.
    pub fn adopt(&mut self, handle: Arc<Handle>) -> ShadeResult<()> {
        let addr = handle.client_addr();
        if addr != 0 {
            if self.address_map.contains_key(&addr) {
                return Err(ShadeError::AlreadyExist(format!(
                    "address {addr:#x} already mapped during restore"
                )));
            }
            self.address_map.insert(addr, handle.clone());
            // keep the bump cursor past every restored mock address
            if !self.passthrough && addr + handle.size > self.base_ptr {
                self.base_ptr = addr + handle.size;
            }
        }
        self.handles.push(handle);
        Ok(())
    }
}

/// All handle managers of one client, in a fixed kind order.
pub struct Managers {
    map: BTreeMap<ResourceTypeId, RwLock<HandleManager>>,
}

impl Managers {
    pub fn new_full() -> Arc<Self> {
        let mut map = BTreeMap::new();
        for rt in ResourceTypeId::RESTORE_ORDER {
            map.insert(rt, RwLock::new(HandleManager::new(rt)));
        }
        Arc::new(Self { map })
    }

    pub fn get(&self, rt: ResourceTypeId) -> &RwLock<HandleManager> {
        self.map
            .get(&rt)
            .unwrap_or_else(|| panic!("no manager registered for {rt:?}"))
    }

    /// Managers in restore order (parents before children).
    pub fn iter(&self) -> impl Iterator<Item = (ResourceTypeId, &RwLock<HandleManager>)> {
        ResourceTypeId::RESTORE_ORDER
            .into_iter()
            .map(move |rt| (rt, self.get(rt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_context() -> (RelatedHandles, Arc<Handle>) {
        let device = Handle::new(ResourceTypeId::Device, 0x10, 16, 0);
        device.set_status(HandleStatus::Active);
        let context = Handle::new(ResourceTypeId::Context, 0x20, 16, 0);
        context.record_parent(device);
        context.set_status(HandleStatus::Active);
        let mut related = RelatedHandles::new();
        related.insert(ResourceTypeId::Context, vec![context.clone()]);
        (related, context)
    }

    #[test]
    fn mock_addresses_are_monotonic() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Stream);
        let a = mgr.allocate_mocked(&related, 0, None, 0).unwrap();
        let b = mgr.allocate_mocked(&related, 0, None, 0).unwrap();
        assert_eq!(a.client_addr(), MOCK_ADDR_BASE);
        assert_eq!(b.client_addr(), MOCK_ADDR_BASE + HANDLE_DEFAULT_SIZE);
        assert_eq!(a.status(), HandleStatus::CreatePending);
    }

    #[test]
    fn allocation_drains_at_range_end() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Stream);
        let remaining = MOCK_ADDR_END - MOCK_ADDR_BASE;

        // one byte past the range fails
        let err = mgr
            .allocate_mocked(&related, remaining + 1, None, 0)
            .unwrap_err();
        assert!(matches!(err, ShadeError::Drain { .. }));

        // exactly the remaining range succeeds
        mgr.allocate_mocked(&related, remaining, None, 0).unwrap();
    }

    #[test]
    fn lookup_by_offset_is_half_open() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Memory);
        let h = mgr.allocate_mocked(&related, 1024, None, 1024).unwrap();
        mgr.set_passthrough_addr(&h, 0x7000).unwrap();

        let (found, offset) = mgr.get_by_client_addr(0x7000 + 500).unwrap();
        assert!(Arc::ptr_eq(&found, &h));
        assert_eq!(offset, 500);

        assert!(matches!(
            mgr.get_by_client_addr(0x7000 + 1024),
            Err(ShadeError::NotExist(_))
        ));
    }

    #[test]
    fn delete_pending_leaves_the_map() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Stream);
        let h = mgr.allocate_mocked(&related, 0, None, 0).unwrap();
        let addr = h.client_addr();

        mgr.mark_status(&h, HandleStatus::Active);
        assert!(mgr.get_by_client_addr(addr).is_ok());

        mgr.mark_status(&h, HandleStatus::DeletePending);
        assert!(matches!(
            mgr.get_by_client_addr(addr),
            Err(ShadeError::NotExist(_))
        ));
        assert!(mgr.get_deleted(addr).is_some());

        // marking Deleted again is idempotent
        mgr.mark_status(&h, HandleStatus::Deleted);
        assert_eq!(h.status(), HandleStatus::Deleted);
        assert!(mgr.get_deleted(addr).is_some());
    }

    #[test]
    fn allocation_requires_typed_parent() {
        let mut mgr = HandleManager::new(ResourceTypeId::Function);
        let err = mgr
            .allocate_mocked(&RelatedHandles::new(), 0, None, 0)
            .unwrap_err();
        assert!(matches!(err, ShadeError::InvalidInput(_)));
    }

    #[test]
    fn modified_set_drains_once() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Memory);
        let h = mgr.allocate_mocked(&related, 64, None, 64).unwrap();
        mgr.set_passthrough_addr(&h, 0x9000).unwrap();

        mgr.record_modified(&h);
        mgr.record_modified(&h);
        let drained = mgr.drain_modified();
        assert_eq!(drained.len(), 1);
        assert!(mgr.modified_is_empty());
    }

    #[test]
    fn interval_keys_are_disjoint() {
        let (related, _ctx) = with_context();
        let mut mgr = HandleManager::new(ResourceTypeId::Stream);
        for _ in 0..8 {
            mgr.allocate_mocked(&related, 32, None, 0).unwrap();
        }
        let mut prev_end = 0u64;
        for h in mgr.handles() {
            assert!(h.client_addr() >= prev_end);
            prev_end = h.client_addr() + h.size;
        }
    }
}
