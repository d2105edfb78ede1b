//! Server-side shadow model of device resources.
//!
//! A `Handle` maps one client-visible (mocked) address to the real
//! server-side resource, carries the parent DAG edges used for ordered
//! restore, and owns the versioned checkpoint state.

pub mod manager;
pub mod serialize;
pub mod vtable;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use shade_protocol::resource::ResourceTypeId;

use crate::checkpoint::CheckpointBag;

pub use manager::{HandleManager, Managers, RelatedHandles};

/// Status of the resource behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleStatus {
    /// Resource is live on the device; ops relying on it may launch.
    Active = 0,
    /// Resource released by the client; confirmed by the worker.
    Deleted = 1,
    /// Deletion decided by the parser; the confirming op has not run yet.
    /// Not visible to lookups from this point on.
    DeletePending = 2,
    /// Creation decided by the parser; the create op has not run yet.
    CreatePending = 3,
    /// Resource lost on the device; must be restored before dependent ops.
    Broken = 4,
}

impl HandleStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleStatus::Active,
            1 => HandleStatus::Deleted,
            2 => HandleStatus::DeletePending,
            3 => HandleStatus::CreatePending,
            _ => HandleStatus::Broken,
        }
    }
}

/// Kernel metadata attached to a Function handle; all of it survives
/// serialization so a restored module can be re-bound by name.
#[derive(Debug, Clone, Default)]
pub struct FunctionMeta {
    pub name: String,
    pub nb_params: u32,
    pub param_offsets: Vec<u32>,
    pub param_sizes: Vec<u32>,
    /// Indices of const-pointer parameters.
    pub input_pointer_params: Vec<u32>,
    pub inout_pointer_params: Vec<u32>,
    pub output_pointer_params: Vec<u32>,
    /// Non-pointer parameters that may embed pointers in their values.
    pub suspicious_params: Vec<u32>,
    pub has_verified_params: bool,
    /// (parameter index, byte offset of the embedded pointer).
    pub confirmed_suspicious_params: Vec<(u32, u64)>,
    pub cbank_param_size: u64,
}

/// Per-type payload carried by a handle.
#[derive(Debug, Clone, Default)]
pub enum HandleExtra {
    #[default]
    None,
    Device {
        ordinal: i32,
    },
    Module {
        /// Fatbin image shipped by the client, retained for re-load.
        image: Vec<u8>,
    },
    Function(FunctionMeta),
    Var {
        name: String,
    },
}

/// Shadow of one device resource.
pub struct Handle {
    pub resource_type: ResourceTypeId,
    /// Byte size of the resource (`HANDLE_DEFAULT_SIZE` for sizeless kinds).
    pub size: u64,
    /// Byte size of the replayable state behind the handle (0 if stateless).
    pub state_size: u64,

    client_addr: AtomicU64,
    server_addr: AtomicU64,
    status: AtomicU8,
    dag_vertex_id: AtomicU64,

    pub parents: RwLock<Vec<Arc<Handle>>>,
    pub ckpt_bag: Mutex<Option<CheckpointBag>>,
    /// DAG pc -> host-side bytes injected by host-value-carrying calls,
    /// cached so the call can be replayed.
    pub host_values: Mutex<BTreeMap<u64, Vec<u8>>>,
    pub extra: RwLock<HandleExtra>,
}

impl Handle {
    pub fn new(
        resource_type: ResourceTypeId,
        client_addr: u64,
        size: u64,
        state_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_type,
            size,
            state_size,
            client_addr: AtomicU64::new(client_addr),
            server_addr: AtomicU64::new(0),
            status: AtomicU8::new(HandleStatus::CreatePending as u8),
            dag_vertex_id: AtomicU64::new(0),
            parents: RwLock::new(Vec::new()),
            ckpt_bag: Mutex::new(None),
            host_values: Mutex::new(BTreeMap::new()),
            extra: RwLock::new(HandleExtra::None),
        })
    }

    pub fn client_addr(&self) -> u64 {
        self.client_addr.load(Ordering::Acquire)
    }

    pub(crate) fn set_client_addr(&self, addr: u64) {
        self.client_addr.store(addr, Ordering::Release);
    }

    pub fn server_addr(&self) -> u64 {
        self.server_addr.load(Ordering::Acquire)
    }

    pub fn set_server_addr(&self, addr: u64) {
        self.server_addr.store(addr, Ordering::Release);
    }

    pub fn status(&self) -> HandleStatus {
        HandleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: HandleStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn dag_vertex_id(&self) -> u64 {
        self.dag_vertex_id.load(Ordering::Acquire)
    }

    pub fn set_dag_vertex_id(&self, id: u64) {
        self.dag_vertex_id.store(id, Ordering::Release);
    }

    pub fn record_parent(&self, parent: Arc<Handle>) {
        self.parents.write().push(parent);
    }

    /// Cache a host-side value shipped by a call, keyed by its DAG pc.
    pub fn record_host_value(&self, version: u64, data: &[u8]) {
        self.host_values.lock().insert(version, data.to_vec());
    }

    pub fn latest_host_value(&self) -> Option<(u64, Vec<u8>)> {
        self.host_values
            .lock()
            .iter()
            .next_back()
            .map(|(v, d)| (*v, d.clone()))
    }

    /// Whether `addr` falls inside `[client_addr, client_addr + size)`;
    /// returns the offset from the base when it does.
    pub fn addr_in_range(&self, addr: u64) -> Option<u64> {
        let base = self.client_addr();
        if base <= addr && addr < base + self.size {
            Some(addr - base)
        } else {
            None
        }
    }

    /// Walk this handle and its ancestors, bucketing every non-active one by
    /// depth so restore can run bottom-up. `DeletePending` handles are still
    /// live on the device and are skipped.
    pub fn collect_broken(self: &Arc<Self>, layers: &mut BrokenLayers, layer_id: u16) {
        let status = self.status();
        if status != HandleStatus::Active && status != HandleStatus::DeletePending {
            layers.add(layer_id, self.clone());
        }
        for parent in self.parents.read().iter() {
            parent.collect_broken(layers, layer_id + 1);
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("resource_type", &self.resource_type)
            .field("client_addr", &format_args!("{:#x}", self.client_addr()))
            .field("server_addr", &format_args!("{:#x}", self.server_addr()))
            .field("size", &self.size)
            .field("status", &self.status())
            .field("dag_vertex_id", &self.dag_vertex_id())
            .finish()
    }
}

/// Broken handles bucketed by ancestry depth. Layer 0 holds the handles the
/// failing op touched directly; deeper layers hold their ancestors.
#[derive(Debug, Default)]
pub struct BrokenLayers {
    layers: Vec<Vec<Arc<Handle>>>,
}

impl BrokenLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, layer_id: u16, handle: Arc<Handle>) {
        while self.layers.len() <= layer_id as usize {
            self.layers.push(Vec::new());
        }
        // the same ancestor may be reached through several children
        let layer = &mut self.layers[layer_id as usize];
        if !layer.iter().any(|h| Arc::ptr_eq(h, &handle)) {
            layer.push(handle);
        }
    }

    pub fn nb_layers(&self) -> u16 {
        self.layers.len() as u16
    }

    pub fn layer(&self, layer_id: u16) -> &[Arc<Handle>] {
        &self.layers[layer_id as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.is_empty())
    }

    /// Deepest layer first, so parents restore before children.
    pub fn iter_deepest_first(&self) -> impl Iterator<Item = &Arc<Handle>> {
        self.layers.iter().rev().flatten()
    }
}

/// Parent kinds a resource must be related to at allocation time.
pub fn required_parents(rt: ResourceTypeId) -> &'static [ResourceTypeId] {
    match rt {
        ResourceTypeId::Device => &[],
        ResourceTypeId::Context => &[ResourceTypeId::Device],
        ResourceTypeId::Module => &[ResourceTypeId::Context],
        ResourceTypeId::Function | ResourceTypeId::Var => &[ResourceTypeId::Module],
        ResourceTypeId::Stream | ResourceTypeId::Event | ResourceTypeId::Memory => {
            &[ResourceTypeId::Context]
        }
        ResourceTypeId::BlasContext => &[ResourceTypeId::Context],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_range_is_half_open() {
        let h = Handle::new(ResourceTypeId::Memory, 0x1000, 1024, 1024);
        assert_eq!(h.addr_in_range(0x1000), Some(0));
        assert_eq!(h.addr_in_range(0x1000 + 500), Some(500));
        assert_eq!(h.addr_in_range(0x1000 + 1024), None);
        assert_eq!(h.addr_in_range(0xfff), None);
    }

    #[test]
    fn collect_broken_buckets_by_depth() {
        let device = Handle::new(ResourceTypeId::Device, 0x10, 16, 0);
        device.set_status(HandleStatus::Active);
        let context = Handle::new(ResourceTypeId::Context, 0x20, 16, 0);
        context.record_parent(device.clone());
        context.set_status(HandleStatus::Broken);
        let memory = Handle::new(ResourceTypeId::Memory, 0x30, 4096, 4096);
        memory.record_parent(context.clone());
        memory.set_status(HandleStatus::Broken);

        let mut layers = BrokenLayers::new();
        memory.collect_broken(&mut layers, 0);

        assert_eq!(layers.nb_layers(), 2);
        assert_eq!(layers.layer(0).len(), 1);
        assert!(Arc::ptr_eq(&layers.layer(0)[0], &memory));
        assert_eq!(layers.layer(1).len(), 1);
        assert!(Arc::ptr_eq(&layers.layer(1)[0], &context));

        // deepest-first iteration restores the context before the memory
        let order: Vec<_> = layers.iter_deepest_first().cloned().collect();
        assert!(Arc::ptr_eq(&order[0], &context));
        assert!(Arc::ptr_eq(&order[1], &memory));
    }

    #[test]
    fn delete_pending_is_skipped_by_collector() {
        let h = Handle::new(ResourceTypeId::Stream, 0x40, 16, 0);
        h.set_status(HandleStatus::DeletePending);
        let mut layers = BrokenLayers::new();
        h.collect_broken(&mut layers, 0);
        assert!(layers.is_empty());
    }

    #[test]
    fn host_value_latest_wins() {
        let h = Handle::new(ResourceTypeId::Memory, 0x50, 64, 64);
        h.record_host_value(3, &[1, 2]);
        h.record_host_value(9, &[3, 4]);
        h.record_host_value(5, &[5, 6]);
        let (v, data) = h.latest_host_value().unwrap();
        assert_eq!(v, 9);
        assert_eq!(data, vec![3, 4]);
    }
}
