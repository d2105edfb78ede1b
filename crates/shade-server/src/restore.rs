//! Checkpoint-image dump and client restore.
//!
//! Image layout: magic, then per manager (in restore order) a tag, a handle
//! count, and the serialized handles; a small index (total handle count and
//! per-manager counts) is appended at the end.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use crate::checkpoint::CkptStation;
use crate::device::GpuDevice;
use crate::handle::serialize::{deserialize_handle, serialize_handle, ByteReader, HandleImage};
use crate::handle::{vtable, Handle, HandleStatus, Managers};

pub const IMAGE_MAGIC: u32 = 0x3049_4453; // "SDI0"

fn is_live(status: HandleStatus) -> bool {
    !matches!(status, HandleStatus::Deleted | HandleStatus::DeletePending)
}

/// Serialize every live handle of every manager into the station.
pub fn dump_client(managers: &Managers, station: &mut CkptStation) {
    station.load_value_u32(IMAGE_MAGIC);

    let mut index: Vec<(u32, u64)> = Vec::new();
    let mut total = 0u64;

    for (rt, mgr_lock) in managers.iter() {
        let mgr = mgr_lock.read();
        let live: Vec<Arc<Handle>> = mgr
            .handles()
            .iter()
            .filter(|h| is_live(h.status()))
            .cloned()
            .collect();

        station.load_value_u32(rt.to_tag());
        station.load_value_u64(live.len() as u64);
        for handle in &live {
            let bytes = serialize_handle(handle);
            station.load_value_u64(bytes.len() as u64);
            station.load_chunk(bytes);
        }
        index.push((rt.to_tag(), live.len() as u64));
        total += live.len() as u64;
    }

    // appended index: total handle count plus per-manager counts
    station.load_value_u64(total);
    for (tag, count) in index {
        station.load_value_u32(tag);
        station.load_value_u64(count);
    }

    debug!(total, byte_size = station.byte_size(), "dumped client image");
}

/// Decoded image: handle images grouped per resource kind, in restore order.
pub struct ClientImage {
    pub sections: Vec<(ResourceTypeId, Vec<HandleImage>)>,
}

impl ClientImage {
    pub fn parse(data: &[u8]) -> ShadeResult<Self> {
        let mut r = ByteReader::new(data);
        if r.u32()? != IMAGE_MAGIC {
            return Err(ShadeError::InvalidInput("bad checkpoint image magic".into()));
        }

        let mut sections = Vec::new();
        let mut total = 0u64;
        for expected in ResourceTypeId::RESTORE_ORDER {
            let tag = r.u32()?;
            if tag != expected.to_tag() {
                return Err(ShadeError::InvalidInput(format!(
                    "image section out of order: expected {expected:?}, got tag {tag}"
                )));
            }
            let count = r.u64()?;
            let mut images = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let len = r.u64()? as usize;
                let bytes = r.bytes(len)?;
                images.push(deserialize_handle(&bytes)?);
            }
            total += count;
            sections.push((expected, images));
        }

        let recorded_total = r.u64()?;
        if recorded_total != total {
            return Err(ShadeError::InvalidInput(format!(
                "image index disagrees: {recorded_total} recorded, {total} read"
            )));
        }

        Ok(Self { sections })
    }
}

/// Rebuild a client's handle state from an image and re-create every
/// resource on the device, parents before children.
pub fn restore_client(
    managers: &Managers,
    device: &dyn GpuDevice,
    data: &[u8],
) -> ShadeResult<()> {
    let image = ClientImage::parse(data)?;
    instantiate_images(managers, device, image.sections, &HashMap::new(), &HashMap::new())
}

pub fn restore_client_from_file(
    managers: &Managers,
    device: &dyn GpuDevice,
    path: &str,
) -> ShadeResult<()> {
    let data = std::fs::read(path)
        .map_err(|e| ShadeError::Failed(format!("failed to read image {path}: {e}")))?;
    restore_client(managers, device, &data)
}

/// Instantiate decoded handle images into the managers and restore them
/// bottom-up. `staged_memory` (client_addr -> (version, bytes)) overrides a
/// memory handle's embedded state when newer; `memory_twins` maps client
/// addresses to pre-allocated device twins on a migration target.
pub fn instantiate_images(
    managers: &Managers,
    device: &dyn GpuDevice,
    sections: Vec<(ResourceTypeId, Vec<HandleImage>)>,
    staged_memory: &HashMap<u64, (u64, Vec<u8>)>,
    memory_twins: &HashMap<u64, u64>,
) -> ShadeResult<()> {
    // instantiate, merging with pre-provisioned handles (device/context) on
    // address collision
    let mut by_vertex: HashMap<u64, Arc<Handle>> = HashMap::new();
    let mut restore_list: Vec<(ResourceTypeId, Arc<Handle>, Vec<u64>)> = Vec::new();

    for (rt, images) in sections {
        for img in images {
            let handle = {
                let mut mgr = managers.get(rt).write();
                match mgr.adopt(img.handle.clone()) {
                    Ok(()) => img.handle.clone(),
                    Err(ShadeError::AlreadyExist(_)) => {
                        // a pre-provisioned handle (device, default context)
                        // already covers this address; restore onto it
                        let (existing, _) = mgr.get_by_client_addr(img.handle.client_addr())?;
                        existing
                    }
                    Err(e) => return Err(e),
                }
            };

            // staged migration state wins over the embedded checkpoint
            if rt == ResourceTypeId::Memory {
                if let Some((version, bytes)) = staged_memory.get(&handle.client_addr()) {
                    let mut bag = handle.ckpt_bag.lock();
                    let bag = bag.get_or_insert_with(Default::default);
                    if bag.latest_version().map_or(true, |v| *version >= v) {
                        bag.insert(*version, bytes.clone(), 0);
                    }
                }
            }

            by_vertex.insert(img.handle.dag_vertex_id(), handle.clone());
            restore_list.push((rt, handle, img.parent_vertex_ids));
        }
    }

    // rebind parents by vertex id
    for (_, handle, parent_ids) in &restore_list {
        if !handle.parents.read().is_empty() {
            continue; // merged pre-provisioned handle keeps its parents
        }
        for pid in parent_ids {
            let parent = by_vertex.get(pid).ok_or_else(|| {
                ShadeError::InvalidInput(format!("image references unknown parent vertex {pid}"))
            })?;
            handle.record_parent(parent.clone());
        }
    }

    // bottom-up: the section order guarantees parents restore first
    for (rt, handle, _) in &restore_list {
        if handle.status() == HandleStatus::Active {
            continue;
        }
        if *rt == ResourceTypeId::Memory {
            if let Some(twin) = memory_twins.get(&handle.client_addr()) {
                restore_memory_onto_twin(handle, *twin, device)?;
                continue;
            }
        }
        (vtable::ops(*rt).restore)(handle, device)?;
    }

    // refresh the latest-used slots consumed by implicit-target APIs
    for rt in [ResourceTypeId::Device, ResourceTypeId::Context] {
        let mut mgr = managers.get(rt).write();
        if mgr.latest_used.is_none() {
            mgr.latest_used = mgr.handles().first().cloned();
        }
    }

    info!(restored = restore_list.len(), "client state restored");
    Ok(())
}

/// Replay a memory handle onto a device twin allocated during remote-malloc.
fn restore_memory_onto_twin(
    handle: &Arc<Handle>,
    twin: u64,
    device: &dyn GpuDevice,
) -> ShadeResult<()> {
    handle.set_server_addr(twin);
    let state = {
        let bag = handle.ckpt_bag.lock();
        bag.as_ref().and_then(|b| b.get_latest()).map(|(_, s)| s.data.clone())
    };
    if let Some(state) = state {
        device
            .memcpy_h2d(twin, &state)
            .map_err(|c| ShadeError::Failed(format!("twin replay failed: {c}")))?;
    }
    handle.set_status(HandleStatus::Active);
    Ok(())
}
