//! Per-resource-kind operation table.
//!
//! Handles are a uniform tagged struct; everything type-specific (native
//! re-creation, state capture, extra serialization) is dispatched through
//! this table, indexed by `ResourceTypeId`.

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use super::serialize::{ByteReader, ByteWriter};
use super::{FunctionMeta, Handle, HandleExtra, HandleStatus};
use crate::checkpoint::CheckpointBag;
use crate::device::GpuDevice;

pub struct ResourceOps {
    /// Re-issue the native creation of a broken/pending handle and replay
    /// its captured state; marks the handle `Active` on success.
    pub restore: fn(&Handle, &dyn GpuDevice) -> ShadeResult<()>,
    /// Capture the device-resident state into the checkpoint bag.
    pub checkpoint: fn(&Handle, &dyn GpuDevice, u64, u64) -> ShadeResult<()>,
    pub serialize_extra: fn(&Handle, &mut ByteWriter),
    pub deserialize_extra: fn(&Handle, &mut ByteReader) -> ShadeResult<()>,
    pub init_ckpt_bag: fn(&Handle),
}

pub fn ops(rt: ResourceTypeId) -> &'static ResourceOps {
    match rt {
        ResourceTypeId::Device => &DEVICE_OPS,
        ResourceTypeId::Context => &CONTEXT_OPS,
        ResourceTypeId::Module => &MODULE_OPS,
        ResourceTypeId::Function => &FUNCTION_OPS,
        ResourceTypeId::Var => &VAR_OPS,
        ResourceTypeId::Stream => &STREAM_OPS,
        ResourceTypeId::Event => &EVENT_OPS,
        ResourceTypeId::Memory => &MEMORY_OPS,
        ResourceTypeId::BlasContext => &BLAS_OPS,
    }
}

// ── shared pieces ───────────────────────────────────────────────

fn no_extra(_h: &Handle, _w: &mut ByteWriter) {}

fn no_extra_read(_h: &Handle, _r: &mut ByteReader) -> ShadeResult<()> {
    Ok(())
}

fn no_ckpt_bag(_h: &Handle) {}

fn stateful_ckpt_bag(h: &Handle) {
    let mut bag = h.ckpt_bag.lock();
    if bag.is_none() {
        *bag = Some(CheckpointBag::new());
    }
}

fn no_checkpoint(
    _h: &Handle,
    _dev: &dyn GpuDevice,
    _version: u64,
    _stream: u64,
) -> ShadeResult<()> {
    Err(ShadeError::NotImplemented("checkpoint on stateless resource"))
}

fn dev_err(op: &str, code: i32) -> ShadeError {
    ShadeError::Failed(format!("device {op} failed: {code}"))
}

fn single_parent(h: &Handle, expected: ResourceTypeId) -> ShadeResult<std::sync::Arc<Handle>> {
    let parents = h.parents.read();
    if parents.len() != 1 {
        return Err(ShadeError::InvalidInput(format!(
            "{:?} handle has {} parents, expected 1",
            h.resource_type,
            parents.len()
        )));
    }
    let parent = parents[0].clone();
    if parent.resource_type != expected {
        return Err(ShadeError::InvalidInput(format!(
            "{:?} handle parents on {:?}, expected {expected:?}",
            h.resource_type, parent.resource_type
        )));
    }
    Ok(parent)
}

/// Bytes to replay on restore: the latest device checkpoint, falling back
/// to the latest host-injected value.
fn replay_state(h: &Handle) -> Option<Vec<u8>> {
    let bag = h.ckpt_bag.lock();
    if let Some((_, slot)) = bag.as_ref().and_then(|b| b.get_latest()) {
        return Some(slot.data.clone());
    }
    drop(bag);
    h.latest_host_value().map(|(_, data)| data)
}

// ── Device ──────────────────────────────────────────────────────

fn device_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let ordinal = match &*h.extra.read() {
        HandleExtra::Device { ordinal } => *ordinal,
        _ => return Err(ShadeError::InvalidInput("device handle without ordinal".into())),
    };
    dev.set_device(ordinal).map_err(|c| dev_err("set_device", c))?;
    // ordinal is offset by one so a live device never reads as nil
    h.set_server_addr(ordinal as u64 + 1);
    h.set_status(HandleStatus::Active);
    Ok(())
}

fn device_serialize(h: &Handle, w: &mut ByteWriter) {
    let ordinal = match &*h.extra.read() {
        HandleExtra::Device { ordinal } => *ordinal,
        _ => 0,
    };
    w.i32(ordinal);
}

fn device_deserialize(h: &Handle, r: &mut ByteReader) -> ShadeResult<()> {
    let ordinal = r.i32()?;
    *h.extra.write() = HandleExtra::Device { ordinal };
    Ok(())
}

static DEVICE_OPS: ResourceOps = ResourceOps {
    restore: device_restore,
    checkpoint: no_checkpoint,
    serialize_extra: device_serialize,
    deserialize_extra: device_deserialize,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Context ─────────────────────────────────────────────────────

fn context_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let device = single_parent(h, ResourceTypeId::Device)?;
    let ordinal = match &*device.extra.read() {
        HandleExtra::Device { ordinal } => *ordinal,
        _ => 0,
    };
    let ctx = dev.ctx_create(ordinal).map_err(|c| dev_err("ctx_create", c))?;
    h.set_server_addr(ctx);
    h.set_status(HandleStatus::Active);
    Ok(())
}

static CONTEXT_OPS: ResourceOps = ResourceOps {
    restore: context_restore,
    checkpoint: no_checkpoint,
    serialize_extra: no_extra,
    deserialize_extra: no_extra_read,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Module ──────────────────────────────────────────────────────

fn module_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let image = match &*h.extra.read() {
        HandleExtra::Module { image } => image.clone(),
        _ => return Err(ShadeError::InvalidInput("module handle without image".into())),
    };
    let module = dev.module_load(&image).map_err(|c| dev_err("module_load", c))?;
    h.set_server_addr(module);
    h.set_status(HandleStatus::Active);
    Ok(())
}

fn module_serialize(h: &Handle, w: &mut ByteWriter) {
    match &*h.extra.read() {
        HandleExtra::Module { image } => {
            w.u64(image.len() as u64);
            w.bytes(image);
        }
        _ => w.u64(0),
    }
}

fn module_deserialize(h: &Handle, r: &mut ByteReader) -> ShadeResult<()> {
    let len = r.u64()? as usize;
    let image = r.bytes(len)?;
    *h.extra.write() = HandleExtra::Module { image };
    Ok(())
}

static MODULE_OPS: ResourceOps = ResourceOps {
    restore: module_restore,
    checkpoint: no_checkpoint,
    serialize_extra: module_serialize,
    deserialize_extra: module_deserialize,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Function ────────────────────────────────────────────────────

fn function_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let module = single_parent(h, ResourceTypeId::Module)?;
    let name = match &*h.extra.read() {
        HandleExtra::Function(meta) if !meta.name.is_empty() => meta.name.clone(),
        _ => return Err(ShadeError::InvalidInput("function handle without name".into())),
    };
    let func = dev
        .module_get_function(module.server_addr(), &name)
        .map_err(|c| dev_err("module_get_function", c))?;
    h.set_server_addr(func);
    h.set_status(HandleStatus::Active);
    Ok(())
}

fn function_serialize(h: &Handle, w: &mut ByteWriter) {
    let extra = h.extra.read();
    let meta = match &*extra {
        HandleExtra::Function(meta) => meta,
        _ => {
            w.str("");
            w.u32(0);
            for _ in 0..4 {
                w.u64(0);
            }
            w.bool(false);
            w.u64(0);
            w.u64(0);
            return;
        }
    };

    w.str(&meta.name);
    w.u32(meta.nb_params);
    for off in &meta.param_offsets {
        w.u32(*off);
    }
    for size in &meta.param_sizes {
        w.u32(*size);
    }
    for vec in [
        &meta.input_pointer_params,
        &meta.inout_pointer_params,
        &meta.output_pointer_params,
        &meta.suspicious_params,
    ] {
        w.u64(vec.len() as u64);
        for idx in vec.iter() {
            w.u32(*idx);
        }
    }
    w.bool(meta.has_verified_params);
    w.u64(meta.confirmed_suspicious_params.len() as u64);
    for (idx, offset) in &meta.confirmed_suspicious_params {
        w.u32(*idx);
        w.u64(*offset);
    }
    w.u64(meta.cbank_param_size);
}

fn function_deserialize(h: &Handle, r: &mut ByteReader) -> ShadeResult<()> {
    let mut meta = FunctionMeta {
        name: r.str()?,
        nb_params: r.u32()?,
        ..Default::default()
    };

    for _ in 0..meta.nb_params {
        meta.param_offsets.push(r.u32()?);
    }
    for _ in 0..meta.nb_params {
        meta.param_sizes.push(r.u32()?);
    }

    let nb = r.u64()?;
    for _ in 0..nb {
        meta.input_pointer_params.push(r.u32()?);
    }
    let nb = r.u64()?;
    for _ in 0..nb {
        meta.inout_pointer_params.push(r.u32()?);
    }
    let nb = r.u64()?;
    for _ in 0..nb {
        meta.output_pointer_params.push(r.u32()?);
    }
    let nb = r.u64()?;
    for _ in 0..nb {
        meta.suspicious_params.push(r.u32()?);
    }
    meta.has_verified_params = r.bool()?;
    let nb = r.u64()?;
    for _ in 0..nb {
        let idx = r.u32()?;
        let offset = r.u64()?;
        meta.confirmed_suspicious_params.push((idx, offset));
    }
    meta.cbank_param_size = r.u64()?;

    *h.extra.write() = HandleExtra::Function(meta);
    Ok(())
}

static FUNCTION_OPS: ResourceOps = ResourceOps {
    restore: function_restore,
    checkpoint: no_checkpoint,
    serialize_extra: function_serialize,
    deserialize_extra: function_deserialize,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Var ─────────────────────────────────────────────────────────

fn var_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let module = single_parent(h, ResourceTypeId::Module)?;
    let name = match &*h.extra.read() {
        HandleExtra::Var { name } => name.clone(),
        _ => return Err(ShadeError::InvalidInput("var handle without name".into())),
    };
    let (addr, _) = dev
        .module_get_global(module.server_addr(), &name)
        .map_err(|c| dev_err("module_get_global", c))?;
    h.set_server_addr(addr);
    if let Some(state) = replay_state(h) {
        dev.memcpy_h2d(addr, &state).map_err(|c| dev_err("memcpy_h2d", c))?;
    }
    h.set_status(HandleStatus::Active);
    Ok(())
}

fn var_checkpoint(h: &Handle, dev: &dyn GpuDevice, version: u64, stream: u64) -> ShadeResult<()> {
    stateful_ckpt_bag(h);
    let mut buf = vec![0u8; h.state_size as usize];
    dev.memcpy_d2h_async(&mut buf, h.server_addr(), stream)
        .map_err(|c| dev_err("memcpy_d2h", c))?;
    h.ckpt_bag
        .lock()
        .as_mut()
        .expect("ckpt bag initialized above")
        .insert(version, buf, stream);
    Ok(())
}

fn var_serialize(h: &Handle, w: &mut ByteWriter) {
    match &*h.extra.read() {
        HandleExtra::Var { name } => w.str(name),
        _ => w.str(""),
    }
}

fn var_deserialize(h: &Handle, r: &mut ByteReader) -> ShadeResult<()> {
    let name = r.str()?;
    *h.extra.write() = HandleExtra::Var { name };
    Ok(())
}

static VAR_OPS: ResourceOps = ResourceOps {
    restore: var_restore,
    checkpoint: var_checkpoint,
    serialize_extra: var_serialize,
    deserialize_extra: var_deserialize,
    init_ckpt_bag: stateful_ckpt_bag,
};

// ── Stream ──────────────────────────────────────────────────────

fn stream_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let stream = dev.stream_create().map_err(|c| dev_err("stream_create", c))?;
    h.set_server_addr(stream);
    h.set_status(HandleStatus::Active);
    Ok(())
}

static STREAM_OPS: ResourceOps = ResourceOps {
    restore: stream_restore,
    checkpoint: no_checkpoint,
    serialize_extra: no_extra,
    deserialize_extra: no_extra_read,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Event ───────────────────────────────────────────────────────

fn event_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let event = dev.event_create(0).map_err(|c| dev_err("event_create", c))?;
    h.set_server_addr(event);
    h.set_status(HandleStatus::Active);
    Ok(())
}

static EVENT_OPS: ResourceOps = ResourceOps {
    restore: event_restore,
    checkpoint: no_checkpoint,
    serialize_extra: no_extra,
    deserialize_extra: no_extra_read,
    init_ckpt_bag: no_ckpt_bag,
};

// ── Memory ──────────────────────────────────────────────────────

fn memory_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let addr = dev.malloc(h.size).map_err(|c| dev_err("malloc", c))?;
    h.set_server_addr(addr);
    if let Some(state) = replay_state(h) {
        dev.memcpy_h2d(addr, &state).map_err(|c| dev_err("memcpy_h2d", c))?;
    }
    h.set_status(HandleStatus::Active);
    Ok(())
}

fn memory_checkpoint(h: &Handle, dev: &dyn GpuDevice, version: u64, stream: u64) -> ShadeResult<()> {
    stateful_ckpt_bag(h);
    let mut buf = vec![0u8; h.state_size as usize];
    dev.memcpy_d2h_async(&mut buf, h.server_addr(), stream)
        .map_err(|c| dev_err("memcpy_d2h", c))?;
    h.ckpt_bag
        .lock()
        .as_mut()
        .expect("ckpt bag initialized above")
        .insert(version, buf, stream);
    Ok(())
}

static MEMORY_OPS: ResourceOps = ResourceOps {
    restore: memory_restore,
    checkpoint: memory_checkpoint,
    serialize_extra: no_extra,
    deserialize_extra: no_extra_read,
    init_ckpt_bag: stateful_ckpt_bag,
};

// ── cuBLAS context ──────────────────────────────────────────────

fn blas_restore(h: &Handle, dev: &dyn GpuDevice) -> ShadeResult<()> {
    let handle = dev.blas_create().map_err(|c| dev_err("blas_create", c))?;
    h.set_server_addr(handle);
    h.set_status(HandleStatus::Active);
    Ok(())
}

static BLAS_OPS: ResourceOps = ResourceOps {
    restore: blas_restore,
    checkpoint: no_checkpoint,
    serialize_extra: no_extra,
    deserialize_extra: no_extra_read,
    init_ckpt_bag: no_ckpt_bag,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;

    #[test]
    fn memory_checkpoint_then_restore_round_trips_bytes() {
        let dev = SimDevice::new();
        let addr = dev.malloc(64).unwrap();
        dev.memcpy_h2d(addr, &[7u8; 64]).unwrap();

        let h = Handle::new(ResourceTypeId::Memory, addr, 64, 64);
        h.set_server_addr(addr);
        h.set_status(HandleStatus::Active);

        (ops(ResourceTypeId::Memory).checkpoint)(&h, &dev, 1, 0).unwrap();
        dev.free(addr).unwrap();
        h.set_status(HandleStatus::Broken);

        (ops(ResourceTypeId::Memory).restore)(&h, &dev).unwrap();
        assert_eq!(h.status(), HandleStatus::Active);

        let mut back = vec![0u8; 64];
        dev.memcpy_d2h(&mut back, h.server_addr()).unwrap();
        assert_eq!(back, vec![7u8; 64]);
    }

    #[test]
    fn function_restore_requires_module_parent() {
        let dev = SimDevice::new();
        let h = Handle::new(ResourceTypeId::Function, 0x100, 16, 0);
        *h.extra.write() = HandleExtra::Function(FunctionMeta {
            name: "kern".to_string(),
            ..Default::default()
        });

        // no parent at all
        assert!((ops(ResourceTypeId::Function).restore)(&h, &dev).is_err());

        // wrong parent kind
        let stream = Handle::new(ResourceTypeId::Stream, 0x40, 16, 0);
        h.record_parent(stream);
        assert!((ops(ResourceTypeId::Function).restore)(&h, &dev).is_err());
    }

    #[test]
    fn function_restore_rebinds_by_name() {
        let dev = SimDevice::new();
        let module_addr = dev.module_load(b"fatbin").unwrap();
        let module = Handle::new(ResourceTypeId::Module, 0x80, 16, 0);
        module.set_server_addr(module_addr);
        module.set_status(HandleStatus::Active);

        let h = Handle::new(ResourceTypeId::Function, 0x100, 16, 0);
        h.record_parent(module);
        *h.extra.write() = HandleExtra::Function(FunctionMeta {
            name: "kern".to_string(),
            ..Default::default()
        });

        (ops(ResourceTypeId::Function).restore)(&h, &dev).unwrap();
        assert_eq!(h.status(), HandleStatus::Active);
        assert_ne!(h.server_addr(), 0);
    }
}
