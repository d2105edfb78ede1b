//! Memory lifecycle and copy stubs.
//!
//! Memory is the passthrough resource: the device-assigned address doubles
//! as the client-visible one and is registered lazily after the create call
//! runs on the worker.

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::handle::HandleStatus;

use super::{current_context, related_to_context, resolve, LaunchEnv, ParseEnv};

// ── cuda_malloc ─────────────────────────────────────────────────

pub fn malloc_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let size = qe.param_u64(0)?;
    if size == 0 {
        return Err(ShadeError::InvalidInput("zero-byte allocation".into()));
    }
    let ctx = current_context(env)?;
    let handle = env
        .managers
        .get(ResourceTypeId::Memory)
        .write()
        .allocate_mocked(&related_to_context(ctx), size, None, size)?;
    qe.create_handles.push(handle);
    Ok(())
}

pub fn malloc_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let size = qe.param_u64(0)?;
    let handle = qe.create_handle(0)?.clone();

    match env.device.malloc(size) {
        Ok(ptr) => {
            let mut mgr = env.managers.get(ResourceTypeId::Memory).write();
            mgr.set_passthrough_addr(&handle, ptr)?;
            mgr.mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => {
            qe.return_code = code;
            qe.ret_data[..8].fill(0);
        }
    }
    Ok(())
}

// ── cuda_free ───────────────────────────────────────────────────

pub fn free_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let addr = qe.param_u64(0)?;
    let r = resolve(env, ResourceTypeId::Memory, addr)?;
    if r.offset != 0 {
        return Err(ShadeError::InvalidInput(format!(
            "free of interior pointer {addr:#x} (offset {})",
            r.offset
        )));
    }
    env.managers
        .get(ResourceTypeId::Memory)
        .write()
        .mark_status(&r.handle, HandleStatus::DeletePending);
    qe.delete_handles.push(r.handle);
    Ok(())
}

pub fn free_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.delete_handle(0)?.clone();
    match env.device.free(handle.server_addr()) {
        Ok(()) => {
            env.managers
                .get(ResourceTypeId::Memory)
                .write()
                .mark_status(&handle, HandleStatus::Deleted);
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

// ── cuda_memcpy (sync) ──────────────────────────────────────────

pub fn memcpy_h2d_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let payload = qe.param_bytes(1)?.to_vec();

    // cache the host-side value for later replay
    dst.handle.record_host_value(qe.inst_pc, &payload);
    env.managers
        .get(ResourceTypeId::Memory)
        .write()
        .record_modified(&dst.handle);
    qe.inout_handles.push(dst);
    Ok(())
}

pub fn memcpy_h2d_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = qe.inout_handle(0)?.clone();
    let src = qe.param_bytes(1)?;
    if let Err(code) = env.device.memcpy_h2d(dst.server_addr(), src) {
        qe.return_code = code;
    }
    Ok(())
}

pub fn memcpy_d2h_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let src = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let len = qe.param_u64(1)?;
    if qe.ret_data.len() < len as usize {
        qe.ret_data.resize(len as usize, 0);
    }
    qe.input_handles.push(src);
    Ok(())
}

pub fn memcpy_d2h_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let src = qe.input_handle(0)?.clone();
    let len = qe.param_u64(1)? as usize;
    if let Err(code) = env.device.memcpy_d2h(&mut qe.ret_data[..len], src.server_addr()) {
        qe.return_code = code;
    }
    Ok(())
}

pub fn memcpy_d2d_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let src = resolve(env, ResourceTypeId::Memory, qe.param_u64(1)?)?;
    qe.param_u64(2)?;
    env.managers
        .get(ResourceTypeId::Memory)
        .write()
        .record_modified(&dst.handle);
    qe.output_handles.push(dst);
    qe.input_handles.push(src);
    Ok(())
}

pub fn memcpy_d2d_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = qe.output_handle(0)?.clone();
    let src = qe.input_handle(0)?.clone();
    let len = qe.param_u64(2)?;
    if let Err(code) = env.device.memcpy_d2d(dst.server_addr(), src.server_addr(), len) {
        qe.return_code = code;
    }
    Ok(())
}

// ── cuda_memcpy (async) ─────────────────────────────────────────

pub fn memcpy_h2d_async_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let payload = qe.param_bytes(1)?.to_vec();
    let stream = resolve(env, ResourceTypeId::Stream, qe.param_u64(2)?)?;

    dst.handle.record_host_value(qe.inst_pc, &payload);
    env.managers
        .get(ResourceTypeId::Memory)
        .write()
        .record_modified(&dst.handle);
    qe.inout_handles.push(dst);
    qe.input_handles.push(stream);
    Ok(())
}

pub fn memcpy_h2d_async_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = qe.inout_handle(0)?.clone();
    let stream = qe.input_handle(0)?.clone();
    let src = qe.param_bytes(1)?;
    if let Err(code) = env
        .device
        .memcpy_h2d_async(dst.server_addr(), src, stream.handle.server_addr())
    {
        qe.return_code = code;
    }
    Ok(())
}

pub fn memcpy_d2h_async_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let src = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let len = qe.param_u64(1)?;
    let stream = resolve(env, ResourceTypeId::Stream, qe.param_u64(2)?)?;
    if qe.ret_data.len() < len as usize {
        qe.ret_data.resize(len as usize, 0);
    }
    qe.input_handles.push(src);
    qe.input_handles.push(stream);
    Ok(())
}

pub fn memcpy_d2h_async_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let src = qe.input_handle(0)?.clone();
    let stream = qe.input_handle(1)?.clone();
    let len = qe.param_u64(1)? as usize;
    let stream_addr = stream.handle.server_addr();

    if let Err(code) = env
        .device
        .memcpy_d2h_async(&mut qe.ret_data[..len], src.server_addr(), stream_addr)
    {
        qe.return_code = code;
        return Ok(());
    }
    // a device-to-host copy must be synchronized under remoting before the
    // result ships back
    if let Err(code) = env.device.stream_synchronize(stream_addr) {
        qe.return_code = code;
    }
    Ok(())
}

pub fn memcpy_d2d_async_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = resolve(env, ResourceTypeId::Memory, qe.param_u64(0)?)?;
    let src = resolve(env, ResourceTypeId::Memory, qe.param_u64(1)?)?;
    qe.param_u64(2)?;
    let stream = resolve(env, ResourceTypeId::Stream, qe.param_u64(3)?)?;
    env.managers
        .get(ResourceTypeId::Memory)
        .write()
        .record_modified(&dst.handle);
    qe.output_handles.push(dst);
    qe.input_handles.push(src);
    qe.input_handles.push(stream);
    Ok(())
}

pub fn memcpy_d2d_async_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let dst = qe.output_handle(0)?.clone();
    let src = qe.input_handle(0)?.clone();
    let stream = qe.input_handle(1)?.clone();
    let len = qe.param_u64(2)?;
    if let Err(code) = env.device.memcpy_d2d_async(
        dst.server_addr(),
        src.server_addr(),
        len,
        stream.handle.server_addr(),
    ) {
        qe.return_code = code;
    }
    Ok(())
}
