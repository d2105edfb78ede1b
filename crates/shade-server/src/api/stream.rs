//! Stream lifecycle stubs. Streams are non-passthrough: the manager assigns
//! the mock address at parse time, the worker fills in the device address.

use shade_core::ShadeResult;
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::handle::HandleStatus;

use super::{current_context, related_to_context, resolve, LaunchEnv, ParseEnv};

pub fn stream_create_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let ctx = current_context(env)?;
    let handle = env
        .managers
        .get(ResourceTypeId::Stream)
        .write()
        .allocate_mocked(&related_to_context(ctx), 0, None, 0)?;
    qe.create_handles.push(handle);
    Ok(())
}

pub fn stream_create_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.create_handle(0)?.clone();
    match env.device.stream_create() {
        Ok(stream) => {
            handle.set_server_addr(stream);
            env.managers
                .get(ResourceTypeId::Stream)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn stream_destroy_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let r = resolve(env, ResourceTypeId::Stream, qe.param_u64(0)?)?;
    env.managers
        .get(ResourceTypeId::Stream)
        .write()
        .mark_status(&r.handle, HandleStatus::DeletePending);
    qe.delete_handles.push(r.handle);
    Ok(())
}

pub fn stream_destroy_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.delete_handle(0)?.clone();
    match env.device.stream_destroy(handle.server_addr()) {
        Ok(()) => {
            env.managers
                .get(ResourceTypeId::Stream)
                .write()
                .mark_status(&handle, HandleStatus::Deleted);
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn stream_synchronize_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let r = resolve(env, ResourceTypeId::Stream, qe.param_u64(0)?)?;
    qe.input_handles.push(r);
    Ok(())
}

pub fn stream_synchronize_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let stream = qe.input_handle(0)?.clone();
    if let Err(code) = env.device.stream_synchronize(stream.handle.server_addr()) {
        qe.return_code = code;
    }
    Ok(())
}
