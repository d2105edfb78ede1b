//! Event lifecycle stubs. Event record binds an event handle (output) to a
//! stream handle (input).

use shade_core::ShadeResult;
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::handle::HandleStatus;

use super::{current_context, related_to_context, resolve, LaunchEnv, ParseEnv};

pub fn event_create_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    qe.param_u32(0)?; // flags
    let ctx = current_context(env)?;
    let handle = env
        .managers
        .get(ResourceTypeId::Event)
        .write()
        .allocate_mocked(&related_to_context(ctx), 0, None, 0)?;
    qe.create_handles.push(handle);
    Ok(())
}

pub fn event_create_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let flags = qe.param_u32(0)?;
    let handle = qe.create_handle(0)?.clone();
    match env.device.event_create(flags) {
        Ok(event) => {
            handle.set_server_addr(event);
            env.managers
                .get(ResourceTypeId::Event)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn event_destroy_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let r = resolve(env, ResourceTypeId::Event, qe.param_u64(0)?)?;
    env.managers
        .get(ResourceTypeId::Event)
        .write()
        .mark_status(&r.handle, HandleStatus::DeletePending);
    qe.delete_handles.push(r.handle);
    Ok(())
}

pub fn event_destroy_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.delete_handle(0)?.clone();
    match env.device.event_destroy(handle.server_addr()) {
        Ok(()) => {
            env.managers
                .get(ResourceTypeId::Event)
                .write()
                .mark_status(&handle, HandleStatus::Deleted);
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn event_record_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let event = resolve(env, ResourceTypeId::Event, qe.param_u64(0)?)?;
    let stream = resolve(env, ResourceTypeId::Stream, qe.param_u64(1)?)?;
    qe.output_handles.push(event);
    qe.input_handles.push(stream);
    Ok(())
}

pub fn event_record_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let event = qe.output_handle(0)?.clone();
    let stream = qe.input_handle(0)?.clone();
    if let Err(code) = env
        .device
        .event_record(event.handle.server_addr(), stream.handle.server_addr())
    {
        qe.return_code = code;
    }
    Ok(())
}
