//! cuBLAS library-handle stubs.

use shade_core::ShadeResult;
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::handle::HandleStatus;

use super::{current_context, related_to_context, resolve, LaunchEnv, ParseEnv};

pub fn blas_create_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let ctx = current_context(env)?;
    let handle = env
        .managers
        .get(ResourceTypeId::BlasContext)
        .write()
        .allocate_mocked(&related_to_context(ctx), 0, None, 0)?;
    qe.create_handles.push(handle);
    Ok(())
}

pub fn blas_create_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.create_handle(0)?.clone();
    match env.device.blas_create() {
        Ok(blas) => {
            handle.set_server_addr(blas);
            env.managers
                .get(ResourceTypeId::BlasContext)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn blas_destroy_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let r = resolve(env, ResourceTypeId::BlasContext, qe.param_u64(0)?)?;
    env.managers
        .get(ResourceTypeId::BlasContext)
        .write()
        .mark_status(&r.handle, HandleStatus::DeletePending);
    qe.delete_handles.push(r.handle);
    Ok(())
}

pub fn blas_destroy_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.delete_handle(0)?.clone();
    match env.device.blas_destroy(handle.server_addr()) {
        Ok(()) => {
            env.managers
                .get(ResourceTypeId::BlasContext)
                .write()
                .mark_status(&handle, HandleStatus::Deleted);
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

pub fn blas_set_stream_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let blas = resolve(env, ResourceTypeId::BlasContext, qe.param_u64(0)?)?;
    let stream = resolve(env, ResourceTypeId::Stream, qe.param_u64(1)?)?;
    qe.input_handles.push(blas);
    qe.input_handles.push(stream);
    Ok(())
}

pub fn blas_set_stream_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let blas = qe.input_handle(0)?.clone();
    let stream = qe.input_handle(1)?.clone();
    if let Err(code) = env
        .device
        .blas_set_stream(blas.handle.server_addr(), stream.handle.server_addr())
    {
        qe.return_code = code;
    }
    Ok(())
}
