//! Module, function, and module-scope variable stubs.
//!
//! The fatbin image ships inline with the load call and is retained on the
//! module handle so tear/restore can re-load it on a fresh device context.
//! Function metadata arrives with the get-function call and is serialized
//! into the handle for checkpoint/restore.

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::handle::{FunctionMeta, HandleExtra, HandleStatus, RelatedHandles};

use super::{current_context, decode_u32_array, related_to_context, resolve, LaunchEnv, ParseEnv};

// ── cuda_module_load ────────────────────────────────────────────

pub fn module_load_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let image = qe.param_bytes(0)?.to_vec();
    if image.is_empty() {
        return Err(ShadeError::InvalidInput("empty fatbin image".into()));
    }
    let ctx = current_context(env)?;
    let handle = env
        .managers
        .get(ResourceTypeId::Module)
        .write()
        .allocate_mocked(&related_to_context(ctx), 0, None, 0)?;
    *handle.extra.write() = HandleExtra::Module { image };
    qe.create_handles.push(handle);
    Ok(())
}

pub fn module_load_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let handle = qe.create_handle(0)?.clone();
    let image = match &*handle.extra.read() {
        HandleExtra::Module { image } => image.clone(),
        _ => return Err(ShadeError::InvalidInput("module handle without image".into())),
    };
    match env.device.module_load(&image) {
        Ok(module) => {
            handle.set_server_addr(module);
            env.managers
                .get(ResourceTypeId::Module)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

// ── cuda_module_get_function ────────────────────────────────────
//
// Parameter layout:
//   0: module handle ref
//   1: kernel name bytes
//   2: nb_params (u32)
//   3: param offsets (u32 array)
//   4: param sizes (u32 array)
//   5: input pointer param indices (u32 array)
//   6: inout pointer param indices (u32 array)
//   7: output pointer param indices (u32 array)

pub fn module_get_function_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let module = resolve(env, ResourceTypeId::Module, qe.param_u64(0)?)?;
    let name = String::from_utf8(qe.param_bytes(1)?.to_vec())
        .map_err(|_| ShadeError::InvalidInput("non-utf8 kernel name".into()))?;
    if name.is_empty() {
        return Err(ShadeError::InvalidInput("empty kernel name".into()));
    }

    let nb_params = qe.param_u32(2)?;
    let param_offsets = decode_u32_array(qe.param_bytes(3)?)?;
    let param_sizes = decode_u32_array(qe.param_bytes(4)?)?;
    if param_offsets.len() != nb_params as usize || param_sizes.len() != nb_params as usize {
        return Err(ShadeError::InvalidInput(format!(
            "kernel {name}: declared {nb_params} params, got {} offsets / {} sizes",
            param_offsets.len(),
            param_sizes.len()
        )));
    }
    let input_pointer_params = decode_u32_array(qe.param_bytes(5)?)?;
    let inout_pointer_params = decode_u32_array(qe.param_bytes(6)?)?;
    let output_pointer_params = decode_u32_array(qe.param_bytes(7)?)?;
    for idx in input_pointer_params
        .iter()
        .chain(&inout_pointer_params)
        .chain(&output_pointer_params)
    {
        if *idx >= nb_params {
            return Err(ShadeError::InvalidInput(format!(
                "kernel {name}: pointer param index {idx} out of range"
            )));
        }
    }

    let mut related = RelatedHandles::new();
    related.insert(ResourceTypeId::Module, vec![module.handle.clone()]);
    let handle = env
        .managers
        .get(ResourceTypeId::Function)
        .write()
        .allocate_mocked(&related, 0, None, 0)?;
    *handle.extra.write() = HandleExtra::Function(FunctionMeta {
        name,
        nb_params,
        param_offsets,
        param_sizes,
        input_pointer_params,
        inout_pointer_params,
        output_pointer_params,
        ..Default::default()
    });

    qe.input_handles.push(module);
    qe.create_handles.push(handle);
    Ok(())
}

pub fn module_get_function_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let module = qe.input_handle(0)?.clone();
    let handle = qe.create_handle(0)?.clone();
    let name = match &*handle.extra.read() {
        HandleExtra::Function(meta) => meta.name.clone(),
        _ => return Err(ShadeError::InvalidInput("function handle without metadata".into())),
    };
    match env.device.module_get_function(module.handle.server_addr(), &name) {
        Ok(func) => {
            handle.set_server_addr(func);
            env.managers
                .get(ResourceTypeId::Function)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}

// ── cuda_module_get_global ──────────────────────────────────────

pub fn module_get_global_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let module = resolve(env, ResourceTypeId::Module, qe.param_u64(0)?)?;
    let name = String::from_utf8(qe.param_bytes(1)?.to_vec())
        .map_err(|_| ShadeError::InvalidInput("non-utf8 variable name".into()))?;
    if name.is_empty() {
        return Err(ShadeError::InvalidInput("empty variable name".into()));
    }
    let state_size = qe.param_u64(2)?;

    let mut related = RelatedHandles::new();
    related.insert(ResourceTypeId::Module, vec![module.handle.clone()]);
    let handle = env
        .managers
        .get(ResourceTypeId::Var)
        .write()
        .allocate_mocked(&related, state_size.max(1), None, state_size)?;
    *handle.extra.write() = HandleExtra::Var { name };

    qe.input_handles.push(module);
    qe.create_handles.push(handle);
    Ok(())
}

pub fn module_get_global_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let module = qe.input_handle(0)?.clone();
    let handle = qe.create_handle(0)?.clone();
    let name = match &*handle.extra.read() {
        HandleExtra::Var { name } => name.clone(),
        _ => return Err(ShadeError::InvalidInput("var handle without name".into())),
    };
    match env.device.module_get_global(module.handle.server_addr(), &name) {
        Ok((addr, size)) => {
            handle.set_server_addr(addr);
            env.managers
                .get(ResourceTypeId::Var)
                .write()
                .mark_status(&handle, HandleStatus::Active);
            qe.ret_data[..8].copy_from_slice(&handle.client_addr().to_le_bytes());
            if qe.ret_data.len() >= 16 {
                qe.ret_data[8..16].copy_from_slice(&size.to_le_bytes());
            }
        }
        Err(code) => qe.return_code = code,
    }
    Ok(())
}
