//! Kernel launch stub.
//!
//! The shim ships the packed launch parameters as
//! `[size_t skip_header][u16 x nb_params][param blob]`; the parser resolves
//! every pointer parameter against the memory manager and the worker
//! substitutes server addresses into the blob before the driver call.
//!
//! Parameter layout:
//!   0: function handle ref
//!   1: grid dims (3 x u32 record)
//!   2: block dims (3 x u32 record)
//!   3: packed launch parameters
//!   4: shared memory bytes (size_t)

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::ApiContext;
use crate::device::Dim3;
use crate::handle::{FunctionMeta, HandleExtra};

use super::{resolve, LaunchEnv, ParseEnv};

fn function_meta(qe: &ApiContext) -> ShadeResult<FunctionMeta> {
    let function = qe.input_handle(0)?;
    match &*function.handle.extra.read() {
        HandleExtra::Function(meta) => Ok(meta.clone()),
        _ => Err(ShadeError::InvalidInput("launch target is not a function".into())),
    }
}

/// Offset of the packed blob past the shim's header.
fn blob_skip(nb_params: u32) -> usize {
    std::mem::size_of::<u64>() + std::mem::size_of::<u16>() * nb_params as usize
}

fn read_ptr(blob: &[u8], offset: u32) -> ShadeResult<u64> {
    blob.get(offset as usize..offset as usize + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| {
            ShadeError::InvalidInput(format!("pointer param at offset {offset} out of blob range"))
        })
}

pub fn launch_kernel_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let function = resolve(env, ResourceTypeId::Function, qe.param_u64(0)?)?;
    qe.input_handles.push(function);
    let meta = function_meta(qe)?;

    Dim3::from_record(qe.param_bytes(1)?)
        .ok_or_else(|| ShadeError::InvalidInput("short grid record".into()))?;
    Dim3::from_record(qe.param_bytes(2)?)
        .ok_or_else(|| ShadeError::InvalidInput("short block record".into()))?;

    let raw = qe.param_bytes(3)?;
    let skip = blob_skip(meta.nb_params);
    let blob = raw
        .get(skip..)
        .ok_or_else(|| {
            ShadeError::InvalidInput(format!(
                "launch blob shorter than its {skip}-byte header ({} bytes)",
                raw.len()
            ))
        })?
        .to_vec();

    // resolve the pointer parameters the metadata declares, in declaration
    // order; the worker walks the same order when substituting
    let mut input_refs = Vec::new();
    for idx in &meta.input_pointer_params {
        let addr = read_ptr(&blob, meta.param_offsets[*idx as usize])?;
        input_refs.push(resolve(env, ResourceTypeId::Memory, addr)?);
    }
    for idx in &meta.inout_pointer_params {
        let addr = read_ptr(&blob, meta.param_offsets[*idx as usize])?;
        let r = resolve(env, ResourceTypeId::Memory, addr)?;
        env.managers
            .get(ResourceTypeId::Memory)
            .write()
            .record_modified(&r.handle);
        qe.inout_handles.push(r);
    }
    for idx in &meta.output_pointer_params {
        let addr = read_ptr(&blob, meta.param_offsets[*idx as usize])?;
        let r = resolve(env, ResourceTypeId::Memory, addr)?;
        env.managers
            .get(ResourceTypeId::Memory)
            .write()
            .record_modified(&r.handle);
        qe.output_handles.push(r);
    }
    qe.input_handles.extend(input_refs);

    qe.param_u64(4)?; // shared memory bytes
    Ok(())
}

pub fn launch_kernel_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let function = qe.input_handle(0)?.clone();
    let meta = function_meta(qe)?;

    let grid = Dim3::from_record(qe.param_bytes(1)?)
        .ok_or_else(|| ShadeError::InvalidInput("short grid record".into()))?;
    let block = Dim3::from_record(qe.param_bytes(2)?)
        .ok_or_else(|| ShadeError::InvalidInput("short block record".into()))?;
    let shared_mem = qe.param_u64(4)? as u32;

    let raw = qe.param_bytes(3)?;
    let skip = blob_skip(meta.nb_params);
    let mut blob = raw[skip..].to_vec();

    // substitute server addresses where the client wrote mock addresses
    for (k, idx) in meta.input_pointer_params.iter().enumerate() {
        let r = qe.input_handle(1 + k)?;
        let off = meta.param_offsets[*idx as usize] as usize;
        blob[off..off + 8].copy_from_slice(&r.server_addr().to_le_bytes());
    }
    for (k, idx) in meta.inout_pointer_params.iter().enumerate() {
        let r = qe.inout_handle(k)?;
        let off = meta.param_offsets[*idx as usize] as usize;
        blob[off..off + 8].copy_from_slice(&r.server_addr().to_le_bytes());
    }
    for (k, idx) in meta.output_pointer_params.iter().enumerate() {
        let r = qe.output_handle(k)?;
        let off = meta.param_offsets[*idx as usize] as usize;
        blob[off..off + 8].copy_from_slice(&r.server_addr().to_le_bytes());
    }

    if let Err(code) = env.device.launch_kernel(
        function.handle.server_addr(),
        grid,
        block,
        shared_mem,
        env.worker_stream,
        &blob,
        &meta.param_offsets,
    ) {
        qe.return_code = code;
    }
    Ok(())
}

/// Build the packed launch-parameter area the way the shim does. Shared by
/// the test suites and the mock-api-call path.
pub fn pack_launch_params(meta_nb_params: u32, param_blob: &[u8]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(blob_skip(meta_nb_params) + param_blob.len());
    packed.extend_from_slice(&(blob_skip(meta_nb_params) as u64).to_le_bytes());
    for i in 0..meta_nb_params {
        packed.extend_from_slice(&(i as u16).to_le_bytes());
    }
    packed.extend_from_slice(param_blob);
    packed
}
