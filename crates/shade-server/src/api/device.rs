//! Device-index stubs. A Device handle acts as an index holder; the manager
//! tracks the latest-used device so APIs that imply "current device" can
//! resolve it.

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use crate::apicxt::{ApiContext, HandleRef};
use crate::handle::HandleExtra;

use super::{LaunchEnv, ParseEnv};

pub fn set_device_parse(env: &ParseEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let ordinal = qe.param_i32(0)?;
    let mut mgr = env.managers.get(ResourceTypeId::Device).write();
    let handle = mgr
        .handles()
        .iter()
        .find(|h| matches!(&*h.extra.read(), HandleExtra::Device { ordinal: o } if *o == ordinal))
        .cloned()
        .ok_or_else(|| ShadeError::NotExist(format!("no device with ordinal {ordinal}")))?;
    mgr.latest_used = Some(handle.clone());
    qe.input_handles.push(HandleRef::new(handle, 0));
    Ok(())
}

pub fn set_device_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    let device = qe.input_handle(0)?.clone();
    let ordinal = match &*device.handle.extra.read() {
        HandleExtra::Device { ordinal } => *ordinal,
        _ => return Err(ShadeError::InvalidInput("device handle without ordinal".into())),
    };
    if let Err(code) = env.device.set_device(ordinal) {
        qe.return_code = code;
    }
    Ok(())
}

pub fn get_device_count_parse(_env: &ParseEnv, _qe: &mut ApiContext) -> ShadeResult<()> {
    Ok(())
}

pub fn get_device_count_launch(env: &LaunchEnv, qe: &mut ApiContext) -> ShadeResult<()> {
    match env.device.device_count() {
        Ok(count) => qe.ret_data[..4].copy_from_slice(&count.to_le_bytes()),
        Err(code) => qe.return_code = code,
    }
    Ok(())
}
