//! The API-context work element flowing RPC -> Parser -> Worker -> RPC.

use std::sync::Arc;

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::api::ParamDesc;

use crate::device::DEV_SUCCESS;
use crate::handle::Handle;

/// A resolved handle reference plus the offset of the referenced address
/// inside the handle's range.
#[derive(Debug, Clone)]
pub struct HandleRef {
    pub handle: Arc<Handle>,
    pub offset: u64,
}

impl HandleRef {
    pub fn new(handle: Arc<Handle>, offset: u64) -> Self {
        Self { handle, offset }
    }

    /// Server-side address the worker substitutes for the client address.
    pub fn server_addr(&self) -> u64 {
        self.handle.server_addr() + self.offset
    }
}

/// One in-flight API call.
pub struct ApiContext {
    pub api_id: u64,
    pub uuid: u64,
    /// Monotonic per-client program counter, assigned at enqueue.
    pub inst_pc: u64,
    pub is_sync: bool,
    pub params: Vec<ParamDesc>,

    // handle references resolved by the parser
    pub input_handles: Vec<HandleRef>,
    pub inout_handles: Vec<HandleRef>,
    pub output_handles: Vec<HandleRef>,
    pub create_handles: Vec<Arc<Handle>>,
    pub delete_handles: Vec<Arc<Handle>>,

    pub ret_data: Vec<u8>,
    /// Device-native return code forwarded verbatim to the client.
    pub return_code: i32,
    /// Parser-detected failure; such QEs never reach the worker.
    pub parse_error: Option<ShadeError>,
}

impl ApiContext {
    pub fn new(
        api_id: u64,
        uuid: u64,
        inst_pc: u64,
        is_sync: bool,
        params: Vec<ParamDesc>,
        ret_data_len: u64,
    ) -> Box<Self> {
        Box::new(Self {
            api_id,
            uuid,
            inst_pc,
            is_sync,
            params,
            input_handles: Vec::new(),
            inout_handles: Vec::new(),
            output_handles: Vec::new(),
            create_handles: Vec::new(),
            delete_handles: Vec::new(),
            ret_data: vec![0u8; ret_data_len as usize],
            return_code: DEV_SUCCESS,
            parse_error: None,
        })
    }

    fn param(&self, idx: usize) -> ShadeResult<&ParamDesc> {
        self.params.get(idx).ok_or_else(|| {
            ShadeError::InvalidInput(format!(
                "api {:#x}: missing parameter {idx} (got {})",
                self.api_id,
                self.params.len()
            ))
        })
    }

    pub fn param_bytes(&self, idx: usize) -> ShadeResult<&[u8]> {
        Ok(&self.param(idx)?.payload)
    }

    pub fn param_declared_size(&self, idx: usize) -> ShadeResult<u64> {
        Ok(self.param(idx)?.declared_size)
    }

    pub fn param_u64(&self, idx: usize) -> ShadeResult<u64> {
        let bytes = self.param_bytes(idx)?;
        let arr: [u8; 8] = bytes.get(..8).and_then(|b| b.try_into().ok()).ok_or_else(|| {
            ShadeError::InvalidInput(format!("api {:#x}: parameter {idx} too short for u64", self.api_id))
        })?;
        Ok(u64::from_le_bytes(arr))
    }

    pub fn param_u32(&self, idx: usize) -> ShadeResult<u32> {
        let bytes = self.param_bytes(idx)?;
        let arr: [u8; 4] = bytes.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(|| {
            ShadeError::InvalidInput(format!("api {:#x}: parameter {idx} too short for u32", self.api_id))
        })?;
        Ok(u32::from_le_bytes(arr))
    }

    pub fn param_i32(&self, idx: usize) -> ShadeResult<i32> {
        Ok(self.param_u32(idx)? as i32)
    }

    pub fn input_handle(&self, idx: usize) -> ShadeResult<&HandleRef> {
        self.input_handles
            .get(idx)
            .ok_or_else(|| ShadeError::InvalidInput(format!("missing input handle {idx}")))
    }

    pub fn inout_handle(&self, idx: usize) -> ShadeResult<&HandleRef> {
        self.inout_handles
            .get(idx)
            .ok_or_else(|| ShadeError::InvalidInput(format!("missing inout handle {idx}")))
    }

    pub fn output_handle(&self, idx: usize) -> ShadeResult<&HandleRef> {
        self.output_handles
            .get(idx)
            .ok_or_else(|| ShadeError::InvalidInput(format!("missing output handle {idx}")))
    }

    pub fn create_handle(&self, idx: usize) -> ShadeResult<&Arc<Handle>> {
        self.create_handles
            .get(idx)
            .ok_or_else(|| ShadeError::InvalidInput(format!("missing create handle {idx}")))
    }

    pub fn delete_handle(&self, idx: usize) -> ShadeResult<&Arc<Handle>> {
        self.delete_handles
            .get(idx)
            .ok_or_else(|| ShadeError::InvalidInput(format!("missing delete handle {idx}")))
    }

    pub fn device_failed(&self) -> bool {
        self.return_code != DEV_SUCCESS
    }

    /// Every handle this QE touches, used by the failure path.
    pub fn referenced_handles(&self) -> Vec<Arc<Handle>> {
        let mut all: Vec<Arc<Handle>> = Vec::new();
        for r in self
            .input_handles
            .iter()
            .chain(self.inout_handles.iter())
            .chain(self.output_handles.iter())
        {
            all.push(r.handle.clone());
        }
        all.extend(self.create_handles.iter().cloned());
        all.extend(self.delete_handles.iter().cloned());
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_accessors_validate_length() {
        let qe = ApiContext::new(
            0x100,
            1,
            0,
            true,
            vec![ParamDesc::value_u64(4096), ParamDesc::buffer_in(vec![1, 2])],
            8,
        );
        assert_eq!(qe.param_u64(0).unwrap(), 4096);
        assert_eq!(qe.param_bytes(1).unwrap(), &[1, 2]);
        assert!(matches!(qe.param_u64(1), Err(ShadeError::InvalidInput(_))));
        assert!(matches!(qe.param_u64(5), Err(ShadeError::InvalidInput(_))));
        assert_eq!(qe.ret_data.len(), 8);
    }
}
