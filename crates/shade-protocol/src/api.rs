use serde::{Deserialize, Serialize};

/// How an API affects the resource graph. Mirrors the `type` field of the
/// code-gen support file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKind {
    CreateResource,
    DeleteResource,
    GetResource,
    SetResource,
}

/// Kind of one call parameter as described on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ParamKind {
    /// Plain value passed by copy (integers, dims, flags).
    Value,
    /// Host buffer shipped to the daemon (e.g. memcpy source, fatbin image).
    BufferIn,
    /// Host buffer shipped both ways.
    BufferInOut,
    /// Host buffer produced by the daemon (returned via ret_data).
    BufferOut,
    /// A client-side mock address referencing an existing handle.
    HandleRef,
}

/// One parameter of a remoted call.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ParamDesc {
    pub kind: ParamKind,
    /// Size the caller declared for this parameter (may exceed payload len
    /// for out-buffers).
    pub declared_size: u64,
    pub payload: Vec<u8>,
}

impl ParamDesc {
    pub fn value_u64(v: u64) -> Self {
        Self {
            kind: ParamKind::Value,
            declared_size: 8,
            payload: v.to_le_bytes().to_vec(),
        }
    }

    pub fn value_u32(v: u32) -> Self {
        Self {
            kind: ParamKind::Value,
            declared_size: 4,
            payload: v.to_le_bytes().to_vec(),
        }
    }

    pub fn value_i32(v: i32) -> Self {
        Self {
            kind: ParamKind::Value,
            declared_size: 4,
            payload: v.to_le_bytes().to_vec(),
        }
    }

    pub fn buffer_in(data: Vec<u8>) -> Self {
        Self {
            kind: ParamKind::BufferIn,
            declared_size: data.len() as u64,
            payload: data,
        }
    }

    pub fn handle_ref(client_addr: u64) -> Self {
        Self {
            kind: ParamKind::HandleRef,
            declared_size: 8,
            payload: client_addr.to_le_bytes().to_vec(),
        }
    }
}

/// Identifiers of the remoted entry points.
///
/// The full production table is emitted by the code generator; this is the
/// hand-maintained set the daemon implements.
pub mod api_id {
    pub const CUDA_MALLOC: u64 = 0x100;
    pub const CUDA_FREE: u64 = 0x101;
    pub const CUDA_MEMCPY_H2D: u64 = 0x102;
    pub const CUDA_MEMCPY_D2H: u64 = 0x103;
    pub const CUDA_MEMCPY_D2D: u64 = 0x104;
    pub const CUDA_MEMCPY_H2D_ASYNC: u64 = 0x105;
    pub const CUDA_MEMCPY_D2H_ASYNC: u64 = 0x106;
    pub const CUDA_MEMCPY_D2D_ASYNC: u64 = 0x107;

    pub const CUDA_LAUNCH_KERNEL: u64 = 0x110;

    pub const CUDA_SET_DEVICE: u64 = 0x120;
    pub const CUDA_GET_DEVICE_COUNT: u64 = 0x121;

    pub const CUDA_STREAM_CREATE: u64 = 0x130;
    pub const CUDA_STREAM_DESTROY: u64 = 0x131;
    pub const CUDA_STREAM_SYNCHRONIZE: u64 = 0x132;

    pub const CUDA_EVENT_CREATE: u64 = 0x140;
    pub const CUDA_EVENT_DESTROY: u64 = 0x141;
    pub const CUDA_EVENT_RECORD: u64 = 0x142;

    pub const CUDA_MODULE_LOAD: u64 = 0x150;
    pub const CUDA_MODULE_GET_FUNCTION: u64 = 0x151;
    pub const CUDA_MODULE_GET_GLOBAL: u64 = 0x152;

    pub const CUBLAS_CREATE: u64 = 0x160;
    pub const CUBLAS_DESTROY: u64 = 0x161;
    pub const CUBLAS_SET_STREAM: u64 = 0x162;
}
