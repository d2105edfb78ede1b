//! Device access layer.
//!
//! The worker talks to the accelerator through the `GpuDevice` trait. The
//! production implementation (`CudaDevice`) loads the real driver with
//! `libloading`; when no driver is present the daemon falls back to a
//! deterministic host-memory simulator (`SimDevice`), which is also what the
//! test suites run against.

use std::sync::Arc;

use tracing::{info, warn};

pub mod cuda;
pub mod sim;

pub use cuda::CudaDevice;
pub use sim::SimDevice;

/// Device-native result: the error side is the raw return code the client
/// ultimately observes.
pub type DevResult<T> = Result<T, i32>;

pub const DEV_SUCCESS: i32 = 0;
pub const DEV_ERR_INVALID_VALUE: i32 = 1;
pub const DEV_ERR_OUT_OF_MEMORY: i32 = 2;
pub const DEV_ERR_NOT_INITIALIZED: i32 = 3;
pub const DEV_ERR_NOT_FOUND: i32 = 500;
pub const DEV_ERR_NOT_SUPPORTED: i32 = 801;

/// Grid or block dimensions of a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Decode from the 3 x u32 record the shim ships.
    pub fn from_record(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        Some(Self {
            x: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            y: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            z: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

/// The subset of the driver surface the replay worker needs.
///
/// Handles cross this boundary as raw `u64` device addresses; the shadow
/// model above it owns all bookkeeping.
pub trait GpuDevice: Send + Sync {
    fn device_count(&self) -> DevResult<i32>;
    fn set_device(&self, ordinal: i32) -> DevResult<()>;

    fn ctx_create(&self, ordinal: i32) -> DevResult<u64>;
    fn ctx_destroy(&self, ctx: u64) -> DevResult<()>;

    fn malloc(&self, size: u64) -> DevResult<u64>;
    fn free(&self, dptr: u64) -> DevResult<()>;
    fn memcpy_h2d(&self, dst: u64, src: &[u8]) -> DevResult<()>;
    fn memcpy_d2h(&self, dst: &mut [u8], src: u64) -> DevResult<()>;
    fn memcpy_d2d(&self, dst: u64, src: u64, len: u64) -> DevResult<()>;
    fn memcpy_h2d_async(&self, dst: u64, src: &[u8], stream: u64) -> DevResult<()>;
    fn memcpy_d2h_async(&self, dst: &mut [u8], src: u64, stream: u64) -> DevResult<()>;
    fn memcpy_d2d_async(&self, dst: u64, src: u64, len: u64, stream: u64) -> DevResult<()>;

    fn stream_create(&self) -> DevResult<u64>;
    fn stream_destroy(&self, stream: u64) -> DevResult<()>;
    fn stream_synchronize(&self, stream: u64) -> DevResult<()>;

    fn event_create(&self, flags: u32) -> DevResult<u64>;
    fn event_destroy(&self, event: u64) -> DevResult<()>;
    fn event_record(&self, event: u64, stream: u64) -> DevResult<()>;

    fn module_load(&self, image: &[u8]) -> DevResult<u64>;
    fn module_unload(&self, module: u64) -> DevResult<()>;
    fn module_get_function(&self, module: u64, name: &str) -> DevResult<u64>;
    /// Returns (device pointer, byte size) of a module-scope variable.
    fn module_get_global(&self, module: u64, name: &str) -> DevResult<(u64, u64)>;

    /// `arg_blob` is the packed parameter area; `arg_offsets[i]` locates the
    /// i-th argument inside it.
    #[allow(clippy::too_many_arguments)]
    fn launch_kernel(
        &self,
        func: u64,
        grid: Dim3,
        block: Dim3,
        shared_mem: u32,
        stream: u64,
        arg_blob: &[u8],
        arg_offsets: &[u32],
    ) -> DevResult<()>;

    fn blas_create(&self) -> DevResult<u64>;
    fn blas_destroy(&self, handle: u64) -> DevResult<()>;
    fn blas_set_stream(&self, handle: u64, stream: u64) -> DevResult<()>;
}

/// Load the real driver if present, otherwise fall back to the simulator.
pub fn probe() -> Arc<dyn GpuDevice> {
    match CudaDevice::load() {
        Ok(dev) => {
            info!("CUDA driver initialized");
            Arc::new(dev)
        }
        Err(e) => {
            warn!("CUDA driver not available: {e} - using simulator");
            Arc::new(SimDevice::new())
        }
    }
}
