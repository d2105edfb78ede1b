//! Dynamic loading of the real CUDA driver library.
//!
//! Loads `libcuda.so.1` (and optionally `libcublas.so`) with `libloading`
//! and adapts the raw driver entry points to the `GpuDevice` trait. Pointer
//! bookkeeping stays above this layer; here a device address is just a `u64`.

use std::ffi::{c_char, c_int, c_uint, c_void, CString};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::{DevResult, Dim3, GpuDevice, DEV_ERR_NOT_SUPPORTED, DEV_SUCCESS};

type CUresult = c_int;
type CUdevice = c_int;
type CUcontext = *mut c_void;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUdeviceptr = u64;
type CUstream = *mut c_void;
type CUevent = *mut c_void;
type CublasHandle = *mut c_void;

type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuCtxCreate =
    unsafe extern "C" fn(pctx: *mut CUcontext, flags: c_uint, dev: CUdevice) -> CUresult;
type FnCuCtxDestroy = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuMemAlloc = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type FnCuMemFree = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type FnCuMemcpyHtoD =
    unsafe extern "C" fn(dst: CUdeviceptr, src: *const c_void, count: usize) -> CUresult;
type FnCuMemcpyDtoH =
    unsafe extern "C" fn(dst: *mut c_void, src: CUdeviceptr, count: usize) -> CUresult;
type FnCuMemcpyDtoD =
    unsafe extern "C" fn(dst: CUdeviceptr, src: CUdeviceptr, count: usize) -> CUresult;
type FnCuMemcpyHtoDAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: *const c_void,
    count: usize,
    stream: CUstream,
) -> CUresult;
type FnCuMemcpyDtoHAsync = unsafe extern "C" fn(
    dst: *mut c_void,
    src: CUdeviceptr,
    count: usize,
    stream: CUstream,
) -> CUresult;
type FnCuMemcpyDtoDAsync = unsafe extern "C" fn(
    dst: CUdeviceptr,
    src: CUdeviceptr,
    count: usize,
    stream: CUstream,
) -> CUresult;
type FnCuStreamCreate = unsafe extern "C" fn(phstream: *mut CUstream, flags: c_uint) -> CUresult;
type FnCuStreamDestroy = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuStreamSynchronize = unsafe extern "C" fn(hstream: CUstream) -> CUresult;
type FnCuEventCreate = unsafe extern "C" fn(phevent: *mut CUevent, flags: c_uint) -> CUresult;
type FnCuEventDestroy = unsafe extern "C" fn(hevent: CUevent) -> CUresult;
type FnCuEventRecord = unsafe extern "C" fn(hevent: CUevent, hstream: CUstream) -> CUresult;
type FnCuModuleLoadData =
    unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type FnCuModuleUnload = unsafe extern "C" fn(hmod: CUmodule) -> CUresult;
type FnCuModuleGetFunction = unsafe extern "C" fn(
    hfunc: *mut CUfunction,
    hmod: CUmodule,
    name: *const c_char,
) -> CUresult;
type FnCuModuleGetGlobal = unsafe extern "C" fn(
    dptr: *mut CUdeviceptr,
    bytes: *mut usize,
    hmod: CUmodule,
    name: *const c_char,
) -> CUresult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    hstream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type FnCublasCreate = unsafe extern "C" fn(handle: *mut CublasHandle) -> CUresult;
type FnCublasDestroy = unsafe extern "C" fn(handle: CublasHandle) -> CUresult;
type FnCublasSetStream =
    unsafe extern "C" fn(handle: CublasHandle, stream: CUstream) -> CUresult;

/// Dynamically loaded CUDA driver with resolved function pointers.
pub struct CudaDevice {
    _lib: Library,
    _blas_lib: Option<Library>,

    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_ctx_create: FnCuCtxCreate,
    cu_ctx_destroy: FnCuCtxDestroy,
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_mem_alloc: FnCuMemAlloc,
    cu_mem_free: FnCuMemFree,
    cu_memcpy_htod: FnCuMemcpyHtoD,
    cu_memcpy_dtoh: FnCuMemcpyDtoH,
    cu_memcpy_dtod: FnCuMemcpyDtoD,
    cu_memcpy_htod_async: Option<FnCuMemcpyHtoDAsync>,
    cu_memcpy_dtoh_async: Option<FnCuMemcpyDtoHAsync>,
    cu_memcpy_dtod_async: Option<FnCuMemcpyDtoDAsync>,
    cu_stream_create: FnCuStreamCreate,
    cu_stream_destroy: FnCuStreamDestroy,
    cu_stream_synchronize: FnCuStreamSynchronize,
    cu_event_create: FnCuEventCreate,
    cu_event_destroy: FnCuEventDestroy,
    cu_event_record: FnCuEventRecord,
    cu_module_load_data: FnCuModuleLoadData,
    cu_module_unload: FnCuModuleUnload,
    cu_module_get_function: FnCuModuleGetFunction,
    cu_module_get_global: FnCuModuleGetGlobal,
    cu_launch_kernel: FnCuLaunchKernel,
    cublas_create: Option<FnCublasCreate>,
    cublas_destroy: Option<FnCublasDestroy>,
    cublas_set_stream: Option<FnCublasSetStream>,
}

// SAFETY: CUDA driver pointers are valid across threads when used with
// proper context management; the worker owns the device calls.
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

impl CudaDevice {
    /// Load the CUDA driver library, resolve the entry points, and run cuInit.
    pub fn load() -> Result<Self, String> {
        let lib = Self::load_library()?;
        let blas_lib = Self::load_blas_library();

        let dev = unsafe {
            let cu_init: FnCuInit = Self::load_fn(&lib, "cuInit")?;
            let res = cu_init(0);
            if res != DEV_SUCCESS {
                return Err(format!("cuInit failed: {res}"));
            }

            Self {
                cu_device_get_count: Self::load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: Self::load_fn(&lib, "cuDeviceGet")?,
                cu_ctx_create: Self::load_fn(&lib, "cuCtxCreate_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxCreate"))?,
                cu_ctx_destroy: Self::load_fn(&lib, "cuCtxDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuCtxDestroy"))?,
                cu_ctx_set_current: Self::load_fn(&lib, "cuCtxSetCurrent")?,
                cu_mem_alloc: Self::load_fn(&lib, "cuMemAlloc_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemAlloc"))?,
                cu_mem_free: Self::load_fn(&lib, "cuMemFree_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemFree"))?,
                cu_memcpy_htod: Self::load_fn(&lib, "cuMemcpyHtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyHtoD"))?,
                cu_memcpy_dtoh: Self::load_fn(&lib, "cuMemcpyDtoH_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoH"))?,
                cu_memcpy_dtod: Self::load_fn(&lib, "cuMemcpyDtoD_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuMemcpyDtoD"))?,
                cu_memcpy_htod_async: Self::load_fn_opt::<FnCuMemcpyHtoDAsync>(
                    &lib,
                    "cuMemcpyHtoDAsync_v2",
                )
                .or(Self::load_fn_opt(&lib, "cuMemcpyHtoDAsync")),
                cu_memcpy_dtoh_async: Self::load_fn_opt::<FnCuMemcpyDtoHAsync>(
                    &lib,
                    "cuMemcpyDtoHAsync_v2",
                )
                .or(Self::load_fn_opt(&lib, "cuMemcpyDtoHAsync")),
                cu_memcpy_dtod_async: Self::load_fn_opt::<FnCuMemcpyDtoDAsync>(
                    &lib,
                    "cuMemcpyDtoDAsync_v2",
                )
                .or(Self::load_fn_opt(&lib, "cuMemcpyDtoDAsync")),
                cu_stream_create: Self::load_fn(&lib, "cuStreamCreate")?,
                cu_stream_destroy: Self::load_fn(&lib, "cuStreamDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuStreamDestroy"))?,
                cu_stream_synchronize: Self::load_fn(&lib, "cuStreamSynchronize")?,
                cu_event_create: Self::load_fn(&lib, "cuEventCreate")?,
                cu_event_destroy: Self::load_fn(&lib, "cuEventDestroy_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuEventDestroy"))?,
                cu_event_record: Self::load_fn(&lib, "cuEventRecord")?,
                cu_module_load_data: Self::load_fn(&lib, "cuModuleLoadData")?,
                cu_module_unload: Self::load_fn(&lib, "cuModuleUnload")?,
                cu_module_get_function: Self::load_fn(&lib, "cuModuleGetFunction")?,
                cu_module_get_global: Self::load_fn(&lib, "cuModuleGetGlobal_v2")
                    .or_else(|_| Self::load_fn(&lib, "cuModuleGetGlobal"))?,
                cu_launch_kernel: Self::load_fn(&lib, "cuLaunchKernel")?,
                cublas_create: blas_lib
                    .as_ref()
                    .and_then(|b| Self::load_fn_opt(b, "cublasCreate_v2")),
                cublas_destroy: blas_lib
                    .as_ref()
                    .and_then(|b| Self::load_fn_opt(b, "cublasDestroy_v2")),
                cublas_set_stream: blas_lib
                    .as_ref()
                    .and_then(|b| Self::load_fn_opt(b, "cublasSetStream_v2")),
                _lib: lib,
                _blas_lib: blas_lib,
            }
        };

        Ok(dev)
    }

    fn load_library() -> Result<Library, String> {
        #[cfg(target_os = "windows")]
        let lib_names = &["nvcuda.dll"];

        #[cfg(not(target_os = "windows"))]
        let lib_names = &["libcuda.so.1", "libcuda.so"];

        let mut last_err = String::new();
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }
        Err(last_err)
    }

    fn load_blas_library() -> Option<Library> {
        #[cfg(not(target_os = "windows"))]
        {
            for name in ["libcublas.so.12", "libcublas.so.11", "libcublas.so"] {
                if let Ok(lib) = unsafe { Library::new(name) } {
                    info!("loaded cuBLAS from: {}", name);
                    return Some(lib);
                }
            }
        }
        None
    }

    unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
        let sym: Symbol<F> = lib
            .get(name.as_bytes())
            .map_err(|e| format!("failed to load {}: {}", name, e))?;
        Ok(*sym)
    }

    unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
        lib.get(name.as_bytes()).ok().map(|s: Symbol<F>| *s)
    }

    fn check(res: CUresult) -> DevResult<()> {
        if res == DEV_SUCCESS {
            Ok(())
        } else {
            Err(res)
        }
    }
}

impl GpuDevice for CudaDevice {
    fn device_count(&self) -> DevResult<i32> {
        let mut count: c_int = 0;
        Self::check(unsafe { (self.cu_device_get_count)(&mut count) })?;
        Ok(count)
    }

    fn set_device(&self, ordinal: i32) -> DevResult<()> {
        let mut dev: CUdevice = 0;
        Self::check(unsafe { (self.cu_device_get)(&mut dev, ordinal) })
    }

    fn ctx_create(&self, ordinal: i32) -> DevResult<u64> {
        let mut dev: CUdevice = 0;
        Self::check(unsafe { (self.cu_device_get)(&mut dev, ordinal) })?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        Self::check(unsafe { (self.cu_ctx_create)(&mut ctx, 0, dev) })?;
        Self::check(unsafe { (self.cu_ctx_set_current)(ctx) })?;
        Ok(ctx as u64)
    }

    fn ctx_destroy(&self, ctx: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_ctx_destroy)(ctx as CUcontext) })
    }

    fn malloc(&self, size: u64) -> DevResult<u64> {
        let mut dptr: CUdeviceptr = 0;
        Self::check(unsafe { (self.cu_mem_alloc)(&mut dptr, size as usize) })?;
        Ok(dptr)
    }

    fn free(&self, dptr: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_mem_free)(dptr) })
    }

    fn memcpy_h2d(&self, dst: u64, src: &[u8]) -> DevResult<()> {
        Self::check(unsafe {
            (self.cu_memcpy_htod)(dst, src.as_ptr() as *const c_void, src.len())
        })
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: u64) -> DevResult<()> {
        Self::check(unsafe {
            (self.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len())
        })
    }

    fn memcpy_d2d(&self, dst: u64, src: u64, len: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_memcpy_dtod)(dst, src, len as usize) })
    }

    fn memcpy_h2d_async(&self, dst: u64, src: &[u8], stream: u64) -> DevResult<()> {
        match self.cu_memcpy_htod_async {
            Some(f) => Self::check(unsafe {
                f(dst, src.as_ptr() as *const c_void, src.len(), stream as CUstream)
            }),
            None => self.memcpy_h2d(dst, src),
        }
    }

    fn memcpy_d2h_async(&self, dst: &mut [u8], src: u64, stream: u64) -> DevResult<()> {
        match self.cu_memcpy_dtoh_async {
            Some(f) => Self::check(unsafe {
                f(dst.as_mut_ptr() as *mut c_void, src, dst.len(), stream as CUstream)
            }),
            None => self.memcpy_d2h(dst, src),
        }
    }

    fn memcpy_d2d_async(&self, dst: u64, src: u64, len: u64, stream: u64) -> DevResult<()> {
        match self.cu_memcpy_dtod_async {
            Some(f) => Self::check(unsafe { f(dst, src, len as usize, stream as CUstream) }),
            None => self.memcpy_d2d(dst, src, len),
        }
    }

    fn stream_create(&self) -> DevResult<u64> {
        let mut stream: CUstream = std::ptr::null_mut();
        Self::check(unsafe { (self.cu_stream_create)(&mut stream, 0) })?;
        Ok(stream as u64)
    }

    fn stream_destroy(&self, stream: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_stream_destroy)(stream as CUstream) })
    }

    fn stream_synchronize(&self, stream: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_stream_synchronize)(stream as CUstream) })
    }

    fn event_create(&self, flags: u32) -> DevResult<u64> {
        let mut event: CUevent = std::ptr::null_mut();
        Self::check(unsafe { (self.cu_event_create)(&mut event, flags) })?;
        Ok(event as u64)
    }

    fn event_destroy(&self, event: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_event_destroy)(event as CUevent) })
    }

    fn event_record(&self, event: u64, stream: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_event_record)(event as CUevent, stream as CUstream) })
    }

    fn module_load(&self, image: &[u8]) -> DevResult<u64> {
        // driver expects a NUL-terminated image for PTX text
        let mut owned = image.to_vec();
        if owned.last() != Some(&0) {
            owned.push(0);
        }
        let mut module: CUmodule = std::ptr::null_mut();
        Self::check(unsafe {
            (self.cu_module_load_data)(&mut module, owned.as_ptr() as *const c_void)
        })?;
        Ok(module as u64)
    }

    fn module_unload(&self, module: u64) -> DevResult<()> {
        Self::check(unsafe { (self.cu_module_unload)(module as CUmodule) })
    }

    fn module_get_function(&self, module: u64, name: &str) -> DevResult<u64> {
        let cname = CString::new(name).map_err(|_| super::DEV_ERR_INVALID_VALUE)?;
        let mut func: CUfunction = std::ptr::null_mut();
        Self::check(unsafe {
            (self.cu_module_get_function)(&mut func, module as CUmodule, cname.as_ptr())
        })?;
        Ok(func as u64)
    }

    fn module_get_global(&self, module: u64, name: &str) -> DevResult<(u64, u64)> {
        let cname = CString::new(name).map_err(|_| super::DEV_ERR_INVALID_VALUE)?;
        let mut dptr: CUdeviceptr = 0;
        let mut bytes: usize = 0;
        Self::check(unsafe {
            (self.cu_module_get_global)(&mut dptr, &mut bytes, module as CUmodule, cname.as_ptr())
        })?;
        Ok((dptr, bytes as u64))
    }

    fn launch_kernel(
        &self,
        func: u64,
        grid: Dim3,
        block: Dim3,
        shared_mem: u32,
        stream: u64,
        arg_blob: &[u8],
        arg_offsets: &[u32],
    ) -> DevResult<()> {
        // the driver takes an array of pointers into the packed blob
        let mut argv: Vec<*mut c_void> = arg_offsets
            .iter()
            .map(|off| unsafe { arg_blob.as_ptr().add(*off as usize) as *mut c_void })
            .collect();

        Self::check(unsafe {
            (self.cu_launch_kernel)(
                func as CUfunction,
                grid.x,
                grid.y,
                grid.z,
                block.x,
                block.y,
                block.z,
                shared_mem,
                stream as CUstream,
                argv.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        })
    }

    fn blas_create(&self) -> DevResult<u64> {
        match self.cublas_create {
            Some(f) => {
                let mut handle: CublasHandle = std::ptr::null_mut();
                Self::check(unsafe { f(&mut handle) })?;
                Ok(handle as u64)
            }
            None => Err(DEV_ERR_NOT_SUPPORTED),
        }
    }

    fn blas_destroy(&self, handle: u64) -> DevResult<()> {
        match self.cublas_destroy {
            Some(f) => Self::check(unsafe { f(handle as CublasHandle) }),
            None => Err(DEV_ERR_NOT_SUPPORTED),
        }
    }

    fn blas_set_stream(&self, handle: u64, stream: u64) -> DevResult<()> {
        match self.cublas_set_stream {
            Some(f) => Self::check(unsafe { f(handle as CublasHandle, stream as CUstream) }),
            None => Err(DEV_ERR_NOT_SUPPORTED),
        }
    }
}
