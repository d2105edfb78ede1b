//! Deterministic host-memory device simulator.
//!
//! Backs every device address with a host buffer so copies are byte-exact,
//! which is what the checkpoint and migration suites assert against. Device
//! memory is handed out page-aligned from the bottom of the mock address
//! range, so the first 4 KiB allocation lands at 0x5555_0000_0000.

use std::collections::HashMap;

use parking_lot::Mutex;

use shade_protocol::resource::MOCK_ADDR_BASE;

use super::{
    DevResult, Dim3, GpuDevice, DEV_ERR_INVALID_VALUE, DEV_ERR_NOT_FOUND,
    DEV_ERR_OUT_OF_MEMORY,
};

const PAGE: u64 = 4096;

#[derive(Default)]
struct SimState {
    allocations: HashMap<u64, Vec<u8>>,
    next_alloc: u64,
    streams: HashMap<u64, ()>,
    events: HashMap<u64, ()>,
    contexts: HashMap<u64, ()>,
    modules: HashMap<u64, SimModule>,
    blas_handles: HashMap<u64, ()>,
    next_opaque: u64,
    current_device: i32,
    /// Operation name -> error code to return on the next matching call.
    fail_next: HashMap<&'static str, i32>,
}

struct SimModule {
    #[allow(dead_code)]
    image: Vec<u8>,
    functions: HashMap<String, u64>,
    globals: HashMap<String, (u64, u64)>,
}

pub struct SimDevice {
    state: Mutex<SimState>,
    device_count: i32,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    pub fn with_device_count(device_count: i32) -> Self {
        let state = SimState {
            next_alloc: MOCK_ADDR_BASE,
            next_opaque: 0x10_0000,
            ..Default::default()
        };
        Self { state: Mutex::new(state), device_count }
    }

    /// Make the next call of `op` fail with `code`. Used by the fault
    /// injection tests for the broken-handle restore path.
    pub fn inject_failure(&self, op: &'static str, code: i32) {
        self.state.lock().fail_next.insert(op, code);
    }

    fn take_failure(state: &mut SimState, op: &'static str) -> DevResult<()> {
        match state.fail_next.remove(op) {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn next_opaque(state: &mut SimState) -> u64 {
        state.next_opaque += 0x10;
        state.next_opaque
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SimDevice {
    fn device_count(&self) -> DevResult<i32> {
        Ok(self.device_count)
    }

    fn set_device(&self, ordinal: i32) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "set_device")?;
        if ordinal < 0 || ordinal >= self.device_count {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        s.current_device = ordinal;
        Ok(())
    }

    fn ctx_create(&self, ordinal: i32) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "ctx_create")?;
        if ordinal < 0 || ordinal >= self.device_count {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        let ctx = Self::next_opaque(&mut s);
        s.contexts.insert(ctx, ());
        Ok(ctx)
    }

    fn ctx_destroy(&self, ctx: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        s.contexts.remove(&ctx).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn malloc(&self, size: u64) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "malloc")?;
        if size == 0 {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        if size > u32::MAX as u64 * 16 {
            return Err(DEV_ERR_OUT_OF_MEMORY);
        }
        let addr = s.next_alloc;
        let pages = size.div_ceil(PAGE);
        s.next_alloc += pages * PAGE;
        s.allocations.insert(addr, vec![0u8; size as usize]);
        Ok(addr)
    }

    fn free(&self, dptr: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "free")?;
        s.allocations.remove(&dptr).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn memcpy_h2d(&self, dst: u64, src: &[u8]) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "memcpy_h2d")?;
        // dst may point inside an allocation
        let (base, buf) = s
            .allocations
            .iter_mut()
            .find(|(base, buf)| **base <= dst && dst + src.len() as u64 <= **base + buf.len() as u64)
            .ok_or(DEV_ERR_INVALID_VALUE)?;
        let off = (dst - base) as usize;
        buf[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "memcpy_d2h")?;
        let (base, buf) = s
            .allocations
            .iter()
            .find(|(base, buf)| **base <= src && src + dst.len() as u64 <= **base + buf.len() as u64)
            .ok_or(DEV_ERR_INVALID_VALUE)?;
        let off = (src - base) as usize;
        dst.copy_from_slice(&buf[off..off + dst.len()]);
        Ok(())
    }

    fn memcpy_d2d(&self, dst: u64, src: u64, len: u64) -> DevResult<()> {
        let mut tmp = vec![0u8; len as usize];
        self.memcpy_d2h(&mut tmp, src)?;
        self.memcpy_h2d(dst, &tmp)
    }

    fn memcpy_h2d_async(&self, dst: u64, src: &[u8], _stream: u64) -> DevResult<()> {
        self.memcpy_h2d(dst, src)
    }

    fn memcpy_d2h_async(&self, dst: &mut [u8], src: u64, _stream: u64) -> DevResult<()> {
        self.memcpy_d2h(dst, src)
    }

    fn memcpy_d2d_async(&self, dst: u64, src: u64, len: u64, _stream: u64) -> DevResult<()> {
        self.memcpy_d2d(dst, src, len)
    }

    fn stream_create(&self) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "stream_create")?;
        let stream = Self::next_opaque(&mut s);
        s.streams.insert(stream, ());
        Ok(stream)
    }

    fn stream_destroy(&self, stream: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        s.streams.remove(&stream).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn stream_synchronize(&self, stream: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "stream_synchronize")?;
        if stream != 0 && !s.streams.contains_key(&stream) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        Ok(())
    }

    fn event_create(&self, _flags: u32) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "event_create")?;
        let event = Self::next_opaque(&mut s);
        s.events.insert(event, ());
        Ok(event)
    }

    fn event_destroy(&self, event: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        s.events.remove(&event).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn event_record(&self, event: u64, stream: u64) -> DevResult<()> {
        let s = self.state.lock();
        if !s.events.contains_key(&event) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        if stream != 0 && !s.streams.contains_key(&stream) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        Ok(())
    }

    fn module_load(&self, image: &[u8]) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "module_load")?;
        if image.is_empty() {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        let module = Self::next_opaque(&mut s);
        s.modules.insert(
            module,
            SimModule {
                image: image.to_vec(),
                functions: HashMap::new(),
                globals: HashMap::new(),
            },
        );
        Ok(module)
    }

    fn module_unload(&self, module: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        s.modules.remove(&module).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn module_get_function(&self, module: u64, name: &str) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "module_get_function")?;
        let next = Self::next_opaque(&mut s);
        let m = s.modules.get_mut(&module).ok_or(DEV_ERR_INVALID_VALUE)?;
        if name.is_empty() {
            return Err(DEV_ERR_NOT_FOUND);
        }
        Ok(*m.functions.entry(name.to_string()).or_insert(next))
    }

    fn module_get_global(&self, module: u64, name: &str) -> DevResult<(u64, u64)> {
        const GLOBAL_SIZE: u64 = 256;

        let mut s = self.state.lock();
        Self::take_failure(&mut s, "module_get_global")?;
        if !s.modules.contains_key(&module) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        if let Some(found) = s.modules.get(&module).and_then(|m| m.globals.get(name)) {
            return Ok(*found);
        }
        // first touch backs the global with a fresh allocation
        let addr = s.next_alloc;
        s.next_alloc += PAGE;
        s.allocations.insert(addr, vec![0u8; GLOBAL_SIZE as usize]);
        let m = s.modules.get_mut(&module).ok_or(DEV_ERR_INVALID_VALUE)?;
        m.globals.insert(name.to_string(), (addr, GLOBAL_SIZE));
        Ok((addr, GLOBAL_SIZE))
    }

    fn launch_kernel(
        &self,
        func: u64,
        grid: Dim3,
        block: Dim3,
        _shared_mem: u32,
        _stream: u64,
        arg_blob: &[u8],
        arg_offsets: &[u32],
    ) -> DevResult<()> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "launch_kernel")?;
        if grid.x == 0 || grid.y == 0 || grid.z == 0 || block.x == 0 || block.y == 0 || block.z == 0
        {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        let known = s.modules.values().any(|m| m.functions.values().any(|f| *f == func));
        if !known {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        for off in arg_offsets {
            if *off as usize > arg_blob.len() {
                return Err(DEV_ERR_INVALID_VALUE);
            }
        }
        Ok(())
    }

    fn blas_create(&self) -> DevResult<u64> {
        let mut s = self.state.lock();
        Self::take_failure(&mut s, "blas_create")?;
        let h = Self::next_opaque(&mut s);
        s.blas_handles.insert(h, ());
        Ok(h)
    }

    fn blas_destroy(&self, handle: u64) -> DevResult<()> {
        let mut s = self.state.lock();
        s.blas_handles.remove(&handle).map(|_| ()).ok_or(DEV_ERR_INVALID_VALUE)
    }

    fn blas_set_stream(&self, handle: u64, stream: u64) -> DevResult<()> {
        let s = self.state.lock();
        if !s.blas_handles.contains_key(&handle) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        if stream != 0 && !s.streams.contains_key(&stream) {
            return Err(DEV_ERR_INVALID_VALUE);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_from_range_base() {
        let dev = SimDevice::new();
        let a = dev.malloc(4096).unwrap();
        assert_eq!(a, 0x0000_5555_0000_0000);
        let b = dev.malloc(8).unwrap();
        assert_eq!(b, 0x0000_5555_0000_1000);
    }

    #[test]
    fn copy_round_trip_at_offset() {
        let dev = SimDevice::new();
        let a = dev.malloc(4096).unwrap();
        let payload = [7u8; 16];
        dev.memcpy_h2d(a + 32, &payload).unwrap();
        let mut back = [0u8; 16];
        dev.memcpy_d2h(&mut back, a + 32).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn injected_failure_fires_once() {
        let dev = SimDevice::new();
        let a = dev.malloc(64).unwrap();
        dev.inject_failure("free", 700);
        assert_eq!(dev.free(a), Err(700));
        assert_eq!(dev.free(a), Ok(()));
    }

    #[test]
    fn function_lookup_is_stable() {
        let dev = SimDevice::new();
        let m = dev.module_load(b"fatbin").unwrap();
        let f1 = dev.module_get_function(m, "kern").unwrap();
        let f2 = dev.module_get_function(m, "kern").unwrap();
        assert_eq!(f1, f2);
        assert!(dev.module_get_function(0xdead, "kern").is_err());
    }
}
