//! End-to-end pipeline tests against the simulator device: the full
//! RPC -> Parser -> Worker -> completion path of a workspace.

use std::sync::Arc;

use shade_core::ShadeConfig;
use shade_protocol::api::{api_id, ParamDesc};

use shade_server::api::kernel::pack_launch_params;
use shade_server::device::{GpuDevice, SimDevice};
use shade_server::Workspace;

const MOCK_BASE: u64 = 0x0000_5555_0000_0000;

fn workspace_with_sim() -> (Arc<Workspace>, Arc<SimDevice>) {
    let sim = Arc::new(SimDevice::new());
    let ws = Workspace::new(ShadeConfig::default(), sim.clone() as Arc<dyn GpuDevice>);
    (ws, sim)
}

fn call(
    ws: &Arc<Workspace>,
    uuid: u64,
    api: u64,
    params: Vec<ParamDesc>,
    ret_len: u64,
) -> (i32, Vec<u8>) {
    ws.process(api, uuid, true, params, ret_len).expect("process failed")
}

fn malloc(ws: &Arc<Workspace>, uuid: u64, size: u64) -> u64 {
    let (code, ret) = call(ws, uuid, api_id::CUDA_MALLOC, vec![ParamDesc::value_u64(size)], 8);
    assert_eq!(code, 0, "malloc failed");
    u64::from_le_bytes(ret[..8].try_into().unwrap())
}

#[test]
fn memory_lifecycle() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("memory-lifecycle").unwrap();
    let uuid = client.uuid;

    // first 4 KiB allocation lands at the bottom of the address range
    let addr = malloc(&ws, uuid, 4096);
    assert_eq!(addr, MOCK_BASE);

    // write 16 bytes at offset 32, read the same window back
    let payload: Vec<u8> = (0u8..16).collect();
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_H2D,
        vec![ParamDesc::handle_ref(addr + 32), ParamDesc::buffer_in(payload.clone())],
        0,
    );
    assert_eq!(code, 0);

    let (code, ret) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_D2H,
        vec![ParamDesc::handle_ref(addr + 32), ParamDesc::value_u64(16)],
        16,
    );
    assert_eq!(code, 0);
    assert_eq!(ret, payload);

    // free, then the address no longer resolves
    let (code, _) = call(&ws, uuid, api_id::CUDA_FREE, vec![ParamDesc::handle_ref(addr)], 0);
    assert_eq!(code, 0);
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_D2H,
        vec![ParamDesc::handle_ref(addr), ParamDesc::value_u64(8)],
        8,
    );
    assert_ne!(code, 0, "lookup of freed memory must fail");

    // the next allocation takes a fresh slot one page up
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_SET_DEVICE,
        vec![ParamDesc::value_i32(0)],
        0,
    );
    assert_eq!(code, 0);
    let next = malloc(&ws, uuid, 8);
    assert_eq!(next, MOCK_BASE + 0x1000);

    ws.shutdown();
}

#[test]
fn stream_and_event_lifecycle() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("stream-event").unwrap();
    let uuid = client.uuid;

    let (code, ret) = call(&ws, uuid, api_id::CUDA_STREAM_CREATE, vec![], 8);
    assert_eq!(code, 0);
    let stream_addr = u64::from_le_bytes(ret[..8].try_into().unwrap());
    assert_eq!(stream_addr, MOCK_BASE, "first mock stream address");

    let (code, ret) = call(&ws, uuid, api_id::CUDA_EVENT_CREATE, vec![ParamDesc::value_u32(0)], 8);
    assert_eq!(code, 0);
    let event_addr = u64::from_le_bytes(ret[..8].try_into().unwrap());

    // record binds the event (output) to the stream (input)
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_EVENT_RECORD,
        vec![ParamDesc::handle_ref(event_addr), ParamDesc::handle_ref(stream_addr)],
        0,
    );
    assert_eq!(code, 0);

    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_STREAM_SYNCHRONIZE,
        vec![ParamDesc::handle_ref(stream_addr)],
        0,
    );
    assert_eq!(code, 0);

    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_EVENT_DESTROY,
        vec![ParamDesc::handle_ref(event_addr)],
        0,
    );
    assert_eq!(code, 0);
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_STREAM_DESTROY,
        vec![ParamDesc::handle_ref(stream_addr)],
        0,
    );
    assert_eq!(code, 0);

    ws.shutdown();
}

fn load_kernel(
    ws: &Arc<Workspace>,
    uuid: u64,
    name: &str,
    offsets: &[u32],
    sizes: &[u32],
    input_ptr: &[u32],
) -> u64 {
    let (code, ret) = call(
        ws,
        uuid,
        api_id::CUDA_MODULE_LOAD,
        vec![ParamDesc::buffer_in(b"fatbin-image".to_vec())],
        8,
    );
    assert_eq!(code, 0);
    let module_addr = u64::from_le_bytes(ret[..8].try_into().unwrap());

    let pack = |v: &[u32]| v.iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<u8>>();
    let (code, ret) = call(
        ws,
        uuid,
        api_id::CUDA_MODULE_GET_FUNCTION,
        vec![
            ParamDesc::handle_ref(module_addr),
            ParamDesc::buffer_in(name.as_bytes().to_vec()),
            ParamDesc::value_u32(offsets.len() as u32),
            ParamDesc::buffer_in(pack(offsets)),
            ParamDesc::buffer_in(pack(sizes)),
            ParamDesc::buffer_in(pack(input_ptr)),
            ParamDesc::buffer_in(vec![]),
            ParamDesc::buffer_in(vec![]),
        ],
        8,
    );
    assert_eq!(code, 0);
    u64::from_le_bytes(ret[..8].try_into().unwrap())
}

#[test]
fn kernel_launch_with_pointer_param() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("kernel-launch").unwrap();
    let uuid = client.uuid;

    let mem = malloc(&ws, uuid, 4096);

    // three params: ptr at offset 0 (8B), a u64 at 8, a u32 at 16
    let func = load_kernel(&ws, uuid, "kern", &[0, 8, 16], &[8, 8, 4], &[0]);

    let mut blob = Vec::new();
    blob.extend_from_slice(&mem.to_le_bytes()); // the mock address
    blob.extend_from_slice(&1234u64.to_le_bytes());
    blob.extend_from_slice(&7u32.to_le_bytes());
    let packed = pack_launch_params(3, &blob);

    let grid: Vec<u8> = [2u32, 1, 1].iter().flat_map(|x| x.to_le_bytes()).collect();
    let block: Vec<u8> = [32u32, 1, 1].iter().flat_map(|x| x.to_le_bytes()).collect();

    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_LAUNCH_KERNEL,
        vec![
            ParamDesc::handle_ref(func),
            ParamDesc { kind: shade_protocol::ParamKind::Value, declared_size: 12, payload: grid },
            ParamDesc { kind: shade_protocol::ParamKind::Value, declared_size: 12, payload: block },
            ParamDesc::buffer_in(packed),
            ParamDesc::value_u64(0),
        ],
        0,
    );
    assert_eq!(code, 0, "kernel launch through the pipeline");

    ws.shutdown();
}

#[test]
fn unknown_handle_short_circuits_in_parser() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("bad-handle").unwrap();
    let uuid = client.uuid;

    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_D2H,
        vec![ParamDesc::handle_ref(0xdead_beef), ParamDesc::value_u64(8)],
        8,
    );
    assert_ne!(code, 0, "unknown handle must fail before the worker");

    // the pipeline stays healthy afterwards
    let addr = malloc(&ws, uuid, 64);
    assert_eq!(addr, MOCK_BASE);

    ws.shutdown();
}

#[test]
fn completions_preserve_submission_order() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("ordering").unwrap();
    let uuid = client.uuid;

    let addr = malloc(&ws, uuid, 4096);

    // a burst of async writes followed by a sync read observes the last write
    for i in 0u8..8 {
        let (code, _) = ws
            .process(
                api_id::CUDA_MEMCPY_H2D,
                uuid,
                false,
                vec![ParamDesc::handle_ref(addr), ParamDesc::buffer_in(vec![i; 32])],
                0,
            )
            .unwrap();
        assert_eq!(code, 0);
    }

    let (code, ret) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_D2H,
        vec![ParamDesc::handle_ref(addr), ParamDesc::value_u64(32)],
        32,
    );
    assert_eq!(code, 0);
    assert_eq!(ret, vec![7u8; 32]);

    ws.shutdown();
}

#[test]
fn device_failure_marks_and_restores_broken_handles() {
    let (ws, sim) = workspace_with_sim();
    let client = ws.create_client("restore-after-failure").unwrap();
    let uuid = client.uuid;

    let addr = malloc(&ws, uuid, 256);
    let payload = vec![0xA5u8; 256];
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_MEMCPY_H2D,
        vec![ParamDesc::handle_ref(addr), ParamDesc::buffer_in(payload.clone())],
        0,
    );
    assert_eq!(code, 0);

    // the next free fails on the device; the client observes the native code
    sim.inject_failure("free", 700);
    let (code, _) = call(&ws, uuid, api_id::CUDA_FREE, vec![ParamDesc::handle_ref(addr)], 0);
    assert_eq!(code, 700);

    // the worker marked the handle broken and restored it with its cached
    // host value replayed
    let handle = {
        let mgr = client.managers.get(shade_protocol::ResourceTypeId::Memory).read();
        mgr.handles()[0].clone()
    };
    assert_eq!(handle.status(), shade_server::handle::HandleStatus::Active);
    assert_ne!(handle.server_addr(), 0);

    let mut back = vec![0u8; 256];
    sim.memcpy_d2h(&mut back, handle.server_addr()).unwrap();
    assert_eq!(back, payload);

    ws.shutdown();
}

#[test]
fn cublas_handle_lifecycle() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("blas").unwrap();
    let uuid = client.uuid;

    let (code, ret) = call(&ws, uuid, api_id::CUBLAS_CREATE, vec![], 8);
    assert_eq!(code, 0);
    let blas = u64::from_le_bytes(ret[..8].try_into().unwrap());

    let (code, ret) = call(&ws, uuid, api_id::CUDA_STREAM_CREATE, vec![], 8);
    assert_eq!(code, 0);
    let stream = u64::from_le_bytes(ret[..8].try_into().unwrap());

    let (code, _) = ws
        .process(
            api_id::CUBLAS_SET_STREAM,
            uuid,
            false,
            vec![ParamDesc::handle_ref(blas), ParamDesc::handle_ref(stream)],
            0,
        )
        .unwrap();
    assert_eq!(code, 0);

    let (code, _) = call(&ws, uuid, api_id::CUBLAS_DESTROY, vec![ParamDesc::handle_ref(blas)], 0);
    assert_eq!(code, 0);

    ws.shutdown();
}
