//! Checkpoint image dump and restore across fresh workspaces.

use std::sync::Arc;

use shade_core::ShadeConfig;
use shade_protocol::api::{api_id, ParamDesc};
use shade_protocol::ResourceTypeId;

use shade_server::api::kernel::pack_launch_params;
use shade_server::command::Command;
use shade_server::device::{GpuDevice, SimDevice};
use shade_server::Workspace;

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
    assert_eq!(code, 0);
    u64::from_le_bytes(ret[..8].try_into().unwrap())
}

fn h2d(ws: &Arc<Workspace>, uuid: u64, addr: u64, data: Vec<u8>) {
    let (code, _) = call(
        ws,
        uuid,
        api_id::CUDA_MEMCPY_H2D,
        vec![ParamDesc::handle_ref(addr), ParamDesc::buffer_in(data)],
        0,
    );
    assert_eq!(code, 0);
}

fn d2h(ws: &Arc<Workspace>, uuid: u64, addr: u64, len: u64) -> Vec<u8> {
    let (code, ret) = call(
        ws,
        uuid,
        api_id::CUDA_MEMCPY_D2H,
        vec![ParamDesc::handle_ref(addr), ParamDesc::value_u64(len)],
        len,
    );
    assert_eq!(code, 0);
    ret
}

#[test]
fn image_round_trip_restores_memory_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("client.img");
    let image_path = image_path.to_str().unwrap();

    // source workspace: two buffers with distinct patterns
    let (ws1, _sim1) = workspace_with_sim();
    let client1 = ws1.create_client("ckpt-job").unwrap();
    let uuid1 = client1.uuid;

    let a = malloc(&ws1, uuid1, 4096);
    let b = malloc(&ws1, uuid1, 4096);
    h2d(&ws1, uuid1, a, vec![0x11u8; 4096]);
    h2d(&ws1, uuid1, b, vec![0x22u8; 4096]);

    client1
        .run_command(Command::CheckpointDump { image_path: image_path.to_string() })
        .unwrap();
    assert!(std::fs::metadata(image_path).unwrap().len() > 8192);

    // after a full dump the modified sets are empty
    assert!(client1.managers.get(ResourceTypeId::Memory).read().modified_is_empty());

    // fresh workspace, fresh simulator: rebuild the client from the image
    let (ws2, _sim2) = workspace_with_sim();
    let client2 = ws2.create_client("ckpt-job-restored").unwrap();
    let uuid2 = client2.uuid;

    client2
        .run_command(Command::Restore { image_path: image_path.to_string() })
        .unwrap();

    assert_eq!(d2h(&ws2, uuid2, a, 4096), vec![0x11u8; 4096]);
    assert_eq!(d2h(&ws2, uuid2, b, 4096), vec![0x22u8; 4096]);

    ws1.shutdown();
    ws2.shutdown();
}

#[test]
fn restored_function_is_launchable() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("func.img");
    let image_path = image_path.to_str().unwrap();

    let (ws1, _sim1) = workspace_with_sim();
    let client1 = ws1.create_client("func-job").unwrap();
    let uuid1 = client1.uuid;

    let mem = malloc(&ws1, uuid1, 1024);

    let (code, ret) = call(
        &ws1,
        uuid1,
        api_id::CUDA_MODULE_LOAD,
        vec![ParamDesc::buffer_in(b"fatbin-image".to_vec())],
        8,
    );
    assert_eq!(code, 0);
    let module = u64::from_le_bytes(ret[..8].try_into().unwrap());

    let pack = |v: &[u32]| v.iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<u8>>();
    let (code, ret) = call(
        &ws1,
        uuid1,
        api_id::CUDA_MODULE_GET_FUNCTION,
        vec![
            ParamDesc::handle_ref(module),
            ParamDesc::buffer_in(b"kern".to_vec()),
            ParamDesc::value_u32(2),
            ParamDesc::buffer_in(pack(&[0, 8])),
            ParamDesc::buffer_in(pack(&[8, 4])),
            ParamDesc::buffer_in(pack(&[0])),
            ParamDesc::buffer_in(vec![]),
            ParamDesc::buffer_in(vec![]),
        ],
        8,
    );
    assert_eq!(code, 0);
    let func = u64::from_le_bytes(ret[..8].try_into().unwrap());

    client1
        .run_command(Command::CheckpointDump { image_path: image_path.to_string() })
        .unwrap();

    // restore into a fresh workspace: the module reloads from its retained
    // image, the function re-binds by name against the new module
    let (ws2, _sim2) = workspace_with_sim();
    let client2 = ws2.create_client("func-job-restored").unwrap();
    let uuid2 = client2.uuid;
    client2
        .run_command(Command::Restore { image_path: image_path.to_string() })
        .unwrap();

    let func_handle = {
        let mgr = client2.managers.get(ResourceTypeId::Function).read();
        mgr.get_by_client_addr(func).unwrap().0
    };
    assert_eq!(func_handle.status(), shade_server::handle::HandleStatus::Active);
    assert_ne!(func_handle.server_addr(), 0);

    // and it launches through the restored pipeline
    let mut blob = Vec::new();
    blob.extend_from_slice(&mem.to_le_bytes());
    blob.extend_from_slice(&9u32.to_le_bytes());
    let packed = pack_launch_params(2, &blob);
    let grid: Vec<u8> = [1u32, 1, 1].iter().flat_map(|x| x.to_le_bytes()).collect();
    let block: Vec<u8> = [64u32, 1, 1].iter().flat_map(|x| x.to_le_bytes()).collect();

    let (code, _) = call(
        &ws2,
        uuid2,
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
    assert_eq!(code, 0);

    ws1.shutdown();
    ws2.shutdown();
}

#[test]
fn checkpoint_tick_captures_only_modified_handles() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("tick-job").unwrap();
    let uuid = client.uuid;

    let a = malloc(&ws, uuid, 512);
    let b = malloc(&ws, uuid, 512);
    h2d(&ws, uuid, a, vec![1u8; 512]);

    client.run_command(Command::CheckpointTick { version: 10 }).unwrap();

    let mgr = client.managers.get(ResourceTypeId::Memory).read();
    let (ha, _) = mgr.get_by_client_addr(a).unwrap();
    let (hb, _) = mgr.get_by_client_addr(b).unwrap();
    drop(mgr);

    {
        let bag = ha.ckpt_bag.lock();
        let (version, slot) = bag.as_ref().unwrap().get_latest().unwrap();
        assert_eq!(version, 10);
        assert_eq!(slot.data, vec![1u8; 512]);
    }
    // b was never written, so the tick skipped it
    assert!(hb.ckpt_bag.lock().is_none());

    // a second tick with nothing modified is a no-op
    client.run_command(Command::CheckpointTick { version: 11 }).unwrap();
    {
        let bag = ha.ckpt_bag.lock();
        assert_eq!(bag.as_ref().unwrap().get_latest().unwrap().0, 10);
    }
    assert!(client.managers.get(ResourceTypeId::Memory).read().modified_is_empty());

    ws.shutdown();
}
