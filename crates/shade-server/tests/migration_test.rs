//! Migration between two workspaces over a loopback channel: pre-copy,
//! delta-copy, tear on the source, instantiation on the target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shade_core::ShadeConfig;
use shade_protocol::api::{api_id, ParamDesc};
use shade_protocol::ResourceTypeId;

use shade_server::command::Command;
use shade_server::device::{GpuDevice, SimDevice};
use shade_server::handle::HandleStatus;
use shade_server::migration::MigrationAcceptor;
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

/// Wait until the migrated client exists and its memory handles finished
/// instantiating on the target.
fn wait_for_client(ws: &Arc<Workspace>, job_name: &str, nb_memory: usize) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for uuid in 1..16 {
            if let Ok(client) = ws.get_client(uuid) {
                if client.job_name != job_name {
                    continue;
                }
                let ready = {
                    let mgr = client.managers.get(ResourceTypeId::Memory).read();
                    mgr.handles().len() >= nb_memory
                        && mgr.handles().iter().all(|h| h.status() == HandleStatus::Active)
                };
                if ready {
                    return uuid;
                }
            }
        }
        assert!(Instant::now() < deadline, "migrated client never became ready");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn precopy_deltacopy_tear_and_instantiate() {
    const KB64: u64 = 64 * 1024;

    // target daemon
    let (ws_target, _sim_target) = workspace_with_sim();
    let acceptor = MigrationAcceptor::spawn(ws_target.clone(), "127.0.0.1:0").unwrap();
    let target_addr = acceptor.local_addr().to_string();

    // source daemon with two buffers
    let (ws_src, _sim_src) = workspace_with_sim();
    let client = ws_src.create_client("migrating-job").unwrap();
    let uuid = client.uuid;

    let a = malloc(&ws_src, uuid, KB64);
    let b = malloc(&ws_src, uuid, KB64);
    h2d(&ws_src, uuid, a, vec![0xAAu8; KB64 as usize]);
    h2d(&ws_src, uuid, b, vec![0xB0u8; KB64 as usize]);

    client.migration.lock().target_endpoint = Some(target_addr);

    // pre-copy ships A and B while the client still runs
    client.run_command(Command::MigrationRemoteMalloc).unwrap();
    client.run_command(Command::MigrationPrecopy).unwrap();

    // the client mutates B after the pre-copy pass
    h2d(&ws_src, uuid, b, vec![0xB1u8; KB64 as usize]);

    // delta-copy ships only what changed since pre-copy
    client.run_command(Command::MigrationDeltacopy).unwrap();

    // tear frees the source-side resources
    client.run_command(Command::MigrationTear { do_module: false }).unwrap();
    {
        let mgr = client.managers.get(ResourceTypeId::Memory).read();
        for h in mgr.handles() {
            assert_eq!(h.status(), HandleStatus::Broken);
        }
    }

    // closing the channel lets the target instantiate the staged state
    client.migration.lock().reset();

    let target_uuid = wait_for_client(&ws_target, "migrating-job", 2);
    assert_eq!(d2h(&ws_target, target_uuid, a, KB64), vec![0xAAu8; KB64 as usize]);
    assert_eq!(d2h(&ws_target, target_uuid, b, KB64), vec![0xB1u8; KB64 as usize]);

    ws_src.shutdown();
    ws_target.shutdown();
}

#[test]
fn tear_then_allreload_revives_the_source() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("reload-job").unwrap();
    let uuid = client.uuid;

    let a = malloc(&ws, uuid, 2048);
    h2d(&ws, uuid, a, vec![0x5Cu8; 2048]);

    let (code, ret) = call(&ws, uuid, api_id::CUDA_STREAM_CREATE, vec![], 8);
    assert_eq!(code, 0);
    let stream = u64::from_le_bytes(ret[..8].try_into().unwrap());

    // no target endpoint: a local tear/reload cycle
    client.run_command(Command::MigrationTear { do_module: false }).unwrap();
    {
        let mgr = client.managers.get(ResourceTypeId::Stream).read();
        let (h, _) = mgr.get_by_client_addr(stream).unwrap();
        assert_eq!(h.status(), HandleStatus::Broken);
    }

    client.run_command(Command::MigrationRestoreContext { do_module: false }).unwrap();
    client.run_command(Command::MigrationAllReload).unwrap();

    // memory came back with the cached host value replayed
    assert_eq!(d2h(&ws, uuid, a, 2048), vec![0x5Cu8; 2048]);

    // the stream works again too
    let (code, _) = call(
        &ws,
        uuid,
        api_id::CUDA_STREAM_SYNCHRONIZE,
        vec![ParamDesc::handle_ref(stream)],
        0,
    );
    assert_eq!(code, 0);

    ws.shutdown();
}

#[test]
fn ondemand_reload_restores_on_first_touch() {
    let (ws, _sim) = workspace_with_sim();
    let client = ws.create_client("ondemand-job").unwrap();
    let uuid = client.uuid;

    let a = malloc(&ws, uuid, 1024);
    h2d(&ws, uuid, a, vec![0x42u8; 1024]);

    client.run_command(Command::MigrationTear { do_module: false }).unwrap();
    client.run_command(Command::MigrationOndemandReload).unwrap();

    // the next op touching the broken handle faults it back in, parents
    // first, before launching
    assert_eq!(d2h(&ws, uuid, a, 1024), vec![0x42u8; 1024]);

    ws.shutdown();
}
