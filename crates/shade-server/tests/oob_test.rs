//! Out-of-band control channel: registration, signals, and the mock-call
//! testing hook over real framed TCP.

use std::sync::Arc;

use shade_core::ShadeConfig;
use shade_protocol::api::{api_id, ParamDesc};
use shade_protocol::Message;
use shade_transport::FramedEndpoint;

use shade_server::device::{GpuDevice, SimDevice};
use shade_server::oob::OobServer;
use shade_server::Workspace;

fn spawn_daemon() -> (Arc<Workspace>, OobServer) {
    let sim = Arc::new(SimDevice::new());
    let ws = Workspace::new(ShadeConfig::default(), sim as Arc<dyn GpuDevice>);
    let oob = OobServer::spawn(ws.clone(), "127.0.0.1:0").unwrap();
    (ws, oob)
}

#[test]
fn register_mock_call_unregister() {
    let (ws, oob) = spawn_daemon();
    let mut ep = FramedEndpoint::connect(&oob.local_addr().to_string()).unwrap();

    // register
    let uuid = match ep
        .call(&Message::AgentRegisterClient { job_name: "oob-job".into() })
        .unwrap()
    {
        Message::AgentRegisterResult { registered: true, uuid } => uuid,
        other => panic!("registration failed: {other:?}"),
    };
    assert_eq!(ws.client_count(), 1);

    // duplicate job names are refused
    match ep
        .call(&Message::AgentRegisterClient { job_name: "oob-job".into() })
        .unwrap()
    {
        Message::AgentRegisterResult { registered: false, .. } => {}
        other => panic!("duplicate registration accepted: {other:?}"),
    }

    // an oversized job name is refused
    match ep
        .call(&Message::AgentRegisterClient { job_name: "x".repeat(300) })
        .unwrap()
    {
        Message::AgentRegisterResult { registered: false, .. } => {}
        other => panic!("oversized job name accepted: {other:?}"),
    }

    // the testing hook drives a real call through the pipeline
    match ep
        .call(&Message::UtilsMockApiCall {
            uuid,
            api_id: api_id::CUDA_MALLOC,
            params: vec![ParamDesc::value_u64(4096)],
            ret_data_len: 8,
        })
        .unwrap()
    {
        Message::CallReturn { return_code, ret_data } => {
            assert_eq!(return_code, 0);
            let addr = u64::from_le_bytes(ret_data[..8].try_into().unwrap());
            assert_eq!(addr, 0x0000_5555_0000_0000);
        }
        other => panic!("mock call failed: {other:?}"),
    }

    // checkpoint signal for an unknown uuid is refused with NotExist
    match ep
        .call(&Message::CliCheckpointSignal { uuid: 999, image_path: "/tmp/none".into() })
        .unwrap()
    {
        Message::OobAck { code: 2, .. } => {}
        other => panic!("expected NotExist ack: {other:?}"),
    }

    // unregister
    match ep.call(&Message::AgentUnregisterClient { uuid }).unwrap() {
        Message::OobAck { code: 0, .. } => {}
        other => panic!("unregister failed: {other:?}"),
    }
    assert_eq!(ws.client_count(), 0);
}

#[test]
fn checkpoint_signal_writes_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("oob.img");

    let (_ws, oob) = spawn_daemon();
    let mut ep = FramedEndpoint::connect(&oob.local_addr().to_string()).unwrap();

    let uuid = match ep
        .call(&Message::AgentRegisterClient { job_name: "snap-job".into() })
        .unwrap()
    {
        Message::AgentRegisterResult { registered: true, uuid } => uuid,
        other => panic!("registration failed: {other:?}"),
    };

    match ep
        .call(&Message::UtilsMockApiCall {
            uuid,
            api_id: api_id::CUDA_MALLOC,
            params: vec![ParamDesc::value_u64(1024)],
            ret_data_len: 8,
        })
        .unwrap()
    {
        Message::CallReturn { return_code: 0, .. } => {}
        other => panic!("mock malloc failed: {other:?}"),
    }

    match ep
        .call(&Message::CliCheckpointSignal {
            uuid,
            image_path: image_path.to_str().unwrap().to_string(),
        })
        .unwrap()
    {
        Message::OobAck { code: 0, .. } => {}
        other => panic!("checkpoint signal failed: {other:?}"),
    }
    assert!(image_path.exists());
    assert!(std::fs::metadata(&image_path).unwrap().len() > 0);
}
