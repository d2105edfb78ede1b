//! Out-of-band control server.
//!
//! A single acceptor thread handles agent registration and CLI signals over
//! framed TCP. Connections are served one at a time: the acceptor is the
//! sole producer on every client's OOB command queue, which keeps those
//! rings single-producer.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::messages::MigrationPhaseMask;
use shade_protocol::{Message, ProtocolError};
use shade_transport::{FramedEndpoint, TransportError};

use crate::client::Client;
use crate::command::Command;
use crate::workspace::Workspace;

pub struct OobServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl OobServer {
    /// Bind and start the acceptor thread.
    pub fn spawn(workspace: Arc<Workspace>, bind: &str) -> ShadeResult<Self> {
        let listener = TcpListener::bind(bind)
            .map_err(|e| ShadeError::Failed(format!("oob bind {bind} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("shade-oob".to_string())
            .spawn(move || accept_loop(listener, workspace, thread_shutdown))
            .map_err(|e| ShadeError::Failed(format!("failed to spawn oob thread: {e}")))?;

        info!(%local_addr, "oob server listening");
        Ok(Self { shutdown, thread: Some(thread), local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for OobServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, workspace: Arc<Workspace>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "oob connection");
                stream.set_nonblocking(false).ok();
                let mut ep = FramedEndpoint::from_stream(stream);
                serve_connection(&mut ep, &workspace);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!(error = %e, "oob accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_connection(ep: &mut FramedEndpoint, workspace: &Arc<Workspace>) {
    loop {
        let msg = match ep.recv() {
            Ok(msg) => msg,
            Err(TransportError::Closed) => return,
            Err(e) => {
                debug!(error = %e, "oob recv failed");
                return;
            }
        };

        let reply = dispatch(msg, workspace);
        if let Err(e) = ep.send(&reply) {
            debug!(error = %e, "oob reply failed");
            return;
        }
    }
}

fn dispatch(msg: Message, workspace: &Arc<Workspace>) -> Message {
    match msg {
        Message::AgentRegisterClient { job_name } => match workspace.create_client(&job_name) {
            Ok(client) => Message::AgentRegisterResult { registered: true, uuid: client.uuid },
            Err(e) => {
                warn!(job_name, error = %e, "registration failed");
                Message::AgentRegisterResult { registered: false, uuid: 0 }
            }
        },

        Message::AgentUnregisterClient { uuid } => ack(workspace.remove_client(uuid)),

        Message::CliCheckpointSignal { uuid, image_path } => {
            ack(run_commands(workspace, uuid, vec![Command::CheckpointDump { image_path }]))
        }

        Message::CliMigrationSignal { uuid, target_endpoint, phase_mask } => {
            let mask = MigrationPhaseMask::from_bits_truncate(phase_mask);
            let result = workspace.get_client(uuid).and_then(|client| {
                client.migration.lock().target_endpoint = Some(target_endpoint.clone());
                run_commands_on(&client, Command::from_phase_mask(mask))
            });
            ack(result)
        }

        Message::CliRestoreSignal { uuid, image_path } => {
            ack(run_commands(workspace, uuid, vec![Command::Restore { image_path }]))
        }

        Message::UtilsMockApiCall { uuid, api_id, params, ret_data_len } => {
            match workspace.process(api_id, uuid, true, params, ret_data_len) {
                Ok((return_code, ret_data)) => Message::CallReturn { return_code, ret_data },
                Err(e) => Message::Error(ProtocolError::new(error_code(&e), e.to_string())),
            }
        }

        other => {
            warn!(?other, "unexpected oob message");
            Message::Error(ProtocolError::new(-1, "unexpected message"))
        }
    }
}

fn run_commands(workspace: &Arc<Workspace>, uuid: u64, cmds: Vec<Command>) -> ShadeResult<()> {
    let client = workspace.get_client(uuid)?;
    run_commands_on(&client, cmds)
}

/// Push commands through the client's OOB queue pair, one at a time.
fn run_commands_on(client: &Arc<Client>, cmds: Vec<Command>) -> ShadeResult<()> {
    for cmd in cmds {
        client.run_command(cmd)?;
    }
    Ok(())
}

fn ack(result: ShadeResult<()>) -> Message {
    match result {
        Ok(()) => Message::OobAck { code: 0, message: String::new() },
        Err(e) => Message::OobAck { code: error_code(&e), message: e.to_string() },
    }
}

fn error_code(e: &ShadeError) -> i32 {
    match e {
        ShadeError::InvalidInput(_) => 1,
        ShadeError::NotExist(_) => 2,
        ShadeError::AlreadyExist(_) => 3,
        ShadeError::Drain { .. } => 4,
        ShadeError::NotReady(_) => 5,
        ShadeError::NotImplemented(_) => 6,
        ShadeError::Failed(_) => 7,
    }
}
