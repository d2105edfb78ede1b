//! RPC frontend: accepts the data-plane connections carrying remoted API
//! calls.
//!
//! Each client process holds exactly one connection, so the connection
//! thread is the single producer on that client's rpc->parser ring.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use shade_core::ShadeError;
use shade_protocol::{Message, ProtocolError};
use shade_transport::{FramedEndpoint, TransportError};

use crate::workspace::Workspace;

pub struct RpcServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl RpcServer {
    pub fn spawn(workspace: Arc<Workspace>, bind: &str) -> Result<Self, ShadeError> {
        let listener = TcpListener::bind(bind)
            .map_err(|e| ShadeError::Failed(format!("rpc bind {bind} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("shade-rpc".to_string())
            .spawn(move || accept_loop(listener, workspace, thread_shutdown))
            .map_err(|e| ShadeError::Failed(format!("failed to spawn rpc thread: {e}")))?;

        info!(%local_addr, "rpc server listening");
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

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, workspace: Arc<Workspace>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "rpc connection");
                stream.set_nonblocking(false).ok();
                let ws = workspace.clone();
                std::thread::Builder::new()
                    .name(format!("shade-rpc-{peer}"))
                    .spawn(move || serve_connection(FramedEndpoint::from_stream(stream), ws))
                    .ok();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!(error = %e, "rpc accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_connection(mut ep: FramedEndpoint, workspace: Arc<Workspace>) {
    loop {
        let msg = match ep.recv() {
            Ok(msg) => msg,
            Err(TransportError::Closed) => return,
            Err(e) => {
                debug!(error = %e, "rpc recv failed");
                return;
            }
        };

        let reply = match msg {
            Message::Call { uuid, api_id, is_sync, params, ret_data_len } => {
                match workspace.process(api_id, uuid, is_sync, params, ret_data_len) {
                    Ok((return_code, ret_data)) => Message::CallReturn { return_code, ret_data },
                    Err(e) => Message::Error(ProtocolError::new(-1, e.to_string())),
                }
            }
            Message::Hello { protocol_version, name } => {
                debug!(protocol_version, name, "rpc hello");
                Message::Hello {
                    protocol_version: shade_protocol::PROTOCOL_VERSION,
                    name: "shade-daemon".to_string(),
                }
            }
            other => {
                warn!(?other, "unexpected rpc message");
                Message::Error(ProtocolError::new(-1, "unexpected message"))
            }
        };

        if let Err(e) = ep.send(&reply) {
            debug!(error = %e, "rpc reply failed");
            return;
        }
    }
}
