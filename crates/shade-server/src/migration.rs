//! Migration engine: pre-copy, delta-copy, tear, and reload phases, plus
//! the receiving side that stages inbound state on the target daemon.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::messages::MigrationPayload;
use shade_protocol::resource::ResourceTypeId;
use shade_protocol::Message;
use shade_transport::FramedEndpoint;

use crate::command::Command;
use crate::device::GpuDevice;
use crate::handle::serialize::serialize_handle;
use crate::handle::{vtable, Handle, HandleStatus, Managers};
use crate::restore::instantiate_images;

/// Per-client migration state on the source side.
pub struct MigrationCtx {
    pub target_endpoint: Option<String>,
    /// Job name announced to the target daemon on connect.
    pub job_name: String,
    endpoint: Option<FramedEndpoint>,
    /// Version stamped on the pre-copy pass, if one ran.
    pub precopy_version: Option<u64>,
    /// Lazy fault-in requested: broken handles reload on first touch.
    pub ondemand: bool,
    version_counter: u64,
}

impl MigrationCtx {
    pub fn new() -> Self {
        Self {
            target_endpoint: None,
            job_name: String::new(),
            endpoint: None,
            precopy_version: None,
            ondemand: false,
            version_counter: 0,
        }
    }

    pub fn next_version(&mut self) -> u64 {
        self.version_counter += 1;
        self.version_counter
    }

    fn endpoint(&mut self) -> ShadeResult<&mut FramedEndpoint> {
        if self.endpoint.is_none() {
            let addr = self
                .target_endpoint
                .clone()
                .ok_or_else(|| ShadeError::NotReady("no migration target configured".into()))?;
            let mut ep = FramedEndpoint::connect(&addr)
                .map_err(|e| ShadeError::Failed(format!("migration connect failed: {e}")))?;
            ep.send(&Message::Hello {
                protocol_version: shade_protocol::PROTOCOL_VERSION,
                name: self.job_name.clone(),
            })
            .map_err(|e| ShadeError::Failed(format!("migration hello failed: {e}")))?;
            self.endpoint = Some(ep);
        }
        Ok(self.endpoint.as_mut().expect("endpoint set above"))
    }

    pub fn reset(&mut self) {
        self.endpoint = None;
        self.precopy_version = None;
        self.ondemand = false;
    }
}

impl Default for MigrationCtx {
    fn default() -> Self {
        Self::new()
    }
}

fn live_memory_handles(managers: &Managers) -> Vec<Arc<Handle>> {
    managers
        .get(ResourceTypeId::Memory)
        .read()
        .handles()
        .iter()
        .filter(|h| h.status() == HandleStatus::Active)
        .cloned()
        .collect()
}

fn send(ep: &mut FramedEndpoint, payload: MigrationPayload) -> ShadeResult<()> {
    ep.send(&Message::Migration(payload))
        .map_err(|e| ShadeError::Failed(format!("migration send failed: {e}")))
}

/// Capture a memory handle's current bytes into its bag and return them.
fn capture_memory(
    handle: &Arc<Handle>,
    device: &dyn GpuDevice,
    version: u64,
) -> ShadeResult<Vec<u8>> {
    (vtable::ops(ResourceTypeId::Memory).checkpoint)(handle, device, version, 0)?;
    let bag = handle.ckpt_bag.lock();
    Ok(bag
        .as_ref()
        .and_then(|b| b.get_version(version))
        .map(|s| s.data.clone())
        .unwrap_or_default())
}

/// Execute one migration phase on the worker thread.
pub fn run_phase(
    cmd: &Command,
    ctx: &mut MigrationCtx,
    managers: &Managers,
    device: &dyn GpuDevice,
) -> ShadeResult<()> {
    match cmd {
        Command::MigrationRemoteMalloc => remote_malloc(ctx, managers),
        Command::MigrationPrecopy => {
            // from here on, the modified set tracks what delta-copy resends
            managers.get(ResourceTypeId::Memory).write().drain_modified();
            let version = ctx.next_version();
            copy_memory(ctx, managers, device, version, None)?;
            ctx.precopy_version = Some(version);
            Ok(())
        }
        Command::MigrationDeltacopy => {
            if ctx.precopy_version.is_none() {
                return Err(ShadeError::NotReady("delta-copy without pre-copy".into()));
            }
            let dirty: Vec<Arc<Handle>> = managers
                .get(ResourceTypeId::Memory)
                .write()
                .drain_modified()
                .into_iter()
                .filter(|h| h.status() == HandleStatus::Active)
                .collect();
            let version = ctx.next_version();
            copy_memory(ctx, managers, device, version, Some(dirty))
        }
        Command::MigrationAllCopy => {
            let version = ctx.next_version();
            copy_memory(ctx, managers, device, version, None)
        }
        Command::MigrationTear { do_module } => tear(ctx, managers, device, *do_module),
        Command::MigrationRestoreContext { do_module } => {
            restore_context(managers, device, *do_module)
        }
        Command::MigrationAllReload => all_reload(managers, device),
        Command::MigrationOndemandReload => {
            ctx.ondemand = true;
            Ok(())
        }
        other => Err(ShadeError::InvalidInput(format!(
            "not a migration command: {other:?}"
        ))),
    }
}

/// Allocate device-memory twins on the target for every live memory handle.
fn remote_malloc(ctx: &mut MigrationCtx, managers: &Managers) -> ShadeResult<()> {
    let handles = live_memory_handles(managers);
    let ep = ctx.endpoint()?;
    for handle in &handles {
        send(
            ep,
            MigrationPayload::RemoteMalloc {
                client_addr: handle.client_addr(),
                size: handle.size,
            },
        )?;
        match ep.recv() {
            Ok(Message::Migration(MigrationPayload::RemoteMallocAck { client_addr, server_addr })) => {
                debug!(
                    client_addr = format_args!("{client_addr:#x}"),
                    server_addr = format_args!("{server_addr:#x}"),
                    "remote twin allocated"
                );
            }
            Ok(other) => {
                return Err(ShadeError::Failed(format!(
                    "unexpected remote-malloc reply: {other:?}"
                )))
            }
            Err(e) => return Err(ShadeError::Failed(format!("remote-malloc recv: {e}"))),
        }
    }
    info!(twins = handles.len(), "remote malloc phase done");
    Ok(())
}

/// Ship memory state to the target: everything, or only the given set.
fn copy_memory(
    ctx: &mut MigrationCtx,
    managers: &Managers,
    device: &dyn GpuDevice,
    version: u64,
    only: Option<Vec<Arc<Handle>>>,
) -> ShadeResult<()> {
    let handles = only.unwrap_or_else(|| live_memory_handles(managers));
    let mut shipped = 0u64;
    for handle in &handles {
        let data = capture_memory(handle, device, version)?;
        let ep = ctx.endpoint()?;
        send(
            ep,
            MigrationPayload::MemoryChunk {
                client_addr: handle.client_addr(),
                version,
                data,
            },
        )?;
        shipped += 1;
    }
    let ep = ctx.endpoint()?;
    send(ep, MigrationPayload::PhaseDone { phase_mask: 0 })?;
    info!(shipped, version, "memory copy phase done");
    Ok(())
}

/// Quiesce is implicit (commands traverse the worker); ship handle images,
/// then free server-side resources, children before parents. Device handles
/// survive; modules survive unless `do_module`.
fn tear(
    ctx: &mut MigrationCtx,
    managers: &Managers,
    device: &dyn GpuDevice,
    do_module: bool,
) -> ShadeResult<()> {
    if ctx.target_endpoint.is_some() {
        let mut images = Vec::new();
        for (_, mgr_lock) in managers.iter() {
            let mgr = mgr_lock.read();
            for handle in mgr.handles() {
                if handle.status() == HandleStatus::Active {
                    images.push((handle.resource_type, serialize_handle(handle)));
                }
            }
        }
        let ep = ctx.endpoint()?;
        for (resource_type, data) in images {
            send(ep, MigrationPayload::HandleImage { resource_type, data })?;
        }
    }

    for rt in ResourceTypeId::RESTORE_ORDER.into_iter().rev() {
        if rt == ResourceTypeId::Device {
            continue;
        }
        if rt == ResourceTypeId::Module && !do_module {
            continue;
        }
        let handles: Vec<Arc<Handle>> = managers
            .get(rt)
            .read()
            .handles()
            .iter()
            .filter(|h| h.status() == HandleStatus::Active)
            .cloned()
            .collect();
        for handle in handles {
            if let Err(code) = tear_native(rt, &handle, device) {
                warn!(?rt, code, "tear of native resource failed");
            }
            handle.set_status(HandleStatus::Broken);
        }
    }
    info!(do_module, "tear phase done");
    Ok(())
}

fn tear_native(rt: ResourceTypeId, handle: &Handle, device: &dyn GpuDevice) -> Result<(), i32> {
    match rt {
        ResourceTypeId::Memory => device.free(handle.server_addr()),
        ResourceTypeId::Stream => device.stream_destroy(handle.server_addr()),
        ResourceTypeId::Event => device.event_destroy(handle.server_addr()),
        ResourceTypeId::Module => device.module_unload(handle.server_addr()),
        ResourceTypeId::Context => device.ctx_destroy(handle.server_addr()),
        ResourceTypeId::BlasContext => device.blas_destroy(handle.server_addr()),
        // functions, vars and devices die with their parents
        _ => Ok(()),
    }
}

/// Re-create contexts (and optionally modules) on a fresh device.
fn restore_context(managers: &Managers, device: &dyn GpuDevice, do_module: bool) -> ShadeResult<()> {
    let mut kinds = vec![ResourceTypeId::Context];
    if do_module {
        kinds.push(ResourceTypeId::Module);
    }
    for rt in kinds {
        let handles: Vec<Arc<Handle>> = managers.get(rt).read().handles().to_vec();
        for handle in handles {
            if handle.status() == HandleStatus::Broken {
                (vtable::ops(rt).restore)(&handle, device)?;
            }
        }
    }
    Ok(())
}

/// Non-incremental baseline: restore every broken handle of every kind.
fn all_reload(managers: &Managers, device: &dyn GpuDevice) -> ShadeResult<()> {
    for (rt, mgr_lock) in managers.iter() {
        let handles: Vec<Arc<Handle>> = mgr_lock.read().handles().to_vec();
        for handle in handles {
            if handle.status() == HandleStatus::Broken {
                (vtable::ops(rt).restore)(&handle, device)?;
            }
        }
    }
    Ok(())
}

// ── target side ─────────────────────────────────────────────────

/// Inbound migration state staged on the target daemon before the client's
/// handle graph is instantiated.
#[derive(Default)]
pub struct MigrationTarget {
    /// client_addr -> (version, bytes); newest version wins.
    staged: HashMap<u64, (u64, Vec<u8>)>,
    /// client_addr -> pre-allocated device twin.
    twins: HashMap<u64, u64>,
    images: Vec<(ResourceTypeId, Vec<u8>)>,
}

impl MigrationTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound payload; returns the reply to send, if any.
    pub fn handle_payload(
        &mut self,
        payload: MigrationPayload,
        device: &dyn GpuDevice,
    ) -> ShadeResult<Option<MigrationPayload>> {
        match payload {
            MigrationPayload::RemoteMalloc { client_addr, size } => {
                let server_addr = device
                    .malloc(size)
                    .map_err(|c| ShadeError::Failed(format!("twin malloc failed: {c}")))?;
                self.twins.insert(client_addr, server_addr);
                Ok(Some(MigrationPayload::RemoteMallocAck { client_addr, server_addr }))
            }
            MigrationPayload::MemoryChunk { client_addr, version, data } => {
                let newer = self
                    .staged
                    .get(&client_addr)
                    .map_or(true, |(stored, _)| version >= *stored);
                if newer {
                    self.staged.insert(client_addr, (version, data));
                }
                Ok(None)
            }
            MigrationPayload::HandleImage { resource_type, data } => {
                self.images.push((resource_type, data));
                Ok(None)
            }
            MigrationPayload::RemoteMallocAck { .. } | MigrationPayload::PhaseDone { .. } => Ok(None),
        }
    }

    /// Instantiate the shipped handle graph into a client's managers,
    /// preferring staged chunks and pre-allocated twins.
    pub fn instantiate(self, managers: &Managers, device: &dyn GpuDevice) -> ShadeResult<()> {
        use crate::handle::serialize::deserialize_handle;

        let mut sections: Vec<(ResourceTypeId, Vec<crate::handle::serialize::HandleImage>)> =
            ResourceTypeId::RESTORE_ORDER.into_iter().map(|rt| (rt, Vec::new())).collect();
        for (rt, data) in self.images {
            let img = deserialize_handle(&data)?;
            let slot = sections
                .iter_mut()
                .find(|(t, _)| *t == rt)
                .expect("all kinds present in section list");
            slot.1.push(img);
        }

        instantiate_images(managers, device, sections, &self.staged, &self.twins)
    }
}

// ── inbound migration acceptor ──────────────────────────────────

/// Accepts migration connections from peer daemons: stages inbound state
/// and instantiates it into a freshly registered client when the source
/// closes the channel.
pub struct MigrationAcceptor {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl MigrationAcceptor {
    pub fn spawn(
        workspace: Arc<crate::workspace::Workspace>,
        bind: &str,
    ) -> ShadeResult<Self> {
        use std::sync::atomic::{AtomicBool, Ordering};

        let listener = std::net::TcpListener::bind(bind)
            .map_err(|e| ShadeError::Failed(format!("migration bind {bind} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("shade-migration".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!(%peer, "inbound migration connection");
                            stream.set_nonblocking(false).ok();
                            let ep = FramedEndpoint::from_stream(stream);
                            if let Err(e) = serve_inbound(ep, &workspace) {
                                warn!(error = %e, "inbound migration failed");
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(std::time::Duration::from_millis(10));
                        }
                        Err(e) => {
                            warn!(error = %e, "migration accept failed");
                            std::thread::sleep(std::time::Duration::from_millis(100));
                        }
                    }
                }
            })
            .map_err(|e| ShadeError::Failed(format!("failed to spawn migration thread: {e}")))?;

        info!(%local_addr, "migration acceptor listening");
        Ok(Self { shutdown, thread: Some(thread), local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for MigrationAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_inbound(
    mut ep: FramedEndpoint,
    workspace: &Arc<crate::workspace::Workspace>,
) -> ShadeResult<()> {
    let job_name = match ep.recv() {
        Ok(Message::Hello { name, .. }) => name,
        Ok(other) => {
            return Err(ShadeError::InvalidInput(format!(
                "migration channel opened with {other:?}"
            )))
        }
        Err(e) => return Err(ShadeError::Failed(format!("migration hello recv: {e}"))),
    };

    let client = workspace.create_client(&job_name)?;
    let mut target = MigrationTarget::new();

    loop {
        match ep.recv() {
            Ok(Message::Migration(payload)) => {
                if let Some(reply) = target.handle_payload(payload, workspace.device.as_ref())? {
                    ep.send(&Message::Migration(reply))
                        .map_err(|e| ShadeError::Failed(format!("migration reply: {e}")))?;
                }
            }
            Ok(other) => {
                warn!(?other, "unexpected message on migration channel");
            }
            // source closed the channel: everything staged, instantiate
            Err(_) => break,
        }
    }

    target.instantiate(&client.managers, workspace.device.as_ref())?;
    info!(uuid = client.uuid, job_name = %client.job_name, "migrated client instantiated");
    Ok(())
}
