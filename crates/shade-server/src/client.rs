//! One remote process: its handle managers, queue group, and the
//! parser/worker thread pair.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use shade_core::{ShadeError, ShadeResult, TscTimer};

use shade_protocol::resource::ResourceTypeId;

use crate::api::ApiManager;
use crate::checkpoint::CkptStation;
use crate::device::GpuDevice;
use crate::handle::{Handle, HandleExtra, HandleStatus, Managers, RelatedHandles};
use crate::migration::MigrationCtx;
use crate::parser::Parser;
use crate::queue::QueueGroup;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientStatus {
    CreatePending = 0,
    Active = 1,
    Hang = 2,
}

impl ClientStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ClientStatus::CreatePending,
            1 => ClientStatus::Active,
            _ => ClientStatus::Hang,
        }
    }
}

pub struct Client {
    pub uuid: u64,
    pub job_name: String,
    pub managers: Arc<Managers>,
    pub queues: Arc<QueueGroup>,
    pub migration: Arc<Mutex<MigrationCtx>>,
    pub station: Arc<Mutex<CkptStation>>,

    status: AtomicU8,
    api_inst_pc: AtomicU64,
    parser_shutdown: Arc<AtomicBool>,
    worker_shutdown: Arc<AtomicBool>,
    parser_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    worker_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Client {
    /// Build a client: instantiate handle managers, pre-populate device and
    /// context handles, and start the parser/worker pair.
    pub fn new(
        uuid: u64,
        job_name: String,
        device: Arc<dyn GpuDevice>,
        api_mgr: Arc<ApiManager>,
        timer: TscTimer,
        ckpt_interval_ms: u64,
    ) -> ShadeResult<Arc<Self>> {
        let managers = Managers::new_full();
        let queues = QueueGroup::new();
        let migration = Arc::new(Mutex::new(MigrationCtx::new()));
        migration.lock().job_name = job_name.clone();
        let station = Arc::new(Mutex::new(CkptStation::new()));
        let vertex_alloc = Arc::new(AtomicU64::new(1));

        Self::init_device_handles(&managers, device.as_ref(), &vertex_alloc)?;

        let parser_shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::new(AtomicBool::new(false));

        let ckpt_interval_ticks = if ckpt_interval_ms > 0 {
            timer.ms_to_ticks(ckpt_interval_ms)
        } else {
            0
        };

        let parser = Parser::new(
            uuid,
            managers.clone(),
            queues.clone(),
            api_mgr.clone(),
            timer.clone(),
            ckpt_interval_ticks,
            vertex_alloc,
            parser_shutdown.clone(),
        );
        let worker = Worker::new(
            uuid,
            managers.clone(),
            queues.clone(),
            api_mgr,
            device,
            migration.clone(),
            station.clone(),
            worker_shutdown.clone(),
        );

        let parser_thread = std::thread::Builder::new()
            .name(format!("shade-parser-{uuid}"))
            .spawn(move || parser.run())
            .map_err(|e| ShadeError::Failed(format!("failed to spawn parser: {e}")))?;
        let worker_thread = std::thread::Builder::new()
            .name(format!("shade-worker-{uuid}"))
            .spawn(move || worker.run())
            .map_err(|e| ShadeError::Failed(format!("failed to spawn worker: {e}")))?;

        info!(uuid, job_name, "client created");

        let client = Arc::new(Self {
            uuid,
            job_name,
            managers,
            queues,
            migration,
            station,
            status: AtomicU8::new(ClientStatus::Active as u8),
            api_inst_pc: AtomicU64::new(0),
            parser_shutdown,
            worker_shutdown,
            parser_thread: Mutex::new(Some(parser_thread)),
            worker_thread: Mutex::new(Some(worker_thread)),
        });
        Ok(client)
    }

    /// Pre-populate one Device handle per ordinal and the default context.
    fn init_device_handles(
        managers: &Managers,
        device: &dyn GpuDevice,
        vertex_alloc: &AtomicU64,
    ) -> ShadeResult<()> {
        let count = device
            .device_count()
            .map_err(|c| ShadeError::Failed(format!("device_count failed: {c}")))?;

        let mut first_device = None;
        {
            let mut mgr = managers.get(ResourceTypeId::Device).write();
            for ordinal in 0..count {
                let h = mgr.allocate_mocked(&RelatedHandles::new(), 0, None, 0)?;
                *h.extra.write() = HandleExtra::Device { ordinal };
                // ordinal is offset by one so a live device never reads as nil
                h.set_server_addr(ordinal as u64 + 1);
                h.set_dag_vertex_id(vertex_alloc.fetch_add(1, Ordering::Relaxed));
                mgr.mark_status(&h, HandleStatus::Active);
                if ordinal == 0 {
                    first_device = Some(h.clone());
                    mgr.latest_used = Some(h);
                }
            }
        }

        let device_handle: Arc<Handle> = first_device
            .ok_or_else(|| ShadeError::NotExist("no device present".into()))?;

        let ctx_addr = device
            .ctx_create(0)
            .map_err(|c| ShadeError::Failed(format!("ctx_create failed: {c}")))?;
        let mut related = RelatedHandles::new();
        related.insert(ResourceTypeId::Device, vec![device_handle]);
        let mut ctx_mgr = managers.get(ResourceTypeId::Context).write();
        let ctx = ctx_mgr.allocate_mocked(&related, 0, None, 0)?;
        ctx.set_server_addr(ctx_addr);
        ctx.set_dag_vertex_id(vertex_alloc.fetch_add(1, Ordering::Relaxed));
        ctx_mgr.mark_status(&ctx, HandleStatus::Active);
        ctx_mgr.latest_used = Some(ctx);

        Ok(())
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Obtain the current api instance pc and advance it.
    pub fn next_pc(&self) -> u64 {
        self.api_inst_pc.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one control command through the pipeline and wait for its
    /// completion. Must only be called from the OOB acceptor thread, which
    /// is the single producer on the OOB command ring.
    pub fn run_command(&self, cmd: crate::command::Command) -> ShadeResult<()> {
        use crate::command::CommandQe;

        self.queues.cmd_oob2parser_wq.push_blocking(CommandQe::new(cmd.clone()));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(60);
        loop {
            match self.queues.cmd_oob2parser_cq.pop() {
                Some(done) => return done.result,
                None => {
                    if std::time::Instant::now() > deadline {
                        return Err(ShadeError::Failed(format!("command {cmd:?} timed out")));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
    }

    /// Stop the pipeline: the parser drains and exits first, then the
    /// worker; in-flight device calls finish.
    pub fn teardown(&self) {
        self.set_status(ClientStatus::Hang);
        self.parser_shutdown.store(true, Ordering::Release);
        if let Some(t) = self.parser_thread.lock().take() {
            if t.join().is_err() {
                warn!(uuid = self.uuid, "parser thread panicked during teardown");
            }
        }
        self.worker_shutdown.store(true, Ordering::Release);
        if let Some(t) = self.worker_thread.lock().take() {
            if t.join().is_err() {
                warn!(uuid = self.uuid, "worker thread panicked during teardown");
            }
        }
        debug!(uuid = self.uuid, "client torn down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // threads hold only Arcs; make sure they exit if teardown was skipped
        self.parser_shutdown.store(true, Ordering::Release);
        self.worker_shutdown.store(true, Ordering::Release);
    }
}
