//! The per-client worker thread: executes real device calls, completes
//! QEs, and runs checkpoint ticks and migration phases at the boundaries
//! between data-plane elements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use shade_core::{ShadeError, ShadeResult};

use crate::api::{ApiManager, LaunchEnv};
use crate::apicxt::ApiContext;
use crate::checkpoint::CkptStation;
use crate::command::{Command, CommandQe};
use crate::device::{GpuDevice, DEV_ERR_INVALID_VALUE};
use crate::handle::{vtable, BrokenLayers, Handle, HandleStatus, Managers};
use crate::migration::{self, MigrationCtx};
use crate::queue::QueueGroup;
use crate::restore;

pub struct Worker {
    uuid: u64,
    managers: Arc<Managers>,
    queues: Arc<QueueGroup>,
    api_mgr: Arc<ApiManager>,
    device: Arc<dyn GpuDevice>,
    migration: Arc<Mutex<MigrationCtx>>,
    station: Arc<Mutex<CkptStation>>,
    shutdown: Arc<AtomicBool>,

    /// Private device work stream, created on first use.
    worker_stream: Option<u64>,
    /// Dedicated stream for async checkpoint copies.
    ckpt_stream: Option<u64>,
    /// Version of the checkpoint pass whose async copies are still in
    /// flight; observed complete at the next loop boundary.
    ckpt_pending: Option<u64>,
    /// Version source for captures not driven by a parser tick.
    manual_version: u64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: u64,
        managers: Arc<Managers>,
        queues: Arc<QueueGroup>,
        api_mgr: Arc<ApiManager>,
        device: Arc<dyn GpuDevice>,
        migration: Arc<Mutex<MigrationCtx>>,
        station: Arc<Mutex<CkptStation>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            uuid,
            managers,
            queues,
            api_mgr,
            device,
            migration,
            station,
            shutdown,
            worker_stream: None,
            ckpt_stream: None,
            ckpt_pending: None,
            manual_version: 0,
        }
    }

    pub fn run(mut self) {
        debug!(uuid = self.uuid, "worker loop started");
        loop {
            // boundary: observe completion of in-flight checkpoint copies
            if let Some(version) = self.ckpt_pending.take() {
                if let Some(stream) = self.ckpt_stream {
                    if let Err(code) = self.device.stream_synchronize(stream) {
                        warn!(uuid = self.uuid, version, code, "ckpt stream sync failed");
                    }
                }
            }

            while let Some(cmd) = self.queues.cmd_parser2worker_wq.pop() {
                self.process_command(cmd);
            }

            match self.queues.apicxt_parser2worker_wq.pop() {
                Some(qe) => self.process_qe(qe),
                None => {
                    if self.shutdown.load(Ordering::Acquire)
                        && self.queues.apicxt_parser2worker_wq.is_empty()
                        && self.queues.cmd_parser2worker_wq.is_empty()
                    {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        debug!(uuid = self.uuid, "worker loop exited");
    }

    fn ensure_worker_stream(&mut self) -> u64 {
        if self.worker_stream.is_none() {
            match self.device.stream_create() {
                Ok(s) => self.worker_stream = Some(s),
                Err(code) => {
                    warn!(uuid = self.uuid, code, "worker stream creation failed, using default");
                    self.worker_stream = Some(0);
                }
            }
        }
        self.worker_stream.expect("set above")
    }

    fn ensure_ckpt_stream(&mut self) -> u64 {
        if self.ckpt_stream.is_none() {
            match self.device.stream_create() {
                Ok(s) => self.ckpt_stream = Some(s),
                Err(code) => {
                    warn!(uuid = self.uuid, code, "ckpt stream creation failed, using default");
                    self.ckpt_stream = Some(0);
                }
            }
        }
        self.ckpt_stream.expect("set above")
    }

    fn process_qe(&mut self, mut qe: Box<ApiContext>) {
        // lazy fault-in: a broken dependency is restored, parents first,
        // before the op may launch
        let referenced = qe.referenced_handles();
        if referenced.iter().any(|h| h.status() == HandleStatus::Broken) {
            self.restore_layers(&referenced);
        }

        let launch_result = match self.api_mgr.get(qe.api_id).map(|meta| meta.launch) {
            Ok(launch) => {
                let worker_stream = self.ensure_worker_stream();
                let env = LaunchEnv {
                    device: self.device.as_ref(),
                    managers: &self.managers,
                    worker_stream,
                };
                launch(&env, &mut qe)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = launch_result {
            warn!(
                uuid = self.uuid,
                api_id = format_args!("{:#x}", qe.api_id),
                pc = qe.inst_pc,
                error = %e,
                "launch fault"
            );
            if !qe.device_failed() {
                qe.return_code = DEV_ERR_INVALID_VALUE;
            }
            qe.parse_error = Some(e);
        }

        // a mutation racing an in-flight async checkpoint invalidates that
        // capture; the pc is recorded for the next tick to re-capture
        if let Some(version) = self.ckpt_pending {
            for r in qe.inout_handles.iter().chain(qe.output_handles.iter()) {
                let mut bag = r.handle.ckpt_bag.lock();
                if let Some(bag) = bag.as_mut() {
                    if bag.latest_version() == Some(version) {
                        if bag.invalidate_latest().is_ok() {
                            self.queues
                                .apicxt_workerlocal_ckptdag_wq
                                .push_blocking(qe.inst_pc);
                        }
                    }
                }
            }
        }

        if qe.device_failed() {
            self.handle_device_failure(&qe);
        } else {
            trace!(
                uuid = self.uuid,
                api_id = format_args!("{:#x}", qe.api_id),
                pc = qe.inst_pc,
                "done"
            );
        }

        self.queues.apicxt_rpc2worker_cq.push_blocking(qe);
    }

    /// Device failure: mark the touched handles broken and schedule their
    /// restoration. The call itself still completes with the device-native
    /// error code.
    fn handle_device_failure(&mut self, qe: &ApiContext) {
        let referenced = qe.referenced_handles();
        for handle in &referenced {
            if handle.status() != HandleStatus::Deleted {
                handle.set_status(HandleStatus::Broken);
            }
        }
        warn!(
            uuid = self.uuid,
            api_id = format_args!("{:#x}", qe.api_id),
            return_code = qe.return_code,
            broken = referenced.len(),
            "device failure, restoring broken handles"
        );
        self.restore_layers(&referenced);
    }

    /// Collect broken ancestors of the seeds and restore wave by wave,
    /// deepest layer first.
    fn restore_layers(&mut self, seeds: &[Arc<Handle>]) {
        let mut layers = BrokenLayers::new();
        for seed in seeds {
            seed.collect_broken(&mut layers, 0);
        }
        for handle in layers.iter_deepest_first() {
            if handle.status() == HandleStatus::Active {
                continue;
            }
            if let Err(e) = (vtable::ops(handle.resource_type).restore)(handle, self.device.as_ref())
            {
                warn!(
                    uuid = self.uuid,
                    resource_type = ?handle.resource_type,
                    client_addr = format_args!("{:#x}", handle.client_addr()),
                    error = %e,
                    "restore failed"
                );
            }
        }
    }

    fn process_command(&mut self, mut cmd: Box<CommandQe>) {
        debug!(uuid = self.uuid, cmd = ?cmd.cmd, "processing command");
        let result = match cmd.cmd.clone() {
            Command::CheckpointTick { version } => self.checkpoint_tick(version),
            Command::CheckpointDump { image_path } => self.checkpoint_dump(&image_path),
            Command::Restore { image_path } => restore::restore_client_from_file(
                &self.managers,
                self.device.as_ref(),
                &image_path,
            ),
            ref migration_cmd => {
                let ctx_lock = self.migration.clone();
                let mut ctx = ctx_lock.lock();
                migration::run_phase(migration_cmd, &mut ctx, &self.managers, self.device.as_ref())
            }
        };
        if let Err(ref e) = result {
            warn!(uuid = self.uuid, cmd = ?cmd.cmd, error = %e, "command failed");
        }
        cmd.result = result;
        self.queues.cmd_parser2worker_cq.push_blocking(cmd);
    }

    /// One checkpoint pass: capture every handle modified since the last
    /// tick onto the dedicated stream. Copies are asynchronous; completion
    /// is observed at the next boundary.
    fn checkpoint_tick(&mut self, version: u64) -> ShadeResult<()> {
        let stream = self.ensure_ckpt_stream();

        // leftover conflict records from the previous pass are stale now
        while self.queues.apicxt_workerlocal_ckptdag_wq.pop().is_some() {}

        let mut captured = 0u64;
        for (rt, mgr_lock) in self.managers.iter() {
            let modified = mgr_lock.write().drain_modified();
            for handle in modified {
                if handle.status() != HandleStatus::Active || handle.state_size == 0 {
                    continue;
                }
                match (vtable::ops(rt).checkpoint)(&handle, self.device.as_ref(), version, stream) {
                    Ok(()) => captured += 1,
                    Err(e) => warn!(
                        uuid = self.uuid,
                        resource_type = ?rt,
                        client_addr = format_args!("{:#x}", handle.client_addr()),
                        error = %e,
                        "checkpoint capture failed"
                    ),
                }
            }
        }

        if captured > 0 {
            self.ckpt_pending = Some(version);
        }
        self.manual_version = self.manual_version.max(version);
        debug!(uuid = self.uuid, version, captured, "checkpoint tick");
        Ok(())
    }

    /// Full dump: capture every live stateful handle, then serialize all
    /// managers into the station and collapse it to an image file.
    fn checkpoint_dump(&mut self, image_path: &str) -> ShadeResult<()> {
        self.manual_version += 1;
        let version = self.manual_version;
        let stream = self.ensure_ckpt_stream();

        for (rt, mgr_lock) in self.managers.iter() {
            let handles: Vec<Arc<Handle>> = mgr_lock.read().handles().to_vec();
            for handle in handles {
                if handle.status() != HandleStatus::Active || handle.state_size == 0 {
                    continue;
                }
                (vtable::ops(rt).checkpoint)(&handle, self.device.as_ref(), version, stream)?;
            }
            mgr_lock.write().drain_modified();
        }
        if let Err(code) = self.device.stream_synchronize(stream) {
            return Err(ShadeError::Failed(format!("ckpt stream sync failed: {code}")));
        }

        let mut station = self.station.lock();
        station.clear();
        restore::dump_client(&self.managers, &mut station);
        station.collapse_to_image_file(image_path)?;
        debug!(uuid = self.uuid, image_path, bytes = station.byte_size(), "image collapsed");
        Ok(())
    }
}
