//! The workspace: owner of all clients and the real device. One instance
//! per daemon process, created at startup and passed down explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use shade_core::{ShadeConfig, ShadeError, ShadeResult, TscTimer};
use shade_protocol::api::ParamDesc;
use shade_protocol::messages::MAX_JOB_NAME_LEN;

use crate::api::ApiManager;
use crate::apicxt::ApiContext;
use crate::client::Client;
use crate::device::GpuDevice;

/// How long a synchronous call may wait on its completion before the
/// workspace gives up on the pipeline.
const COMPLETION_DEADLINE: Duration = Duration::from_secs(30);

/// Runtime-mutable workspace configuration, settable via the CLI.
pub struct WorkspaceConf {
    inner: Mutex<ConfValues>,
}

#[derive(Debug, Clone)]
struct ConfValues {
    daemon_log_path: String,
    client_log_path: String,
    ckpt_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfKey {
    DaemonLogPath,
    ClientLogPath,
    CkptIntervalMs,
}

impl WorkspaceConf {
    fn new(config: &ShadeConfig) -> Self {
        Self {
            inner: Mutex::new(ConfValues {
                daemon_log_path: config.daemon.daemon_log_path.clone(),
                client_log_path: config.daemon.client_log_path.clone(),
                ckpt_interval_ms: config.checkpoint.interval_ms,
            }),
        }
    }

    pub fn set(&self, key: ConfKey, val: &str) -> ShadeResult<()> {
        let mut inner = self.inner.lock();
        match key {
            ConfKey::DaemonLogPath => inner.daemon_log_path = val.to_string(),
            ConfKey::ClientLogPath => inner.client_log_path = val.to_string(),
            ConfKey::CkptIntervalMs => {
                inner.ckpt_interval_ms = val
                    .parse()
                    .map_err(|_| ShadeError::InvalidInput(format!("bad interval: {val}")))?;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: ConfKey) -> String {
        let inner = self.inner.lock();
        match key {
            ConfKey::DaemonLogPath => inner.daemon_log_path.clone(),
            ConfKey::ClientLogPath => inner.client_log_path.clone(),
            ConfKey::CkptIntervalMs => inner.ckpt_interval_ms.to_string(),
        }
    }

    fn ckpt_interval_ms(&self) -> u64 {
        self.inner.lock().ckpt_interval_ms
    }
}

pub struct Workspace {
    pub config: ShadeConfig,
    pub conf: WorkspaceConf,
    pub api_mgr: Arc<ApiManager>,
    pub device: Arc<dyn GpuDevice>,
    pub timer: TscTimer,

    clients: DashMap<u64, Arc<Client>>,
    next_uuid: AtomicU64,
}

impl Workspace {
    pub fn new(config: ShadeConfig, device: Arc<dyn GpuDevice>) -> Arc<Self> {
        let conf = WorkspaceConf::new(&config);
        Arc::new(Self {
            config,
            conf,
            api_mgr: ApiManager::new(),
            device,
            timer: TscTimer::new(),
            clients: DashMap::new(),
            next_uuid: AtomicU64::new(1),
        })
    }

    // ── client management ───────────────────────────────────────

    pub fn create_client(&self, job_name: &str) -> ShadeResult<Arc<Client>> {
        if job_name.is_empty() || job_name.len() > MAX_JOB_NAME_LEN {
            return Err(ShadeError::InvalidInput(format!(
                "job name must be 1..={MAX_JOB_NAME_LEN} bytes"
            )));
        }
        if self.clients.iter().any(|c| c.job_name == job_name) {
            return Err(ShadeError::AlreadyExist(format!("job {job_name} already registered")));
        }

        let uuid = self.next_uuid.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(
            uuid,
            job_name.to_string(),
            self.device.clone(),
            self.api_mgr.clone(),
            self.timer.clone(),
            self.conf.ckpt_interval_ms(),
        )?;
        self.clients.insert(uuid, client.clone());
        info!(uuid, job_name, "registered client");
        Ok(client)
    }

    pub fn get_client(&self, uuid: u64) -> ShadeResult<Arc<Client>> {
        self.clients
            .get(&uuid)
            .map(|c| c.clone())
            .ok_or_else(|| ShadeError::NotExist(format!("no client with uuid {uuid}")))
    }

    pub fn remove_client(&self, uuid: u64) -> ShadeResult<()> {
        let (_, client) = self
            .clients
            .remove(&uuid)
            .ok_or_else(|| ShadeError::NotExist(format!("no client with uuid {uuid}")))?;
        client.teardown();
        info!(uuid, "unregistered client");
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ── the entrance of every remoted call ──────────────────────

    /// Enqueue one API call on a client's pipeline. Synchronous calls block
    /// until their completion pops out of a completion queue; asynchronous
    /// ones return immediately after enqueue.
    pub fn process(
        &self,
        api_id: u64,
        uuid: u64,
        is_sync: bool,
        params: Vec<ParamDesc>,
        ret_data_len: u64,
    ) -> ShadeResult<(i32, Vec<u8>)> {
        let client = self.get_client(uuid)?;
        let pc = client.next_pc();
        let qe = ApiContext::new(api_id, uuid, pc, is_sync, params, ret_data_len);

        debug!(
            uuid,
            api_id = format_args!("{api_id:#x}"),
            pc,
            is_sync,
            "enqueue call"
        );
        client.queues.apicxt_rpc2parser_wq.push_blocking(qe);

        if !is_sync {
            return Ok((0, Vec::new()));
        }

        // completions surface in pipeline order; earlier entries belong to
        // async calls whose results are fire-and-forget
        let deadline = Instant::now() + COMPLETION_DEADLINE;
        loop {
            let done = client
                .queues
                .apicxt_rpc2worker_cq
                .pop()
                .or_else(|| client.queues.apicxt_rpc2parser_cq.pop());
            match done {
                Some(cqe) if cqe.inst_pc == pc => {
                    return Ok((cqe.return_code, cqe.ret_data.clone()));
                }
                Some(_) => continue,
                None => {
                    if Instant::now() > deadline {
                        return Err(ShadeError::Failed(format!(
                            "call {api_id:#x} pc {pc} timed out waiting for completion"
                        )));
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Tear down every client; used on daemon shutdown.
    pub fn shutdown(&self) {
        let uuids: Vec<u64> = self.clients.iter().map(|c| c.uuid).collect();
        for uuid in uuids {
            let _ = self.remove_client(uuid);
        }
    }
}
