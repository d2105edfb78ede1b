//! The per-client parser thread.
//!
//! A single-threaded cooperative loop: drain control commands first, then
//! pop one API context, resolve its handle references, and hand it to the
//! worker. Parser-detected failures complete through the parser's own
//! completion queue and never reach the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use shade_core::TscTimer;

use crate::api::{ApiManager, ParseEnv};
use crate::apicxt::ApiContext;
use crate::command::{Command, CommandQe};
use crate::device::DEV_ERR_INVALID_VALUE;
use crate::handle::Managers;
use crate::queue::QueueGroup;

pub struct Parser {
    uuid: u64,
    managers: Arc<Managers>,
    queues: Arc<QueueGroup>,
    api_mgr: Arc<ApiManager>,
    timer: TscTimer,
    /// 0 disables the periodic checkpoint ticker.
    ckpt_interval_ticks: u64,
    last_ckpt_tick: u64,
    /// Shared with client init so vertex ids stay unique per client.
    vertex_alloc: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl Parser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: u64,
        managers: Arc<Managers>,
        queues: Arc<QueueGroup>,
        api_mgr: Arc<ApiManager>,
        timer: TscTimer,
        ckpt_interval_ticks: u64,
        vertex_alloc: Arc<AtomicU64>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let last_ckpt_tick = timer.now();
        Self {
            uuid,
            managers,
            queues,
            api_mgr,
            timer,
            ckpt_interval_ticks,
            last_ckpt_tick,
            vertex_alloc,
            shutdown,
        }
    }

    pub fn run(mut self) {
        debug!(uuid = self.uuid, "parser loop started");
        loop {
            // relay finished commands back to the OOB side
            while let Some(done) = self.queues.cmd_parser2worker_cq.pop() {
                self.queues.cmd_oob2parser_cq.push_blocking(done);
            }

            // control plane first: commands quiesce the data plane simply by
            // traversing the same thread
            while let Some(cmd) = self.queues.cmd_oob2parser_wq.pop() {
                self.forward_command(cmd);
            }

            self.maybe_tick_checkpoint();

            match self.queues.apicxt_rpc2parser_wq.pop() {
                Some(qe) => self.parse_qe(qe),
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        debug!(uuid = self.uuid, "parser loop exited");
    }

    fn forward_command(&self, cmd: Box<CommandQe>) {
        trace!(uuid = self.uuid, cmd = ?cmd.cmd, "forwarding command to worker");
        self.queues.cmd_parser2worker_wq.push_blocking(cmd);
    }

    /// Enqueue a checkpoint tick when the configured interval elapsed.
    fn maybe_tick_checkpoint(&mut self) {
        if self.ckpt_interval_ticks == 0 {
            return;
        }
        let now = self.timer.now();
        if now.wrapping_sub(self.last_ckpt_tick) >= self.ckpt_interval_ticks {
            self.last_ckpt_tick = now;
            self.queues
                .cmd_parser2worker_wq
                .push_blocking(CommandQe::new(Command::CheckpointTick { version: now }));
        }
    }

    fn parse_qe(&mut self, mut qe: Box<ApiContext>) {
        let env = ParseEnv { managers: &self.managers };

        let parse_result = self
            .api_mgr
            .get(qe.api_id)
            .and_then(|meta| (meta.parse)(&env, &mut qe));

        match parse_result {
            Ok(()) => {
                // stamp DAG vertices for handles this op creates, ordered by
                // the op's instance pc
                for handle in &qe.create_handles {
                    handle.set_dag_vertex_id(self.vertex_alloc.fetch_add(1, Ordering::Relaxed));
                }
                trace!(
                    uuid = self.uuid,
                    api_id = format_args!("{:#x}", qe.api_id),
                    pc = qe.inst_pc,
                    "parsed"
                );
                self.queues.apicxt_parser2worker_wq.push_blocking(qe);
            }
            Err(e) => {
                warn!(
                    uuid = self.uuid,
                    api_id = format_args!("{:#x}", qe.api_id),
                    pc = qe.inst_pc,
                    error = %e,
                    "parse failed, short-circuiting completion"
                );
                qe.return_code = DEV_ERR_INVALID_VALUE;
                qe.parse_error = Some(e);
                self.queues.apicxt_rpc2parser_cq.push_blocking(qe);
            }
        }
    }
}
