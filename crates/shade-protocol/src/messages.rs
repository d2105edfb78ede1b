use serde::{Deserialize, Serialize};

use crate::api::ParamDesc;
use crate::error::ProtocolError;
use crate::resource::ResourceTypeId;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum length of a job name accepted on registration.
pub const MAX_JOB_NAME_LEN: usize = 256;

bitflags::bitflags! {
    /// Phases requested by a migration signal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigrationPhaseMask: u32 {
        const REMOTE_MALLOC = 0b0000_0001;
        const PRECOPY       = 0b0000_0010;
        const DELTACOPY     = 0b0000_0100;
        const TEAR          = 0b0000_1000;
        const TEAR_MODULE   = 0b0001_0000;
        const RESTORE       = 0b0010_0000;
        const ALLCOPY       = 0b0100_0000;
        const ALLRELOAD     = 0b1000_0000;
        const ONDEMAND      = 0b1_0000_0000;
    }
}

/// Top-level message envelope, shared by the RPC frontend, the out-of-band
/// control channel, and the migration data channel.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Message {
    // ── Connection establishment ────────────────────────────
    Hello {
        protocol_version: u32,
        name: String,
    },

    // ── Data plane ──────────────────────────────────────────
    /// One remoted API call.
    Call {
        uuid: u64,
        api_id: u64,
        is_sync: bool,
        params: Vec<ParamDesc>,
        ret_data_len: u64,
    },
    /// Completion of a remoted API call.
    CallReturn {
        return_code: i32,
        ret_data: Vec<u8>,
    },

    // ── Out-of-band control ─────────────────────────────────
    AgentRegisterClient {
        job_name: String,
    },
    AgentRegisterResult {
        registered: bool,
        uuid: u64,
    },
    AgentUnregisterClient {
        uuid: u64,
    },
    CliCheckpointSignal {
        uuid: u64,
        image_path: String,
    },
    CliMigrationSignal {
        uuid: u64,
        target_endpoint: String,
        /// Bits of `MigrationPhaseMask`.
        phase_mask: u32,
    },
    CliRestoreSignal {
        uuid: u64,
        image_path: String,
    },
    /// Testing hook: inject a synthetic call into a client's pipeline.
    UtilsMockApiCall {
        uuid: u64,
        api_id: u64,
        params: Vec<ParamDesc>,
        ret_data_len: u64,
    },
    OobAck {
        code: i32,
        message: String,
    },

    // ── Migration data ──────────────────────────────────────
    Migration(MigrationPayload),

    // ── Error ───────────────────────────────────────────────
    Error(ProtocolError),
}

/// Payloads flowing over the migration data channel between two daemons.
#[derive(Debug, Clone, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum MigrationPayload {
    /// Ask the target to allocate a device-memory twin for a source handle.
    RemoteMalloc {
        client_addr: u64,
        size: u64,
    },
    RemoteMallocAck {
        client_addr: u64,
        server_addr: u64,
    },
    /// State bytes of one memory handle (pre-copy / delta-copy / all-copy).
    MemoryChunk {
        client_addr: u64,
        version: u64,
        data: Vec<u8>,
    },
    /// Serialized image of one non-memory handle.
    HandleImage {
        resource_type: ResourceTypeId,
        data: Vec<u8>,
    },
    /// End of one migration phase.
    PhaseDone {
        phase_mask: u32,
    },
}
