//! Control-plane work elements: checkpoint ticks and migration/restore
//! phases. Commands travel the same per-client pipeline as API contexts, so
//! they are totally ordered against the data plane.

use shade_core::ShadeResult;
use shade_protocol::messages::MigrationPhaseMask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Periodic checkpoint of all modified handles.
    CheckpointTick { version: u64 },
    /// Serialize every live handle and collapse the station to a file.
    CheckpointDump { image_path: String },

    MigrationRemoteMalloc,
    MigrationPrecopy,
    MigrationDeltacopy,
    MigrationTear { do_module: bool },
    MigrationRestoreContext { do_module: bool },
    MigrationOndemandReload,
    MigrationAllCopy,
    MigrationAllReload,

    /// Rebuild client state from a checkpoint image.
    Restore { image_path: String },
}

impl Command {
    /// Expand a CLI phase mask into the ordered command sequence.
    pub fn from_phase_mask(mask: MigrationPhaseMask) -> Vec<Command> {
        let mut cmds = Vec::new();
        if mask.contains(MigrationPhaseMask::REMOTE_MALLOC) {
            cmds.push(Command::MigrationRemoteMalloc);
        }
        if mask.contains(MigrationPhaseMask::ALLCOPY) {
            cmds.push(Command::MigrationAllCopy);
        }
        if mask.contains(MigrationPhaseMask::PRECOPY) {
            cmds.push(Command::MigrationPrecopy);
        }
        if mask.contains(MigrationPhaseMask::DELTACOPY) {
            cmds.push(Command::MigrationDeltacopy);
        }
        if mask.contains(MigrationPhaseMask::TEAR) {
            cmds.push(Command::MigrationTear {
                do_module: mask.contains(MigrationPhaseMask::TEAR_MODULE),
            });
        }
        if mask.contains(MigrationPhaseMask::RESTORE) {
            cmds.push(Command::MigrationRestoreContext {
                do_module: mask.contains(MigrationPhaseMask::TEAR_MODULE),
            });
        }
        if mask.contains(MigrationPhaseMask::ALLRELOAD) {
            cmds.push(Command::MigrationAllReload);
        }
        if mask.contains(MigrationPhaseMask::ONDEMAND) {
            cmds.push(Command::MigrationOndemandReload);
        }
        cmds
    }
}

/// A command plus its completion status, pushed back through the command
/// completion queues.
pub struct CommandQe {
    pub cmd: Command,
    pub result: ShadeResult<()>,
}

impl CommandQe {
    pub fn new(cmd: Command) -> Box<Self> {
        Box::new(Self { cmd, result: Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_mask_expands_in_order() {
        let mask = MigrationPhaseMask::PRECOPY
            | MigrationPhaseMask::DELTACOPY
            | MigrationPhaseMask::TEAR
            | MigrationPhaseMask::TEAR_MODULE
            | MigrationPhaseMask::RESTORE;
        let cmds = Command::from_phase_mask(mask);
        assert_eq!(
            cmds,
            vec![
                Command::MigrationPrecopy,
                Command::MigrationDeltacopy,
                Command::MigrationTear { do_module: true },
                Command::MigrationRestoreContext { do_module: true },
            ]
        );
    }
}
