use clap::{Parser, Subcommand};
use tracing::info;

use shade_protocol::messages::MigrationPhaseMask;
use shade_protocol::Message;
use shade_transport::FramedEndpoint;

#[derive(Parser)]
#[command(name = "shade")]
#[command(about = "SHADE - device API remoting with transparent checkpoint and migration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (owns the device, serves remoted calls)
    Daemon {
        /// Configuration file path
        #[arg(short, long, default_value = "shade.toml")]
        config: String,

        /// Bind address override
        #[arg(short, long)]
        bind: Option<String>,

        /// Write PID to this file (for service managers)
        #[arg(long)]
        pid_file: Option<String>,
    },

    /// Checkpoint a client's device state to an image file
    Checkpoint {
        /// Daemon OOB address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:5213")]
        daemon: String,

        /// Client uuid
        #[arg(short, long)]
        uuid: u64,

        /// Path of the image file to write on the daemon host
        #[arg(short, long)]
        image: String,
    },

    /// Drive migration phases for a client
    Migrate {
        /// Daemon OOB address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:5213")]
        daemon: String,

        /// Client uuid
        #[arg(short, long)]
        uuid: u64,

        /// Migration channel of the target daemon (host:port)
        #[arg(short, long)]
        target: String,

        /// Phases to run, comma separated:
        /// remote-malloc,precopy,deltacopy,tear,tear-module,restore,allcopy,allreload,ondemand
        #[arg(short, long, default_value = "precopy,deltacopy,tear")]
        phases: String,
    },

    /// Restore a client from a checkpoint image
    Restore {
        /// Daemon OOB address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:5213")]
        daemon: String,

        /// Client uuid
        #[arg(short, long)]
        uuid: u64,

        /// Path of the image file on the daemon host
        #[arg(short, long)]
        image: String,
    },

    /// Inject a synthetic API call into a client's pipeline (testing hook)
    MockCall {
        /// Daemon OOB address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:5213")]
        daemon: String,

        /// Client uuid
        #[arg(short, long)]
        uuid: u64,

        /// API id to invoke
        #[arg(short, long)]
        api_id: u64,

        /// Expected return-data length
        #[arg(short, long, default_value_t = 8)]
        ret_len: u64,
    },
}

fn parse_phase_mask(phases: &str) -> anyhow::Result<MigrationPhaseMask> {
    let mut mask = MigrationPhaseMask::empty();
    for phase in phases.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        mask |= match phase {
            "remote-malloc" => MigrationPhaseMask::REMOTE_MALLOC,
            "precopy" => MigrationPhaseMask::PRECOPY,
            "deltacopy" => MigrationPhaseMask::DELTACOPY,
            "tear" => MigrationPhaseMask::TEAR,
            "tear-module" => MigrationPhaseMask::TEAR | MigrationPhaseMask::TEAR_MODULE,
            "restore" => MigrationPhaseMask::RESTORE,
            "allcopy" => MigrationPhaseMask::ALLCOPY,
            "allreload" => MigrationPhaseMask::ALLRELOAD,
            "ondemand" => MigrationPhaseMask::ONDEMAND,
            other => anyhow::bail!("unknown migration phase: {other}"),
        };
    }
    Ok(mask)
}

fn expect_ack(reply: Message) -> anyhow::Result<()> {
    match reply {
        Message::OobAck { code: 0, .. } => Ok(()),
        Message::OobAck { code, message } => anyhow::bail!("daemon refused ({code}): {message}"),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

fn main() -> anyhow::Result<()> {
    shade_core::logging::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config, bind, pid_file } => {
            if let Some(ref path) = pid_file {
                std::fs::write(path, std::process::id().to_string())?;
            }

            let mut cfg = shade_core::ShadeConfig::load_or_default(&config);
            if let Some(bind) = bind {
                cfg.daemon.bind = bind;
            }

            let oob_addr = format!("{}:{}", cfg.daemon.bind, cfg.daemon.oob_port);
            let rpc_addr = format!("{}:{}", cfg.daemon.bind, cfg.daemon.rpc_port);
            let migration_addr = format!("{}:{}", cfg.daemon.bind, cfg.daemon.migration_port);

            let device = shade_server::device::probe();
            let workspace = shade_server::Workspace::new(cfg, device);

            let _oob = shade_server::oob::OobServer::spawn(workspace.clone(), &oob_addr)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let _rpc = shade_server::rpc::RpcServer::spawn(workspace.clone(), &rpc_addr)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let _migration =
                shade_server::migration::MigrationAcceptor::spawn(workspace.clone(), &migration_addr)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;

            info!("daemon up: rpc {rpc_addr}, oob {oob_addr}, migration {migration_addr}");

            // acceptor threads own the work from here
            loop {
                std::thread::sleep(std::time::Duration::from_secs(60));
            }
        }

        Commands::Checkpoint { daemon, uuid, image } => {
            let mut ep = FramedEndpoint::connect(&daemon)?;
            let reply = ep.call(&Message::CliCheckpointSignal { uuid, image_path: image })?;
            expect_ack(reply)?;
            println!("checkpoint written");
            Ok(())
        }

        Commands::Migrate { daemon, uuid, target, phases } => {
            let mask = parse_phase_mask(&phases)?;
            let mut ep = FramedEndpoint::connect(&daemon)?;
            let reply = ep.call(&Message::CliMigrationSignal {
                uuid,
                target_endpoint: target,
                phase_mask: mask.bits(),
            })?;
            expect_ack(reply)?;
            println!("migration phases completed");
            Ok(())
        }

        Commands::Restore { daemon, uuid, image } => {
            let mut ep = FramedEndpoint::connect(&daemon)?;
            let reply = ep.call(&Message::CliRestoreSignal { uuid, image_path: image })?;
            expect_ack(reply)?;
            println!("client restored");
            Ok(())
        }

        Commands::MockCall { daemon, uuid, api_id, ret_len } => {
            let mut ep = FramedEndpoint::connect(&daemon)?;
            let reply = ep.call(&Message::UtilsMockApiCall {
                uuid,
                api_id,
                params: Vec::new(),
                ret_data_len: ret_len,
            })?;
            match reply {
                Message::CallReturn { return_code, ret_data } => {
                    println!("return_code={return_code} ret_data={ret_data:02x?}");
                    Ok(())
                }
                other => anyhow::bail!("unexpected reply: {other:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parsing() {
        let mask = parse_phase_mask("precopy, deltacopy,tear-module").unwrap();
        assert!(mask.contains(MigrationPhaseMask::PRECOPY));
        assert!(mask.contains(MigrationPhaseMask::DELTACOPY));
        assert!(mask.contains(MigrationPhaseMask::TEAR));
        assert!(mask.contains(MigrationPhaseMask::TEAR_MODULE));
        assert!(parse_phase_mask("warp-drive").is_err());
    }
}
