//! Client-side agent: registers the job with the daemon and keeps the
//! registration alive for the lifetime of the process.

mod config;

use clap::Parser;
use tracing::{error, info};

use shade_protocol::Message;
use shade_transport::FramedEndpoint;

use config::AgentConfig;

const DEFAULT_OOB_PORT: u16 = 5213;

#[derive(Parser)]
#[command(name = "shade-agent")]
#[command(about = "Registers a client job with the SHADE daemon")]
#[command(version)]
struct Cli {
    /// Agent configuration file (YAML)
    #[arg(short, long, default_value = "shade-agent.yaml")]
    config: String,
}

fn daemon_endpoint(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_OOB_PORT}")
    }
}

fn main() -> anyhow::Result<()> {
    shade_core::logging::init_logging();

    let cli = Cli::parse();
    let cfg = AgentConfig::load(&cli.config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let endpoint = daemon_endpoint(&cfg.daemon_addr);

    let mut ep = FramedEndpoint::connect(&endpoint)?;
    let uuid = match ep.call(&Message::AgentRegisterClient { job_name: cfg.job_name.clone() })? {
        Message::AgentRegisterResult { registered: true, uuid } => uuid,
        Message::AgentRegisterResult { registered: false, .. } => {
            anyhow::bail!("daemon refused registration for job {}", cfg.job_name)
        }
        other => anyhow::bail!("unexpected registration reply: {other:?}"),
    };
    info!(uuid, job_name = %cfg.job_name, "registered with daemon");
    println!("{uuid}");

    // stay registered until the process is told to exit
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    match ep.call(&Message::AgentUnregisterClient { uuid }) {
        Ok(Message::OobAck { code: 0, .. }) => info!(uuid, "unregistered"),
        Ok(other) => error!(?other, "unregister refused"),
        Err(e) => error!(error = %e, "unregister failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_gets_default_port() {
        assert_eq!(daemon_endpoint("127.0.0.1"), "127.0.0.1:5213");
        assert_eq!(daemon_endpoint("10.0.0.7:9999"), "10.0.0.7:9999");
    }
}
