use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the daemon's tracing subscriber.
///
/// Verbosity comes from `SHADE_LOG` (standard env-filter directives, e.g.
/// `SHADE_LOG=shade_server::worker=trace,info`); without it everything logs
/// at info. Output is the compact single-line format with thread names, so
/// interleaved parser/worker lines stay attributable.
pub fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("SHADE_LOG")
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_thread_names(true);

    // ignore a second install, so binaries and test harnesses can both call
    // this unconditionally
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
