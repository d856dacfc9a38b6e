use std::fs::File;

use rustix::process::getpid;
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::cli::Args;

pub fn init_tracing(args: &Args) -> std::io::Result<()> {
    let (log_path, stderr) = match args {
        Args::Parent {
            log_path, stderr, ..
        }
        | Args::Child {
            log_path, stderr, ..
        } => (log_path.clone(), *stderr),
    };

    if stderr {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        return Ok(());
    }

    let log_path = log_path.unwrap_or_else(|| {
        let pid = getpid();
        format!("/tmp/sockpass-{}-{}.log", args.role(), pid.as_raw_nonzero())
    });
    let file = File::create(&log_path)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(())
}
