//! Worker process serving the built-in Tessera units.
//!
//! Spawned by the coordinator's worker pool; speaks the length-prefixed IPC
//! protocol on stdin/stdout.

use tessera_worker::WorkerRuntime;
use tessera_worker::units::register_builtins;

fn main() -> anyhow::Result<()> {
    // stdout is the IPC channel, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut runtime = WorkerRuntime::new();
    register_builtins(&mut runtime);

    tracing::debug!("Worker {} ready", std::process::id());
    runtime.serve_stdio()?;
    Ok(())
}
