use std::ffi::OsString;
use std::thread;

use anyhow::{Context, bail};
use clap::Parser;
use core_affinity::CoreId;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fanout::balancer::{Primary, ReactorConfig, WorkerConfig, run_primary, run_worker};
use fanout::balancer::primary::{inherited_channel, spawn_worker};
use fanout::cli::CliArgs;
use fanout::core::constants::{WORKER_CHANNEL_ENV, WORKER_CHANNEL_FD};
use fanout::core::key::WorkerId;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.worker_id {
        Some(id) => worker_main(id, &args),
        None => primary_main(&args),
    }
}

fn primary_main(args: &CliArgs) -> anyhow::Result<()> {
    let spec = args.bind_spec();
    spec.key().context("invalid listen options")?;

    let count = args
        .workers
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()));
    if count == 0 {
        bail!("at least one worker is required");
    }

    let exe = std::env::current_exe().context("locating own executable")?;
    let forwarded: Vec<OsString> = std::env::args_os().skip(1).collect();

    info!(workers = count, ?spec, "starting fanout primary");

    let mut primary = Primary::new();
    for i in 0..count {
        let id = i as WorkerId + 1;
        let (child, channel) = spawn_worker(&exe, &forwarded, id)
            .with_context(|| format!("spawning worker {id}"))?;
        primary
            .add_worker(id, child, channel)
            .with_context(|| format!("registering worker {id}"))?;
    }

    run_primary(&mut primary, &ReactorConfig::default()).context("primary event loop")?;
    Ok(())
}

fn worker_main(id: WorkerId, args: &CliArgs) -> anyhow::Result<()> {
    let fd: i32 = match std::env::var(WORKER_CHANNEL_ENV) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{WORKER_CHANNEL_ENV}={raw}"))?,
        Err(_) => bail!("worker mode needs {WORKER_CHANNEL_ENV}; start without --worker-id"),
    };
    if fd != WORKER_CHANNEL_FD {
        warn!(fd, "channel on an unexpected descriptor");
    }

    if args.pin {
        pin(id);
    }

    // SAFETY: the primary leaves exactly this descriptor open for us.
    let channel = unsafe { inherited_channel(fd) };
    let config = WorkerConfig {
        max_connections: args.max_connections,
        ..WorkerConfig::new(id, args.bind_spec())
    };
    run_worker(channel, config).with_context(|| format!("worker {id}"))?;
    Ok(())
}

fn pin(id: WorkerId) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        warn!(worker = id, "core ids unavailable, not pinning");
        return;
    };
    let core: CoreId = cores[id as usize % cores.len()];
    if core_affinity::set_for_current(core) {
        info!(worker = id, core = core.id, "pinned");
    } else {
        warn!(worker = id, core = core.id, "pinning failed");
    }
}
