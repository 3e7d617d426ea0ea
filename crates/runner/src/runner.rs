//! The poll→claim→execute loop.
//!
//! Single-threaded cooperative loop: poll the control plane, claim, spawn
//! a detached executor task per job, cap concurrency with a semaphore.
//! SIGINT/SIGTERM stop polling and drain in-flight jobs; SIGUSR1 drains
//! without stopping immediately.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use vm_fleet::network::{
    NetnsPool, NetnsPoolConfig, setup_host_bridge, teardown_host_bridge,
};
use vm_fleet::{PrerequisiteConfig, ProcessScanner, RUNTIME_DIR};

use crate::api::ApiClient;
use crate::config::{self, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::executor::{self, ExecutorConfig};
use crate::http::HttpClient;
use crate::paths::RunnerPaths;
use crate::status::{RunnerMode, StatusTracker};

/// Grace period for orphaned firecracker processes found at startup.
const ORPHAN_KILL_GRACE: Duration = Duration::from_secs(5);

/// Load the config and run the main loop until shutdown.
pub async fn run_start(config_path: &Path) -> RunnerResult<()> {
    let config = config::load(config_path).await?;
    run(config).await
}

/// One-shot reconciliation pass (also runs automatically at start).
pub async fn run_reap(config_path: &Path) -> RunnerResult<()> {
    let _config = config::load(config_path).await?;
    let report = reap_and_kill_orphans().await?;
    info!(
        runners = report.removed_runner_indices.len(),
        taps = report.deleted_taps.len(),
        "reap finished"
    );
    Ok(())
}

/// Run the reaper and kill whatever firecracker processes it surfaced.
async fn reap_and_kill_orphans() -> RunnerResult<vm_fleet::ReapReport> {
    let scanner = ProcessScanner::new();
    let report = vm_fleet::reap_orphans(Path::new(RUNTIME_DIR), &scanner).await?;
    for orphan in &report.orphan_firecrackers {
        warn!(pid = orphan.pid, vm_id = %orphan.vm_id, "killing orphan firecracker");
        vm_fleet::kill_with_grace(orphan.pid, ORPHAN_KILL_GRACE).await?;
    }
    Ok(report)
}

async fn run(config: RunnerConfig) -> RunnerResult<()> {
    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .map_err(|e| RunnerError::Config(format!("create base dir: {e}")))?;

    // ----------------------------------------------------------------
    // Host preparation: prerequisites, bridge, reaper, namespace pool
    // ----------------------------------------------------------------
    let vm_config = config.vm_config();
    vm_fleet::check_prerequisites(&PrerequisiteConfig { vm: &vm_config }).await?;

    setup_host_bridge(&config.name).await?;

    reap_and_kill_orphans().await?;

    let pool = NetnsPool::create(NetnsPoolConfig {
        runner_name: config.name.clone(),
        size: config.sandbox.max_concurrent,
        proxy_port: config.proxy_port,
        runtime_dir: RUNTIME_DIR.into(),
    })
    .await?;
    let pool = Arc::new(Mutex::new(pool));

    let http = HttpClient::new(config.server.url.clone())?;
    let api = ApiClient::new(http, config.server.token.clone());

    let status = Arc::new(StatusTracker::new(
        RunnerPaths::new(config.base_dir.clone()).status(),
    ));
    status.write_initial().await;

    let exec_config = Arc::new(ExecutorConfig {
        api_url: config.server.url.clone(),
        agent_scripts_dir: config.agent_scripts_dir.clone(),
        is_snapshot: config.firecracker.snapshot.is_some(),
    });

    let poll_interval = Duration::from_millis(config.sandbox.poll_interval_ms);
    let semaphore = Arc::new(Semaphore::new(config.sandbox.max_concurrent));
    let mut jobs = JoinSet::new();

    info!(
        name = %config.name,
        group = %config.group,
        max_concurrent = config.sandbox.max_concurrent,
        "runner started, polling for jobs"
    );

    // ----------------------------------------------------------------
    // Signal handling
    // ----------------------------------------------------------------
    let (mode_tx, mut mode_rx) = watch::channel(RunnerMode::Running);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigusr1 = signal(SignalKind::user_defined1()).ok();

        loop {
            tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, stopping");
                    let _ = mode_tx.send(RunnerMode::Stopping);
                    return;
                }
                _ = recv_signal(&mut sigusr1) => {
                    info!("received SIGUSR1, draining (no new jobs)");
                    let _ = mode_tx.send(RunnerMode::Draining);
                }
            }
        }
    });

    // ----------------------------------------------------------------
    // Poll loop
    // ----------------------------------------------------------------
    let mut current_mode = RunnerMode::Running;
    loop {
        let mode = *mode_rx.borrow_and_update();
        if mode != current_mode {
            current_mode = mode;
            status.set_mode(mode).await;
        }
        match mode {
            RunnerMode::Stopping | RunnerMode::Stopped => break,
            RunnerMode::Draining => {
                if jobs.is_empty() {
                    info!("all jobs drained");
                    break;
                }
                tokio::select! {
                    _ = mode_rx.changed() => {}
                    result = jobs.join_next() => {
                        if let Some(Err(e)) = result {
                            error!(error = %e, "job task panicked");
                        }
                    }
                }
                continue;
            }
            RunnerMode::Running => {}
        }

        // At the cap: wait for a slot or a mode change before polling.
        if semaphore.available_permits() == 0 {
            tokio::select! {
                _ = mode_rx.changed() => {}
                result = jobs.join_next() => {
                    if let Some(Err(e)) = result {
                        error!(error = %e, "job task panicked");
                    }
                }
            }
            continue;
        }

        let poll_result = tokio::select! {
            result = api.poll(&config.group) => result,
            _ = mode_rx.changed() => continue,
        };

        let run_id = match poll_result {
            Ok(Some(run_id)) => run_id,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = mode_rx.changed() => {}
                }
                continue;
            }
            Err(e) => {
                error!(error = %e, "poll failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = mode_rx.changed() => {}
                }
                continue;
            }
        };

        info!(run_id = %run_id, "job received, claiming");
        let context = match api.claim(run_id).await {
            Ok(context) => context,
            Err(RunnerError::AlreadyClaimed) => {
                info!(run_id = %run_id, "job already claimed, skipping");
                continue;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "claim failed");
                continue;
            }
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            error!("semaphore closed unexpectedly");
            break;
        };

        info!(run_id = %run_id, "job claimed, spawning executor");
        status.add_run(run_id).await;

        let api = api.clone();
        let pool = Arc::clone(&pool);
        let vm_config = vm_config.clone();
        let exec_config = Arc::clone(&exec_config);
        let status = Arc::clone(&status);

        jobs.spawn(async move {
            executor::execute_job(&api, pool.as_ref(), vm_config, context, &exec_config).await;
            status.remove_run(run_id).await;
            drop(permit);
        });
    }

    // ----------------------------------------------------------------
    // Drain and tear down
    // ----------------------------------------------------------------
    let remaining = jobs.len();
    if remaining > 0 {
        info!(remaining, "waiting for in-flight jobs to finish");
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "job task panicked during drain");
            }
        }
    }

    info!("tearing down namespace pool");
    pool.lock().await.cleanup().await?;
    teardown_host_bridge(&config.name).await;

    status.set_mode(RunnerMode::Stopped).await;
    info!("runner stopped");
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
