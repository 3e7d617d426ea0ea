//! Per-job orchestration: namespace acquire, VM boot, guest staging,
//! agent launch, teardown.
//!
//! Every exit path tears down in the same order — kill the VM, then
//! return the namespace to the pool. Cleanup failures propagate but never
//! mask the primary job error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use guest_client::GuestClient;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use vm_fleet::network::{NetnsPool, PooledNetns};
use vm_fleet::{FirecrackerVm, VmConfig, VmId};

use crate::api::ApiClient;
use crate::error::{RunnerError, RunnerResult};
use crate::paths::guest;
use crate::scripts::upload_agent_scripts;
use crate::types::{ExecutionContext, ResumeSession, StorageManifest};

/// Hard ceiling on agent wall-clock time.
const AGENT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Sentinel-file poll cadence.
const SENTINEL_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Boot deadline for a cold boot (kernel + init + agent dial-in).
const COLD_BOOT_TIMEOUT: Duration = Duration::from_secs(120);
/// Boot deadline for a snapshot restore.
const SNAPSHOT_BOOT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for individual staging commands.
const EXEC_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for the in-guest storage download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
/// Log tail length fetched for diagnostics.
const LOG_TAIL_LINES: u32 = 50;

/// systemd-resolved clobbers resolv.conf at boot; these are written back.
const RESOLV_CONF: &str = "nameserver 8.8.8.8\nnameserver 8.8.4.4\nnameserver 1.1.1.1\n";

/// Runner-level settings shared by all executions.
pub struct ExecutorConfig {
    pub api_url: String,
    pub agent_scripts_dir: Option<PathBuf>,
    pub is_snapshot: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct JobResult {
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Execute one job end to end and report completion to the control plane.
pub async fn execute_job(
    api: &ApiClient,
    pool: &Mutex<NetnsPool>,
    vm_config: VmConfig,
    context: ExecutionContext,
    config: &ExecutorConfig,
) {
    let run_id = context.run_id;

    let result = match execute_inner(pool, vm_config, &context, config).await {
        Ok(result) => result,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "job execution failed");
            JobResult {
                exit_code: 1,
                error: Some(e.to_string()),
            }
        }
    };

    info!(run_id = %run_id, exit_code = result.exit_code, "job finished, reporting completion");

    let error = result.error.as_deref();
    if let Err(e) = api
        .complete(&context.sandbox_token, run_id, result.exit_code, error)
        .await
    {
        warn!(run_id = %run_id, error = %e, "completion report failed, retrying");
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Err(e) = api
            .complete(&context.sandbox_token, run_id, result.exit_code, error)
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to report completion after retry");
        }
    }
}

async fn execute_inner(
    pool: &Mutex<NetnsPool>,
    vm_config: VmConfig,
    context: &ExecutionContext,
    config: &ExecutorConfig,
) -> RunnerResult<JobResult> {
    let vm_id = VmId::from_run_id(&context.run_id);
    info!(run_id = %context.run_id, vm_id = %vm_id, "starting job");

    let netns = pool.lock().await.acquire().await?;

    let mut vm = match FirecrackerVm::create(vm_id, vm_config, &netns.name).await {
        Ok(vm) => vm,
        Err(e) => {
            release_netns(pool, netns).await?;
            return Err(e.into());
        }
    };

    let result = run_job_in_vm(&mut vm, context, config).await;

    // Teardown in fixed order: VM first, namespace second. Failures here
    // surface, but the job's own error wins.
    let cleanup: RunnerResult<()> = async {
        vm.kill().await?;
        release_netns(pool, netns).await
    }
    .await;

    match (result, cleanup) {
        (Err(job_err), cleanup_result) => {
            if let Err(e) = cleanup_result {
                error!(run_id = %context.run_id, error = %e, "cleanup failed after job error");
            }
            Err(job_err)
        }
        (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
        (Ok(result), Ok(())) => Ok(result),
    }
}

async fn release_netns(pool: &Mutex<NetnsPool>, netns: PooledNetns) -> RunnerResult<()> {
    pool.lock().await.release(netns).await?;
    Ok(())
}

/// Boot the VM, stage the guest, run the agent to completion.
async fn run_job_in_vm(
    vm: &mut FirecrackerVm,
    context: &ExecutionContext,
    config: &ExecutorConfig,
) -> RunnerResult<JobResult> {
    let boot_timeout = if config.is_snapshot {
        SNAPSHOT_BOOT_TIMEOUT
    } else {
        COLD_BOOT_TIMEOUT
    };

    vm.start(boot_timeout).await?;
    let guest_conn = vm.wait_for_guest().await?;
    let guest_client: &dyn GuestClient = guest_conn.as_ref();

    // A restored guest wakes up with the snapshot's clock; fix it before
    // anything does TLS.
    if config.is_snapshot {
        fix_guest_clock(guest_client).await?;
    }

    configure_dns(guest_client).await?;

    if let Some(dir) = &config.agent_scripts_dir {
        upload_agent_scripts(guest_client, dir).await?;
    }

    if let Some(manifest) = &context.storage_manifest {
        download_storages(guest_client, context, manifest).await?;
    }

    if let Some(session) = &context.resume_session {
        restore_session(guest_client, context, session).await?;
    }

    write_agent_env(guest_client, context, config).await?;

    vm.mark_executing()?;
    launch_agent_and_wait(guest_client, context).await
}

/// Sync the guest clock to host time (snapshot restores only).
async fn fix_guest_clock(guest_client: &dyn GuestClient) -> RunnerResult<()> {
    let timestamp = format!(
        "{:.3}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    );
    guest_client
        .exec_or_throw(&format!("sudo date -s @{timestamp}"))
        .await?;
    Ok(())
}

/// Overwrite resolv.conf with the fixed nameservers.
async fn configure_dns(guest_client: &dyn GuestClient) -> RunnerResult<()> {
    guest_client
        .write_file_with_sudo("/etc/resolv.conf", RESOLV_CONF.as_bytes())
        .await?;
    Ok(())
}

/// Stage the manifest and run the in-guest download script (parallel
/// presigned-URL downloads with streamed tar extraction).
async fn download_storages(
    guest_client: &dyn GuestClient,
    context: &ExecutionContext,
    manifest: &StorageManifest,
) -> RunnerResult<()> {
    let manifest_json = serde_json::to_vec(manifest)
        .map_err(|e| RunnerError::Internal(format!("manifest json: {e}")))?;
    guest_client
        .write_file(guest::STORAGE_MANIFEST, &manifest_json)
        .await?;

    info!(run_id = %context.run_id, storages = manifest.storages.len(), "downloading storages");
    let output = guest_client
        .exec(
            &format!("{} {}", guest::DOWNLOAD_SCRIPT, guest::STORAGE_MANIFEST),
            DOWNLOAD_TIMEOUT,
        )
        .await;
    if output.exit_code != 0 {
        return Err(RunnerError::StorageDownload(output.stderr));
    }
    Ok(())
}

/// Claude-style agents keep per-project session history under a path
/// derived from the working directory.
fn claude_session_path(working_dir: &str, session_id: &str) -> (String, String) {
    let project = working_dir.trim_start_matches('/').replace('/', "-");
    let dir = format!("/home/user/.claude/projects/-{project}");
    let file = format!("{dir}/{session_id}.jsonl");
    (dir, file)
}

/// Restore a previous session into the guest.
///
/// Claude-style providers get the history file written back directly; any
/// other provider defers to its checkpoint script.
async fn restore_session(
    guest_client: &dyn GuestClient,
    context: &ExecutionContext,
    session: &ResumeSession,
) -> RunnerResult<()> {
    let claude_style = context.cli_agent_type.is_empty() || context.cli_agent_type == "claude-code";
    if !claude_style {
        guest_client
            .exec_or_throw(&format!(
                "{} restore {}",
                guest::CHECKPOINT_SCRIPT,
                session.session_id
            ))
            .await?;
        return Ok(());
    }

    let (session_dir, session_path) = claude_session_path(&context.working_dir, &session.session_id);
    guest_client.mkdir(&session_dir).await?;
    guest_client
        .write_file(&session_path, session.session_history.as_bytes())
        .await?;
    info!(run_id = %context.run_id, path = %session_path, "restored session history");
    Ok(())
}

/// Stage the agent environment as a JSON file, sidestepping shell escaping.
async fn write_agent_env(
    guest_client: &dyn GuestClient,
    context: &ExecutionContext,
    config: &ExecutorConfig,
) -> RunnerResult<()> {
    let env = build_agent_env(context, config);
    let json = serde_json::to_vec_pretty(&env)
        .map_err(|e| RunnerError::Internal(format!("env json: {e}")))?;
    guest_client.write_file(guest::ENV_JSON, &json).await?;
    info!(run_id = %context.run_id, count = env.len(), "agent environment staged");
    Ok(())
}

/// Assemble the agent's environment map.
fn build_agent_env(context: &ExecutionContext, config: &ExecutorConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();

    let api_url = context.api_url.clone().unwrap_or_else(|| config.api_url.clone());
    env.insert("VM0_API_URL".into(), api_url);
    env.insert("VM0_RUN_ID".into(), context.run_id.to_string());
    env.insert("VM0_API_TOKEN".into(), context.sandbox_token.clone());
    env.insert("VM0_PROMPT".into(), context.prompt.clone());
    env.insert("VM0_WORKING_DIR".into(), context.working_dir.clone());
    // The API omits the agent type for claude-code (the default).
    env.insert(
        "CLI_AGENT_TYPE".into(),
        if context.cli_agent_type.is_empty() {
            "claude-code".into()
        } else {
            context.cli_agent_type.clone()
        },
    );
    if let Some(user_id) = &context.user_id {
        env.insert("VM0_USER_ID".into(), user_id.clone());
    }

    // Storage-mount metadata for the agent's checkpoint machinery.
    if let Some(manifest) = &context.storage_manifest {
        let mounts: Vec<&str> = manifest
            .storages
            .iter()
            .map(|s| s.mount_path.as_str())
            .collect();
        if let Ok(json) = serde_json::to_string(&mounts) {
            env.insert("VM0_STORAGE_MOUNTS".into(), json);
        }
        if let Some(artifact) = &manifest.artifact {
            env.insert("VM0_ARTIFACT_DRIVER".into(), "vas".into());
            env.insert("VM0_ARTIFACT_MOUNT_PATH".into(), artifact.mount_path.clone());
            env.insert(
                "VM0_ARTIFACT_VOLUME_NAME".into(),
                artifact.vas_storage_name.clone(),
            );
            env.insert(
                "VM0_ARTIFACT_VERSION_ID".into(),
                artifact.vas_version_id.clone(),
            );
        }
    }

    if let Some(session) = &context.resume_session {
        env.insert("VM0_RESUME_SESSION_ID".into(), session.session_id.clone());
    }

    if context.experimental_firewall == Some(true) {
        env.insert("VM0_EXPERIMENTAL_FIREWALL".into(), "1".into());
    }

    if let Some(user_env) = &context.environment {
        for (k, v) in user_env {
            env.insert(k.clone(), v.clone());
        }
    }

    // Secrets travel base64-encoded and comma-joined; the guest side
    // decodes them for redaction.
    if let Some(secrets) = &context.secret_values
        && !secrets.is_empty()
    {
        let encoded: Vec<String> = secrets
            .iter()
            .map(|s| base64::engine::general_purpose::STANDARD.encode(s))
            .collect();
        env.insert("VM0_SECRET_VALUES".into(), encoded.join(","));
    }

    // User vars may override anything above.
    if let Some(vars) = &context.vars {
        for (k, v) in vars {
            env.insert(k.clone(), v.clone());
        }
    }

    env
}

/// Launch the agent in the background through the env loader and poll the
/// sentinel exit-code file until it appears (or the 24 h ceiling passes).
async fn launch_agent_and_wait(
    guest_client: &dyn GuestClient,
    context: &ExecutionContext,
) -> RunnerResult<JobResult> {
    let log_file = guest::log_file(&context.run_id);
    let launch = format!(
        "rm -f {exit}; nohup sh -c '{loader} {env}; echo $? > {exit}' > {log} 2>&1 &",
        exit = guest::EXIT_CODE_FILE,
        loader = guest::ENV_LOADER,
        env = guest::ENV_JSON,
        log = log_file,
    );
    guest_client.exec_or_throw(&launch).await?;
    info!(run_id = %context.run_id, "agent launched");

    let deadline = tokio::time::Instant::now() + AGENT_TIMEOUT;
    loop {
        if guest_client.exists(guest::EXIT_CODE_FILE).await? {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(run_id = %context.run_id, "agent hit the 24h ceiling");
            return Ok(JobResult {
                exit_code: 1,
                error: Some(format!(
                    "agent timed out after {}h",
                    AGENT_TIMEOUT.as_secs() / 3600
                )),
            });
        }
        tokio::time::sleep(SENTINEL_POLL_INTERVAL).await;
    }

    let raw = guest_client.read_file(guest::EXIT_CODE_FILE).await?;
    let exit_code: i32 = raw.trim().parse().unwrap_or(1);
    info!(run_id = %context.run_id, exit_code, "agent exited");

    let error = if exit_code != 0 {
        let tail = guest_client
            .exec(&format!("tail -n {LOG_TAIL_LINES} {log_file}"), EXEC_TIMEOUT)
            .await;
        Some(tail.stdout).filter(|s| !s.is_empty())
    } else {
        None
    };

    Ok(JobResult { exit_code, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use guest_client::ExecOutput;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    fn minimal_context() -> ExecutionContext {
        serde_json::from_value(serde_json::json!({
            "runId": Uuid::nil().to_string(),
            "sandboxToken": "tok",
            "prompt": "test prompt",
            "workingDir": "/workspace",
        }))
        .unwrap()
    }

    fn test_config() -> ExecutorConfig {
        ExecutorConfig {
            api_url: "https://api.example.com".into(),
            agent_scripts_dir: None,
            is_snapshot: false,
        }
    }

    #[test]
    fn agent_env_required_keys() {
        let env = build_agent_env(&minimal_context(), &test_config());
        assert_eq!(env["VM0_API_URL"], "https://api.example.com");
        assert_eq!(env["VM0_RUN_ID"], Uuid::nil().to_string());
        assert_eq!(env["VM0_API_TOKEN"], "tok");
        assert_eq!(env["VM0_PROMPT"], "test prompt");
        assert_eq!(env["VM0_WORKING_DIR"], "/workspace");
        assert_eq!(env["CLI_AGENT_TYPE"], "claude-code");
    }

    #[test]
    fn agent_env_context_api_url_wins() {
        let mut ctx = minimal_context();
        ctx.api_url = Some("https://other.example.com".into());
        let env = build_agent_env(&ctx, &test_config());
        assert_eq!(env["VM0_API_URL"], "https://other.example.com");
    }

    #[test]
    fn agent_env_secrets_are_base64_comma_joined() {
        let mut ctx = minimal_context();
        ctx.secret_values = Some(vec!["alpha".into(), "beta".into()]);
        let env = build_agent_env(&ctx, &test_config());

        let parts: Vec<&str> = env["VM0_SECRET_VALUES"].split(',').collect();
        assert_eq!(parts.len(), 2);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(parts[0])
            .unwrap();
        assert_eq!(decoded, b"alpha");
    }

    #[test]
    fn agent_env_empty_secrets_omitted() {
        let mut ctx = minimal_context();
        ctx.secret_values = Some(vec![]);
        let env = build_agent_env(&ctx, &test_config());
        assert!(!env.contains_key("VM0_SECRET_VALUES"));
    }

    #[test]
    fn agent_env_storage_mounts_and_artifact() {
        let mut ctx = minimal_context();
        ctx.storage_manifest = serde_json::from_value(serde_json::json!({
            "storages": [
                {"mountPath": "/data"},
                {"mountPath": "/cache"},
            ],
            "artifact": {
                "mountPath": "/artifacts",
                "vasStorageName": "vol",
                "vasVersionId": "v7",
            },
        }))
        .ok();

        let env = build_agent_env(&ctx, &test_config());
        assert_eq!(env["VM0_STORAGE_MOUNTS"], r#"["/data","/cache"]"#);
        assert_eq!(env["VM0_ARTIFACT_DRIVER"], "vas");
        assert_eq!(env["VM0_ARTIFACT_MOUNT_PATH"], "/artifacts");
        assert_eq!(env["VM0_ARTIFACT_VOLUME_NAME"], "vol");
        assert_eq!(env["VM0_ARTIFACT_VERSION_ID"], "v7");
    }

    #[test]
    fn agent_env_user_vars_override_everything() {
        let mut ctx = minimal_context();
        ctx.environment = Some(HashMap::from([("FOO".into(), "env".into())]));
        ctx.vars = Some(HashMap::from([
            ("FOO".into(), "var".into()),
            ("VM0_PROMPT".into(), "overridden".into()),
        ]));
        let env = build_agent_env(&ctx, &test_config());
        assert_eq!(env["FOO"], "var");
        assert_eq!(env["VM0_PROMPT"], "overridden");
    }

    #[test]
    fn agent_env_firewall_flag() {
        let mut ctx = minimal_context();
        ctx.experimental_firewall = Some(true);
        let env = build_agent_env(&ctx, &test_config());
        assert_eq!(env["VM0_EXPERIMENTAL_FIREWALL"], "1");

        ctx.experimental_firewall = Some(false);
        let env = build_agent_env(&ctx, &test_config());
        assert!(!env.contains_key("VM0_EXPERIMENTAL_FIREWALL"));
    }

    #[test]
    fn claude_session_path_derivation() {
        let (dir, file) = claude_session_path("/workspace/my/project", "sess-42");
        assert_eq!(dir, "/home/user/.claude/projects/-workspace-my-project");
        assert_eq!(
            file,
            "/home/user/.claude/projects/-workspace-my-project/sess-42.jsonl"
        );
    }

    // -- sentinel polling against a scripted guest --

    /// Guest whose sentinel file appears after a fixed number of polls.
    struct SentinelGuest {
        polls_until_exit: StdMutex<u32>,
        exit_code: i32,
        commands: StdMutex<Vec<String>>,
    }

    impl SentinelGuest {
        fn new(polls_until_exit: u32, exit_code: i32) -> Self {
            Self {
                polls_until_exit: StdMutex::new(polls_until_exit),
                exit_code,
                commands: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GuestClient for SentinelGuest {
        async fn exec(&self, command: &str, _timeout: Duration) -> ExecOutput {
            self.commands.lock().unwrap().push(command.to_string());
            let mut out = ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            };
            if command.starts_with("test -e ") {
                let mut remaining = self.polls_until_exit.lock().unwrap();
                if *remaining == 0 {
                    return out;
                }
                *remaining -= 1;
                out.exit_code = 1;
            } else if command.starts_with("cat ") {
                out.stdout = format!("{}\n", self.exit_code);
            } else if command.starts_with("tail ") {
                out.stdout = "agent log tail".into();
            }
            out
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_poll_returns_agent_exit_code() {
        let guest_client = SentinelGuest::new(3, 0);
        let result = launch_agent_and_wait(&guest_client, &minimal_context())
            .await
            .unwrap();
        assert_eq!(result, JobResult { exit_code: 0, error: None });

        let commands = guest_client.commands.lock().unwrap().clone();
        assert!(commands[0].contains("nohup"));
        assert!(commands[0].contains(guest::ENV_LOADER));
        assert!(commands[0].contains(guest::EXIT_CODE_FILE));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_poll_surfaces_log_tail_on_failure() {
        let guest_client = SentinelGuest::new(1, 3);
        let result = launch_agent_and_wait(&guest_client, &minimal_context())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.error.as_deref(), Some("agent log tail"));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_poll_hits_24h_ceiling() {
        // Sentinel never appears.
        let guest_client = SentinelGuest::new(u32::MAX, 0);
        let result = launch_agent_and_wait(&guest_client, &minimal_context())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.error.unwrap().contains("timed out after 24h"));
    }
}
