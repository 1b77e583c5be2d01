#![deny(clippy::unwrap_used)]

use std::{
    ffi::OsStr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ccx_shared::{RunRequestData, RunResponseData};
use chrono::Utc;

use crate::{
    engine::Engine,
    errors::EngineError,
    file_hash_cache::FileStat,
    input_upload::UploadPolicy,
    output_commit::{commit_output, CommitRequest},
    path_utils::shorten_path,
    task_periods::TaskPeriodInfo,
    task_registry::TaskId,
    trace::{self, LogEventInfo, TraceId},
    worker_pool::{Priority, ThreadId},
};

// Shared with the `local_run_preference` config string and the
// state-monotonicity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Setup,
    FileReq,
    CallExec,
    LocalOutput,
    FileResp,
    Finished,
    LocalRun,
    LocalFinished,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Init => "INIT",
            TaskState::Setup => "SETUP",
            TaskState::FileReq => "FILE_REQ",
            TaskState::CallExec => "CALL_EXEC",
            TaskState::LocalOutput => "LOCAL_OUTPUT",
            TaskState::FileResp => "FILE_RESP",
            TaskState::Finished => "FINISHED",
            TaskState::LocalRun => "LOCAL_RUN",
            TaskState::LocalFinished => "LOCAL_FINISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weight {
    Light,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalScheduling {
    None,
    Immediate,
    Delayed,
}

const DELAYED_LOCAL_LANE: ThreadId = ThreadId(u64::MAX);

struct TaskPeriodLabel {
    short_name: String,
}

impl TaskPeriodInfo for TaskPeriodLabel {
    fn category(&self) -> String {
        "compile".to_string()
    }

    fn short_name(&self) -> String {
        self.short_name.clone()
    }

    fn log(&self) {
        log::debug!("starting task {}", self.short_name);
    }
}

// Owns nothing the engine doesn't also own; all shared resources are
// reached through `engine`.
pub struct CompileTask {
    id: TaskId,
    trace_id: TraceId,
    engine: Arc<Engine>,
    request: RunRequestData,
    canceled: Arc<AtomicBool>,
    state: TaskState,
    // Set once a local run has finished and won the race: pending remote
    // work is allowed to drain but its outputs are discarded.
    abort: bool,
}

// Returns `None` exactly when the client disconnected before a reply could
// be sent; the caller must not write anything to the connection in that case.
pub async fn run(
    engine: Arc<Engine>,
    request: RunRequestData,
    canceled: Arc<AtomicBool>,
) -> Option<RunResponseData> {
    let trace_id = TraceId::new();
    trace::log(
        LogEventInfo::TaskStart {
            request: request.clone(),
        },
        trace_id,
    );
    let short_name = request
        .args
        .iter()
        .rev()
        .find(|a| !a.to_string_lossy().starts_with('-'))
        .map(|a| shorten_path(std::path::Path::new(a)))
        .unwrap_or_else(|| request.binary.to_standard_binary_name().to_string_lossy().to_string());
    let handle = engine.tasks.create(trace_id, short_name.clone());
    let period = engine.task_periods.start(TaskPeriodLabel { short_name });

    let mut task = CompileTask {
        id: handle.id(),
        trace_id,
        engine,
        request,
        canceled,
        state: TaskState::Init,
        abort: false,
    };
    let result = task.drive().await;
    if result.is_some() {
        period.finished_successfully();
    }
    drop(handle);
    trace::log(
        LogEventInfo::TaskEnd {
            success: result.is_some(),
        },
        trace_id,
    );
    result
}

impl CompileTask {
    fn set_state(&mut self, state: TaskState) {
        self.engine.tasks.set_state(self.id, state.name());
        trace::log(
            LogEventInfo::StateTransition {
                from: self.state.name().to_string(),
                to: state.name().to_string(),
            },
            self.trace_id,
        );
        self.state = state;
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    async fn drive(&mut self) -> Option<RunResponseData> {
        if self.is_canceled() {
            return None;
        }
        let Some(parsed) = self.engine.flag_parser.parse(self.request.binary, &self.request.args) else {
            return self.fallback_only(EngineError::ParseError("unsupported command line".into())).await;
        };

        let resolved_path = match resolve_compiler_path(self.request.binary, self.request.env_path.as_deref())
        {
            Ok(path) => path,
            Err(err) => {
                log::warn!("[{}] {err}", self.trace_id);
                return Some(RunResponseData {
                    stdout: vec![],
                    stderr: b"Invalid command\n".to_vec(),
                    status: -1,
                });
            }
        };

        let verify_output = self.engine.config.verify_output;
        let should_fallback = parsed.reads_stdin
            || parsed.is_preprocess_only
            || (parsed.is_precompile && !parsed.has_gch_hack);
        let weight = if parsed.is_link { Weight::Heavy } else { Weight::Light };

        let (local_scheduling, proceed_to_setup) = if verify_output {
            (LocalScheduling::Immediate, true)
        } else if should_fallback {
            (LocalScheduling::None, false)
        } else if !self.engine.config.roll_ramp_up() {
            (LocalScheduling::None, false)
        } else if parsed.is_precompile && parsed.has_gch_hack {
            (LocalScheduling::Immediate, true)
        } else if !self.engine.config.use_local {
            (LocalScheduling::None, true)
        } else if weight == Weight::Heavy {
            (LocalScheduling::None, true)
        } else if self.engine.local_subprocs_pending.load(Ordering::SeqCst)
            < self.engine.config.max_subprocs_pending
        {
            (LocalScheduling::Immediate, true)
        } else {
            (LocalScheduling::Delayed, true)
        };

        if !proceed_to_setup {
            return self.fallback_only(EngineError::ParseError("should_fallback".into())).await;
        }

        let mut local_handle = match local_scheduling {
            LocalScheduling::Immediate => Some(self.spawn_local(resolved_path.clone())),
            LocalScheduling::Delayed => Some(self.spawn_local_delayed(resolved_path.clone())),
            LocalScheduling::None => None,
        };

        self.set_state(TaskState::Setup);
        let compiler_info = match self.engine.compiler_info_provider.probe(&resolved_path).await {
            Ok(info) => info,
            Err(_) => {
                return self.finish_with_local_or_error(local_handle.take(), EngineError::LocalEnvironmentError(
                    "compiler info probe failed".into(),
                )).await;
            }
        };
        if compiler_info.disabled {
            return self.finish_with_local_or_error(local_handle.take(), EngineError::CommandSpecMismatch(
                "compiler marked disabled".into(),
            )).await;
        }

        let mut required_files = match self
            .engine
            .include_processor
            .required_files(&parsed, &compiler_info)
            .await
        {
            Ok(files) => files,
            Err(_) => {
                return self
                    .finish_with_local_or_error(
                        local_handle.take(),
                        EngineError::LocalEnvironmentError("include processing failed".into()),
                    )
                    .await;
            }
        };
        required_files.extend(parsed.input_files.iter().cloned());
        required_files.sort();
        required_files.dedup();

        if self.is_canceled() {
            self.abort_local(local_handle);
            return None;
        }

        // FILE_REQ, with up to `max_exec_retry` retries on transient failure.
        let mut force_embed: Vec<PathBuf> = vec![];
        let mut exec_request_retry = 0u32;
        let mut hash_keys;
        loop {
            self.set_state(TaskState::FileReq);
            let _link_turn = if parsed.is_link {
                Some(self.engine.linking_queue.wait_for_turn(self.id).await)
            } else {
                None
            };

            match self.request_files(&required_files, &force_embed).await {
                Ok(keys) => {
                    hash_keys = keys;
                    break;
                }
                Err(err) if err.is_retryable() && exec_request_retry < self.engine.config.max_exec_retry => {
                    exec_request_retry += 1;
                    trace::log(
                        LogEventInfo::Retry {
                            phase: "FILE_REQ".to_string(),
                            attempt: exec_request_retry,
                        },
                        self.trace_id,
                    );
                    continue;
                }
                Err(err) => {
                    return self.finish_with_local_or_error(local_handle.take(), err).await;
                }
            }
        }

        if self.is_canceled() {
            self.abort_local(local_handle);
            return None;
        }

        // At most `max_exec_retry` attempts.
        self.set_state(TaskState::CallExec);
        if self.engine.config.use_local && weight == Weight::Heavy && local_handle.is_none() {
            local_handle = Some(self.spawn_local(resolved_path.clone()));
        }

        let mut attempt = 0u32;
        let exec_response = loop {
            attempt += 1;
            let call_start = std::time::Instant::now();
            let response = self
                .engine
                .remote_transport
                .exec_async(self.request.clone())
                .await;
            self.engine
                .recent_remote_latency_ms
                .store(call_start.elapsed().as_millis() as u64, Ordering::Relaxed);
            let (status, exec_response) = match response {
                Ok(pair) => pair,
                Err(_) if attempt < self.engine.config.max_exec_retry => continue,
                Err(_) => {
                    return self
                        .finish_with_local_or_error(
                            local_handle.take(),
                            EngineError::RemoteExecError {
                                http_status: 0,
                                message: "transport error".into(),
                                retryable: false,
                            },
                        )
                        .await;
                }
            };

            if !exec_response.missing_input.is_empty() {
                let fraction_missing =
                    exec_response.missing_input.len() as f64 / required_files.len().max(1) as f64;
                if fraction_missing > 0.5 {
                    self.engine.send_old_content.store(true, Ordering::SeqCst);
                }
                if attempt >= self.engine.config.max_exec_retry {
                    return self
                        .finish_with_local_or_error(
                            local_handle.take(),
                            EngineError::MissingInputs(exec_response.missing_input.len()),
                        )
                        .await;
                }
                force_embed.extend(exec_response.missing_input.iter().cloned());
                trace::log(
                    LogEventInfo::Retry {
                        phase: "FILE_RESP_RETRY".to_string(),
                        attempt,
                    },
                    self.trace_id,
                );
                self.set_state(TaskState::FileReq);
                match self.request_files(&required_files, &force_embed).await {
                    Ok(keys) => hash_keys = keys,
                    Err(err) => {
                        return self.finish_with_local_or_error(local_handle.take(), err).await;
                    }
                }
                self.set_state(TaskState::CallExec);
                continue;
            }

            if status.http_return_code >= 500 || !status.finished {
                if attempt < self.engine.config.max_exec_retry {
                    continue;
                }
                return self
                    .finish_with_local_or_error(
                        local_handle.take(),
                        EngineError::RemoteExecError {
                            http_status: status.http_return_code,
                            message: status.err_message.unwrap_or_default(),
                            retryable: true,
                        },
                    )
                    .await;
            }
            if (300..500).contains(&status.http_return_code) {
                return self
                    .finish_with_local_or_error(
                        local_handle.take(),
                        EngineError::RemoteExecError {
                            http_status: status.http_return_code,
                            message: status.err_message.unwrap_or_default(),
                            retryable: false,
                        },
                    )
                    .await;
            }

            if exec_response.missing_input.is_empty() && force_embed.is_empty() {
                self.engine.send_old_content.store(false, Ordering::SeqCst);
            }
            break exec_response;
        };

        if self.is_canceled() {
            self.abort_local(local_handle);
            return None;
        }

        // FILE_RESP / COMMIT.
        self.set_state(TaskState::FileResp);
        let local_result = self.join_local(local_handle).await;
        if let Some(Ok(_)) = &local_result {
            // A local run that finishes before remote preempts the remote
            // path once its preference threshold has been reached.
            if state_rank(&self.engine.config.local_run_preference) <= state_rank(TaskState::CallExec.name()) {
                self.abort = true;
            }
        }

        if !self.abort {
            for output_path in &parsed.output_files {
                let hash_key = hash_keys
                    .iter()
                    .find(|(p, _)| p == output_path)
                    .map(|(_, k)| k.clone())
                    .unwrap_or_default();
                let local_bytes = tokio::fs::read(output_path).await.ok();
                let request = CommitRequest {
                    hash_key: if hash_key.is_empty() {
                        self.engine.uploader.compute_key(b"").await
                    } else {
                        hash_key
                    },
                    final_path: output_path.clone(),
                    mode: 0o644,
                    size_hint: 0,
                    want_in_memory_output: parsed.want_in_memory_output,
                    local_subprocess_racing: local_result.is_some(),
                    verify_output,
                    local_run_bytes: local_bytes.as_deref(),
                    from_remote_cache: exec_response.cache_hit.is_some(),
                    is_coff_producing: self.request.binary.is_coff_producing()
                        && output_path.extension().is_some_and(|e| e == "obj"),
                    reproducible_build: parsed.reproducible_build,
                };
                if let Err(err) = commit_output(
                    self.engine.downloader.as_ref(),
                    &self.engine.output_buffer_pool,
                    &self.engine.file_hash_cache,
                    self.id,
                    request,
                )
                .await
                {
                    log::warn!("[{}] commit failed: {err}", self.trace_id);
                }
            }
        }

        self.set_state(TaskState::Finished);

        if self.abort {
            if let Some(Ok(local_response)) = local_result {
                return Some(local_response);
            }
        }
        if let Some(Err(local_err)) = &local_result {
            if exec_response.exit_code != 0 {
                use bstr::ByteSlice;
                log::warn!(
                    "[{}] both local ({local_err}) and remote (status {}, stderr: {}) failed; surfacing remote's own diagnostics only",
                    self.trace_id,
                    exec_response.exit_code,
                    exec_response.stderr.as_bstr(),
                );
            }
        }
        Some(RunResponseData {
            stdout: exec_response.stdout,
            stderr: exec_response.stderr,
            status: exec_response.exit_code,
        })
    }

    async fn request_files(
        &self,
        files: &[PathBuf],
        force_embed: &[PathBuf],
    ) -> Result<Vec<(PathBuf, String)>, EngineError> {
        let mut keys = vec![];
        for path in files {
            let stat = match FileStat::read(path).await {
                Ok(stat) => stat,
                Err(source) => {
                    return Err(EngineError::InputUploadError {
                        path: path.clone(),
                        source: source.into(),
                    });
                }
            };
            if let Some(key) = self.engine.file_hash_cache.lookup(
                path,
                stat,
                self.engine.config.new_file_threshold,
                Utc::now(),
            ) {
                if !force_embed.contains(path) {
                    keys.push((path.clone(), key));
                    continue;
                }
            }
            let policy = UploadPolicy {
                is_missing_on_server: force_embed.contains(path),
                caller_only_needs_hash: false,
                need_to_send_content: self.engine.send_old_content.load(Ordering::SeqCst),
            };
            let result = self
                .engine
                .input_uploads
                .request(
                    &self.engine.file_hash_cache,
                    self.engine.uploader.as_ref(),
                    path,
                    stat,
                    policy,
                    self.engine.config.new_file_threshold,
                    Utc::now(),
                )
                .await
                .map_err(|source| EngineError::InputUploadError {
                    path: path.clone(),
                    source,
                })?;
            if !result.success {
                return Err(EngineError::InputUploadError {
                    path: path.clone(),
                    source: anyhow::anyhow!("upload failed"),
                });
            }
            if let Some(key) = &result.hash_key {
                keys.push((path.clone(), key.clone()));
            }
        }
        Ok(keys)
    }

    fn spawn_local(&self, resolved_path: PathBuf) -> tokio::task::JoinHandle<anyhow::Result<RunResponseData>> {
        self.engine.local_subprocs_pending.fetch_add(1, Ordering::SeqCst);
        let request = self.request.clone();
        let counter_engine = self.engine.clone();
        self.engine.worker_pool.run_closure(
            move || async move {
                let result = run_local_subprocess(&resolved_path, &request).await;
                counter_engine
                    .local_subprocs_pending
                    .fetch_sub(1, Ordering::SeqCst);
                result
            },
            Priority::Medium,
        )
    }

    // Too many local subprocesses are already pending, so wait roughly as
    // long as a remote attempt has recently taken before racing one.
    fn spawn_local_delayed(&self, resolved_path: PathBuf) -> tokio::task::JoinHandle<anyhow::Result<RunResponseData>> {
        self.engine.local_subprocs_pending.fetch_add(1, Ordering::SeqCst);
        let request = self.request.clone();
        let counter_engine = self.engine.clone();
        let delay = Duration::from_millis(self.engine.recent_remote_latency_ms.load(Ordering::Relaxed));
        self.engine.worker_pool.run_delayed_closure_in_thread(
            DELAYED_LOCAL_LANE,
            delay,
            move || async move {
                let result = run_local_subprocess(&resolved_path, &request).await;
                counter_engine
                    .local_subprocs_pending
                    .fetch_sub(1, Ordering::SeqCst);
                result
            },
        )
    }

    async fn join_local(
        &self,
        handle: Option<tokio::task::JoinHandle<anyhow::Result<RunResponseData>>>,
    ) -> Option<Result<RunResponseData, anyhow::Error>> {
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => Some(result),
                Err(join_err) => Some(Err(join_err.into())),
            },
            None => None,
        }
    }

    fn abort_local(&self, handle: Option<tokio::task::JoinHandle<anyhow::Result<RunResponseData>>>) {
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn fallback_only(&mut self, reason: EngineError) -> Option<RunResponseData> {
        log::info!("[{}] falling back to local: {reason}", self.trace_id);
        self.set_state(TaskState::LocalRun);
        let resolved_path = match resolve_compiler_path(self.request.binary, self.request.env_path.as_deref()) {
            Ok(path) => path,
            Err(_) => {
                return Some(RunResponseData {
                    stdout: vec![],
                    stderr: b"Invalid command\n".to_vec(),
                    status: -1,
                });
            }
        };
        if self.is_canceled() {
            return None;
        }
        let result = run_local_subprocess(&resolved_path, &self.request).await;
        self.set_state(TaskState::LocalFinished);
        match result {
            Ok(response) => Some(response),
            Err(err) => Some(RunResponseData {
                stdout: vec![],
                stderr: format!("{err}\n").into_bytes(),
                status: -1,
            }),
        }
    }

    async fn finish_with_local_or_error(
        &mut self,
        local_handle: Option<tokio::task::JoinHandle<anyhow::Result<RunResponseData>>>,
        error: EngineError,
    ) -> Option<RunResponseData> {
        log::warn!("[{}] {error}", self.trace_id);
        if let Some(handle) = local_handle {
            if let Ok(Ok(response)) = handle.await {
                self.set_state(TaskState::LocalFinished);
                return Some(response);
            }
        }
        if !self.engine.config.fallback {
            return Some(RunResponseData {
                stdout: vec![],
                stderr: format!("{error}\n").into_bytes(),
                status: -1,
            });
        }
        self.fallback_only(error).await
    }
}

// Unknown names rank with CALL_EXEC.
fn state_rank(name: &str) -> u8 {
    match name {
        "INIT" => 0,
        "SETUP" => 1,
        "FILE_REQ" => 2,
        "CALL_EXEC" => 3,
        "FILE_RESP" => 4,
        "FINISHED" => 5,
        _ => 3,
    }
}

fn resolve_compiler_path(
    binary: ccx_shared::CompilerKind,
    env_path: Option<&OsStr>,
) -> Result<PathBuf, EngineError> {
    let name = binary.to_standard_binary_name();
    let path_var = env_path.ok_or_else(|| {
        EngineError::LocalEnvironmentError("no PATH in requester environment".into())
    })?;
    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(EngineError::LocalEnvironmentError(format!(
        "could not resolve {} on PATH",
        name.to_string_lossy()
    )))
}

async fn run_local_subprocess(
    resolved_path: &std::path::Path,
    request: &RunRequestData,
) -> anyhow::Result<RunResponseData> {
    let mut command = tokio::process::Command::new(resolved_path);
    command.args(&request.args);
    command.current_dir(&request.cwd);
    if let Some(path_var) = &request.env_path {
        command.env("PATH", path_var);
    }
    let output = command.output().await?;
    Ok(RunResponseData {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{mock::*, CompilerInfo, ExecResponse, ExecState, ExecStatus, ParsedFlags};
    use crate::engine::{Engine, EngineCollaborators};
    use ccx_shared::CompilerKind;
    use std::collections::BTreeMap;

    async fn engine_with(
        flags: ParsedFlags,
        responses: Vec<anyhow::Result<(ExecStatus, ExecResponse)>>,
        data_dir: &std::path::Path,
    ) -> Arc<Engine> {
        let compiler_info_cache = crate::compiler_info_cache::CompilerInfoCache::open(
            &data_dir.join("compiler_info.db"),
        )
        .await
        .expect("open cache");
        let blob_store = Arc::new(MockBlobStore::new());
        Arc::new(Engine::new(
            "127.0.0.1:0".to_string(),
            data_dir.to_path_buf(),
            crate::config::EngineConfig::default(),
            compiler_info_cache,
            EngineCollaborators {
                flag_parser: Arc::new(MockFlagParser {
                    result: Some(flags),
                }),
                include_processor: Arc::new(MockIncludeProcessor { files: vec![] }),
                compiler_info_provider: Arc::new(MockCompilerInfoProvider::new(CompilerInfo {
                    version: "0.0.0".into(),
                    target: "mock".into(),
                    system_includes: vec![],
                    predefined_macros: BTreeMap::new(),
                    resource_files: vec![],
                    disabled: false,
                })),
                remote_transport: Arc::new(MockRemoteTransport::new(responses)),
                uploader: blob_store.clone(),
                downloader: blob_store,
            },
        ))
    }

    fn ok_status() -> ExecStatus {
        ExecStatus {
            http_return_code: 200,
            err: None,
            err_message: None,
            finished: true,
            state: ExecState::ResponseReceived,
        }
    }

    #[tokio::test]
    async fn unparseable_command_falls_back_to_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let compiler_info_cache = crate::compiler_info_cache::CompilerInfoCache::open(
            &dir.path().join("compiler_info.db"),
        )
        .await
        .expect("open cache");
        let engine = Arc::new(Engine::new(
            "127.0.0.1:0".to_string(),
            dir.path().to_path_buf(),
            crate::config::EngineConfig::default(),
            compiler_info_cache,
            EngineCollaborators {
                flag_parser: Arc::new(MockFlagParser { result: None }),
                include_processor: Arc::new(MockIncludeProcessor { files: vec![] }),
                compiler_info_provider: Arc::new(MockCompilerInfoProvider::new(CompilerInfo {
                    version: "0.0.0".into(),
                    target: "mock".into(),
                    system_includes: vec![],
                    predefined_macros: BTreeMap::new(),
                    resource_files: vec![],
                    disabled: false,
                })),
                remote_transport: Arc::new(MockRemoteTransport::new(vec![])),
                uploader: Arc::new(MockBlobStore::new()),
                downloader: Arc::new(MockBlobStore::new()),
            },
        ));

        let request = RunRequestData {
            binary: CompilerKind::Gcc,
            args: vec!["--version".into()],
            cwd: dir.path().to_path_buf(),
            env_path: std::env::var_os("PATH"),
        };
        let canceled = Arc::new(AtomicBool::new(false));
        // `MockFlagParser` reports the command line unparseable; `drive()`
        // must still produce a reply by falling back to a local run (or, in
        // a sandbox with no `gcc` on `PATH`, a LocalEnvironmentError reply).
        let result = run(engine, request, canceled).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn client_disconnect_before_reply_yields_no_response() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut flags = ParsedFlags::default();
        flags.input_files = vec![];
        flags.output_files = vec![];
        let engine = engine_with(flags, vec![Ok((ok_status(), ExecResponse::default()))], dir.path()).await;
        let request = RunRequestData {
            binary: CompilerKind::Gcc,
            args: vec![],
            cwd: dir.path().to_path_buf(),
            env_path: None,
        };
        let canceled = Arc::new(AtomicBool::new(true));
        let result = run(engine, request, canceled).await;
        assert!(result.is_none());
    }

    #[test]
    fn state_names_match_spec_vocabulary() {
        assert_eq!(TaskState::FileReq.name(), "FILE_REQ");
        assert_eq!(TaskState::CallExec.name(), "CALL_EXEC");
        assert_eq!(TaskState::LocalFinished.name(), "LOCAL_FINISHED");
    }
}
