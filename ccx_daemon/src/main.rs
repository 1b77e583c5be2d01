#![deny(clippy::unwrap_used)]

mod buffer_pool;
mod collaborators;
mod compiler_info_cache;
mod config;
mod engine;
mod errors;
mod export_trace;
mod file_hash_cache;
mod input_upload;
mod ipc;
mod linking_queue;
mod output_commit;
mod path_utils;
mod task;
mod task_periods;
mod task_registry;
mod trace;
mod tui;
mod worker_pool;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use actix_web::web;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ccx_shared::CompilerKind;
use clap::Parser;

use crate::{
    collaborators::{
        CompilerInfo, CompilerInfoProvider, Downloader, ExecResponse, ExecStatus, FlagParser,
        IncludeProcessor, ParsedFlags, RemoteTransport, Uploader,
    },
    compiler_info_cache::CompilerInfoCache,
    config::EngineConfig,
    engine::{Engine, EngineCollaborators},
    ipc::{IdleCounter, PosixSocketTransport},
};

/// Local compiler-proxy daemon: intercepts compiler invocations forwarded by
/// the `ccx_client` wrappers, races them against a remote cluster, and
/// returns artifacts indistinguishable from a local run.
#[derive(Parser, Debug)]
#[command(name = "ccx_daemon", version)]
struct Cli {
    /// Directory for the persisted compiler-info cache and task traces.
    #[arg(long, default_value = "~/.cache/ccx")]
    data_dir: String,

    /// Path to the TOML config file (defaults filled in for anything absent).
    #[arg(long, default_value = "~/.config/ccx/ccx.toml")]
    config: String,

    /// Path of the local socket clients connect to.
    #[arg(long, default_value = ccx_shared::paths::DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Run the terminal task-monitor UI alongside the listener.
    #[arg(long)]
    tui: bool,
}

// Always declines, forcing the conservative fallback-to-local path.
struct UnconfiguredFlagParser;

#[async_trait]
impl FlagParser for UnconfiguredFlagParser {
    fn parse(&self, _binary: CompilerKind, _args: &[std::ffi::OsString]) -> Option<ParsedFlags> {
        None
    }
}

struct NoopIncludeProcessor;

#[async_trait]
impl IncludeProcessor for NoopIncludeProcessor {
    async fn required_files(
        &self,
        _flags: &ParsedFlags,
        _compiler: &CompilerInfo,
    ) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

struct PlaceholderCompilerInfoProvider {
    cache: CompilerInfoCache,
}

#[async_trait]
impl CompilerInfoProvider for PlaceholderCompilerInfoProvider {
    async fn probe(&self, resolved_path: &std::path::Path) -> Result<CompilerInfo> {
        let key =
            CompilerInfoCache::cache_key(resolved_path, std::env::var("PATH").ok().as_deref());
        if let Some(info) = self.cache.get(&key) {
            return Ok(info);
        }
        let info = CompilerInfo {
            version: "unknown".to_string(),
            target: std::env::consts::ARCH.to_string(),
            system_includes: Vec::new(),
            predefined_macros: BTreeMap::new(),
            resource_files: Vec::new(),
            disabled: false,
        };
        self.cache.put(&key, &info)?;
        Ok(info)
    }

    async fn mark_disabled(&self, resolved_path: &std::path::Path) -> Result<()> {
        let key =
            CompilerInfoCache::cache_key(resolved_path, std::env::var("PATH").ok().as_deref());
        self.cache.mark_disabled(&key)
    }
}

// Every exec attempt fails immediately, which combined with
// EngineConfig::fallback degrades to always running the local compiler.
struct UnconfiguredRemoteTransport;

#[async_trait]
impl RemoteTransport for UnconfiguredRemoteTransport {
    async fn exec_async(
        &self,
        _request: ccx_shared::RunRequestData,
    ) -> Result<(ExecStatus, ExecResponse)> {
        anyhow::bail!("no remote transport configured")
    }
}

struct UnconfiguredBlobStore;

#[async_trait]
impl Uploader for UnconfiguredBlobStore {
    async fn compute_key(&self, bytes: &[u8]) -> String {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut hasher = XxHash64::default();
        bytes.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    async fn upload(&self, _hash_key: &str, _bytes: &[u8]) -> Result<u16> {
        anyhow::bail!("no blob store configured")
    }

    async fn embed(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Downloader for UnconfiguredBlobStore {
    async fn download(&self, _hash_key: &str, _path: &std::path::Path, _mode: u32) -> Result<u16> {
        anyhow::bail!("no blob store configured")
    }

    async fn download_in_buffer(&self, _hash_key: &str) -> Result<Vec<u8>> {
        anyhow::bail!("no blob store configured")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let data_dir = ccx_shared::paths::expand_tilde(&cli.data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("creating data dir")?;

    let config = EngineConfig::load(&ccx_shared::paths::expand_tilde(&cli.config)).await?;
    let compiler_info_cache = CompilerInfoCache::open(&data_dir.join("compiler_info.db")).await?;

    let blob_store = Arc::new(UnconfiguredBlobStore);
    let collaborators = EngineCollaborators {
        flag_parser: Arc::new(UnconfiguredFlagParser),
        include_processor: Arc::new(NoopIncludeProcessor),
        compiler_info_provider: Arc::new(PlaceholderCompilerInfoProvider {
            cache: compiler_info_cache.clone(),
        }),
        remote_transport: Arc::new(UnconfiguredRemoteTransport),
        uploader: blob_store.clone(),
        downloader: blob_store,
    };

    let socket_path = ccx_shared::paths::expand_tilde(&cli.socket);
    let transport = PosixSocketTransport {
        path: socket_path.clone(),
    };

    let engine = Engine::new(
        transport.describe(),
        data_dir.clone(),
        config,
        compiler_info_cache,
        collaborators,
    );
    let engine_data = web::Data::new(engine);
    let idle_data = web::Data::new(IdleCounter::default());

    let worker_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    if cli.tui {
        let engine_for_tui = engine_data.clone();
        tokio::spawn(async move {
            if let Err(err) = tui::run_tui(&engine_for_tui).await {
                log::error!("tui exited with error: {err:#}");
            }
        });
    }

    let result = ipc::serve(engine_data, idle_data, &socket_path, worker_threads).await;
    if let Err(err) = &result {
        log::error!("IPC listener stopped: {err:#}");
    }
    result
}
