#![deny(clippy::unwrap_used)]

use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;

use crate::{
    buffer_pool::OutputBufferPool,
    collaborators::{CompilerInfoProvider, Downloader, FlagParser, IncludeProcessor, RemoteTransport, Uploader},
    compiler_info_cache::CompilerInfoCache,
    config::EngineConfig,
    file_hash_cache::FileHashCache,
    input_upload::InputUploadCoordinator,
    linking_queue::LinkingQueue,
    task_periods::TaskPeriods,
    task_registry::TaskRegistry,
    worker_pool::WorkerPool,
};

// Passed through construction rather than reached for as a global: the
// daemon owns one Engine, tests construct their own.
pub struct Engine {
    pub address: String,
    pub data_dir: PathBuf,
    pub config: EngineConfig,

    pub file_hash_cache: FileHashCache,
    pub input_uploads: InputUploadCoordinator,
    pub linking_queue: Arc<LinkingQueue>,
    pub output_buffer_pool: OutputBufferPool,
    pub tasks: Arc<TaskRegistry>,
    pub worker_pool: WorkerPool,
    pub compiler_info_cache: CompilerInfoCache,
    pub task_periods: TaskPeriods,

    // Flipped on when a retry's missing set covers more than half the
    // inputs, flipped back off once a retry succeeds clean.
    pub send_old_content: std::sync::atomic::AtomicBool,
    pub local_subprocs_pending: std::sync::atomic::AtomicUsize,
    pub recent_remote_latency_ms: std::sync::atomic::AtomicU64,

    pub tasks_table_state: Arc<Mutex<ratatui::widgets::TableState>>,
    pub auto_scroll: Arc<Mutex<bool>>,

    pub flag_parser: Arc<dyn FlagParser>,
    pub include_processor: Arc<dyn IncludeProcessor>,
    pub compiler_info_provider: Arc<dyn CompilerInfoProvider>,
    pub remote_transport: Arc<dyn RemoteTransport>,
    pub uploader: Arc<dyn Uploader>,
    pub downloader: Arc<dyn Downloader>,
}

pub struct EngineCollaborators {
    pub flag_parser: Arc<dyn FlagParser>,
    pub include_processor: Arc<dyn IncludeProcessor>,
    pub compiler_info_provider: Arc<dyn CompilerInfoProvider>,
    pub remote_transport: Arc<dyn RemoteTransport>,
    pub uploader: Arc<dyn Uploader>,
    pub downloader: Arc<dyn Downloader>,
}

impl Engine {
    pub fn new(
        address: String,
        data_dir: PathBuf,
        config: EngineConfig,
        compiler_info_cache: CompilerInfoCache,
        collaborators: EngineCollaborators,
    ) -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            address,
            data_dir,
            config,
            file_hash_cache: FileHashCache::new(),
            input_uploads: InputUploadCoordinator::new(),
            linking_queue: Arc::new(LinkingQueue::new()),
            output_buffer_pool: OutputBufferPool::new(256 * 1024 * 1024),
            tasks: Arc::new(TaskRegistry::new()),
            worker_pool: WorkerPool::new(worker_threads),
            compiler_info_cache,
            task_periods: TaskPeriods::new(),
            send_old_content: std::sync::atomic::AtomicBool::new(false),
            local_subprocs_pending: std::sync::atomic::AtomicUsize::new(0),
            recent_remote_latency_ms: std::sync::atomic::AtomicU64::new(0),
            tasks_table_state: Arc::new(Mutex::new(ratatui::widgets::TableState::default())),
            auto_scroll: Arc::new(Mutex::new(true)),
            flag_parser: collaborators.flag_parser,
            include_processor: collaborators.include_processor,
            compiler_info_provider: collaborators.compiler_info_provider,
            remote_transport: collaborators.remote_transport,
            uploader: collaborators.uploader,
            downloader: collaborators.downloader,
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use crate::collaborators::mock::{
        MockBlobStore, MockCompilerInfoProvider, MockFlagParser, MockIncludeProcessor,
        MockRemoteTransport,
    };
    use crate::collaborators::CompilerInfo;
    use std::collections::BTreeMap;

    pub async fn test_engine(data_dir: &std::path::Path) -> Engine {
        let compiler_info_cache = CompilerInfoCache::open(&data_dir.join("compiler_info.db"))
            .await
            .expect("open test compiler info cache");
        let blob_store = Arc::new(MockBlobStore::new());
        Engine::new(
            "127.0.0.1:0".to_string(),
            data_dir.to_path_buf(),
            EngineConfig::default(),
            compiler_info_cache,
            EngineCollaborators {
                flag_parser: Arc::new(MockFlagParser { result: None }),
                include_processor: Arc::new(MockIncludeProcessor { files: vec![] }),
                compiler_info_provider: Arc::new(MockCompilerInfoProvider::new(CompilerInfo {
                    version: "0.0.0".to_string(),
                    target: "mock".to_string(),
                    system_includes: vec![],
                    predefined_macros: BTreeMap::new(),
                    resource_files: vec![],
                    disabled: false,
                })),
                remote_transport: Arc::new(MockRemoteTransport::new(vec![])),
                uploader: blob_store.clone(),
                downloader: blob_store,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_engine;

    #[tokio::test]
    async fn test_engine_constructs_with_empty_registries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path()).await;
        assert_eq!(engine.tasks.len(), 0);
        assert_eq!(
            engine
                .send_old_content
                .load(std::sync::atomic::Ordering::SeqCst),
            false
        );
    }
}
