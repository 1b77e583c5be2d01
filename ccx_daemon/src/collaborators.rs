#![deny(clippy::unwrap_used)]

// Traits for the pieces this engine deliberately does not implement:
// flag parsing, the include closure, CompilerInfo discovery, and the
// remote exec/blob transports. Production wires real collaborators; tests
// wire the `mock` ones below.

use std::{collections::BTreeMap, ffi::OsString, path::PathBuf};

use async_trait::async_trait;
use ccx_shared::CompilerKind;

#[derive(Debug, Clone, Default)]
pub struct ParsedFlags {
    pub input_files: Vec<PathBuf>,
    pub output_files: Vec<PathBuf>,
    pub language: Option<String>,
    pub is_link: bool,
    pub is_preprocess_only: bool,
    pub is_precompile: bool,
    pub has_gch_hack: bool,
    pub reads_stdin: bool,
    pub reproducible_build: bool,
    pub want_in_memory_output: bool,
}

#[async_trait]
pub trait FlagParser: Send + Sync {
    // Returns None if the command line is unsupported (forces fallback).
    fn parse(&self, binary: CompilerKind, args: &[OsString]) -> Option<ParsedFlags>;
}

#[async_trait]
pub trait IncludeProcessor: Send + Sync {
    async fn required_files(
        &self,
        flags: &ParsedFlags,
        compiler: &CompilerInfo,
    ) -> anyhow::Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerInfo {
    pub version: String,
    pub target: String,
    pub system_includes: Vec<PathBuf>,
    pub predefined_macros: BTreeMap<String, String>,
    pub resource_files: Vec<PathBuf>,
    pub disabled: bool,
}

#[async_trait]
pub trait CompilerInfoProvider: Send + Sync {
    async fn probe(&self, resolved_path: &std::path::Path) -> anyhow::Result<CompilerInfo>;
    async fn mark_disabled(&self, resolved_path: &std::path::Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Init,
    Pending,
    SendingRequest,
    RequestSent,
    ReceivingResponse,
    ResponseReceived,
}

#[derive(Debug, Clone)]
pub struct ExecStatus {
    pub http_return_code: u16,
    pub err: Option<String>,
    pub err_message: Option<String>,
    pub finished: bool,
    pub state: ExecState,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResponse {
    pub missing_input: Vec<PathBuf>,
    pub cache_hit: Option<String>,
    pub outputs: Vec<PathBuf>,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn exec_async(
        &self,
        request: ccx_shared::RunRequestData,
    ) -> anyhow::Result<(ExecStatus, ExecResponse)>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn compute_key(&self, bytes: &[u8]) -> String;
    async fn upload(&self, hash_key: &str, bytes: &[u8]) -> anyhow::Result<u16>;
    async fn embed(&self, bytes: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        hash_key: &str,
        path: &std::path::Path,
        mode: u32,
    ) -> anyhow::Result<u16>;
    async fn download_in_buffer(&self, hash_key: &str) -> anyhow::Result<Vec<u8>>;
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub struct MockFlagParser {
        pub result: Option<ParsedFlags>,
    }

    #[async_trait]
    impl FlagParser for MockFlagParser {
        fn parse(&self, _binary: CompilerKind, _args: &[OsString]) -> Option<ParsedFlags> {
            self.result.clone()
        }
    }

    pub struct MockIncludeProcessor {
        pub files: Vec<PathBuf>,
    }

    #[async_trait]
    impl IncludeProcessor for MockIncludeProcessor {
        async fn required_files(
            &self,
            _flags: &ParsedFlags,
            _compiler: &CompilerInfo,
        ) -> anyhow::Result<Vec<PathBuf>> {
            Ok(self.files.clone())
        }
    }

    pub struct MockCompilerInfoProvider {
        pub info: Mutex<CompilerInfo>,
    }

    impl MockCompilerInfoProvider {
        pub fn new(info: CompilerInfo) -> Self {
            Self {
                info: Mutex::new(info),
            }
        }
    }

    #[async_trait]
    impl CompilerInfoProvider for MockCompilerInfoProvider {
        async fn probe(&self, _resolved_path: &std::path::Path) -> anyhow::Result<CompilerInfo> {
            Ok(self.info.lock().clone())
        }

        async fn mark_disabled(&self, _resolved_path: &std::path::Path) -> anyhow::Result<()> {
            self.info.lock().disabled = true;
            Ok(())
        }
    }

    // Replays a fixed queue of responses, one per call.
    pub struct MockRemoteTransport {
        pub responses: Mutex<std::collections::VecDeque<anyhow::Result<(ExecStatus, ExecResponse)>>>,
        pub calls: Mutex<u32>,
    }

    impl MockRemoteTransport {
        pub fn new(responses: Vec<anyhow::Result<(ExecStatus, ExecResponse)>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl RemoteTransport for MockRemoteTransport {
        async fn exec_async(
            &self,
            _request: ccx_shared::RunRequestData,
        ) -> anyhow::Result<(ExecStatus, ExecResponse)> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok((
                    ExecStatus {
                        http_return_code: 200,
                        err: None,
                        err_message: None,
                        finished: true,
                        state: ExecState::ResponseReceived,
                    },
                    ExecResponse::default(),
                )))
        }
    }

    pub struct MockBlobStore {
        pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MockBlobStore {
        pub fn new() -> Self {
            Self {
                blobs: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Default for MockBlobStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Uploader for MockBlobStore {
        async fn compute_key(&self, bytes: &[u8]) -> String {
            use twox_hash::XxHash64;
            use std::hash::{Hash, Hasher};
            let mut hasher = XxHash64::default();
            bytes.hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        }

        async fn upload(&self, hash_key: &str, bytes: &[u8]) -> anyhow::Result<u16> {
            self.blobs
                .lock()
                .insert(hash_key.to_string(), bytes.to_vec());
            Ok(200)
        }

        async fn embed(&self, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }
    }

    #[async_trait]
    impl Downloader for MockBlobStore {
        async fn download(
            &self,
            hash_key: &str,
            path: &std::path::Path,
            _mode: u32,
        ) -> anyhow::Result<u16> {
            let bytes = self
                .blobs
                .lock()
                .get(hash_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown blob {hash_key}"))?;
            tokio::fs::write(path, bytes).await?;
            Ok(200)
        }

        async fn download_in_buffer(&self, hash_key: &str) -> anyhow::Result<Vec<u8>> {
            self.blobs
                .lock()
                .get(hash_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown blob {hash_key}"))
        }
    }
}
