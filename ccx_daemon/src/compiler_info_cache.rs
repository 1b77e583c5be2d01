#![deny(clippy::unwrap_used)]

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;

use crate::{collaborators::CompilerInfo, path_utils};

// A persisted row whose build_revision doesn't match this is discarded
// rather than deserialized.
const BUILD_REVISION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct CompilerInfoCache {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl CompilerInfoCache {
    pub async fn open(path: &Path) -> Result<Self> {
        path_utils::ensure_directory_for_file(path).await?;
        let migrations = rusqlite_migration::Migrations::new(vec![rusqlite_migration::M::up(
            "
            CREATE TABLE CompilerInfoCache(
                cache_key TEXT NOT NULL PRIMARY KEY,
                build_revision TEXT NOT NULL,
                data TEXT NOT NULL,
                data_debug TEXT NOT NULL,
                disabled INTEGER NOT NULL DEFAULT 0,
                last_probed TEXT NOT NULL
            );
            ",
        )]);
        let mut conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrations.to_latest(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn cache_key(resolved_path: &Path, env_path: Option<&str>) -> String {
        format!("{}\n{}", resolved_path.display(), env_path.unwrap_or(""))
    }

    pub fn get(&self, cache_key: &str) -> Option<CompilerInfo> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT build_revision, data, disabled FROM CompilerInfoCache WHERE cache_key = ?",
            rusqlite::params![cache_key],
            |row| {
                let build_revision: String = row.get(0)?;
                let data: String = row.get(1)?;
                let disabled: bool = row.get(2)?;
                Ok((build_revision, data, disabled))
            },
        )
        .ok()
        .and_then(|(build_revision, data, disabled)| {
            if build_revision != BUILD_REVISION {
                return None;
            }
            let mut info: CompilerInfoRaw = serde_json::from_str(&data).ok()?;
            info.disabled = disabled;
            Some(info.into_compiler_info())
        })
    }

    pub fn put(&self, cache_key: &str, info: &CompilerInfo) -> Result<()> {
        let raw = CompilerInfoRaw::from_compiler_info(info);
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO CompilerInfoCache
                (cache_key, build_revision, data, data_debug, disabled, last_probed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                cache_key,
                BUILD_REVISION,
                serde_json::to_string(&raw)?,
                serde_json::to_string_pretty(&raw)?,
                info.disabled,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_disabled(&self, cache_key: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE CompilerInfoCache SET disabled = 1 WHERE cache_key = ?",
            rusqlite::params![cache_key],
        )?;
        Ok(())
    }

    // Called once at graceful shutdown so the cache is a single tidy file
    // rather than `db` + `db-wal`.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .lock()
            .pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CompilerInfoRaw {
    version: String,
    target: String,
    system_includes: Vec<String>,
    predefined_macros: BTreeMap<String, String>,
    resource_files: Vec<String>,
    #[serde(default)]
    disabled: bool,
}

impl CompilerInfoRaw {
    fn from_compiler_info(info: &CompilerInfo) -> Self {
        Self {
            version: info.version.clone(),
            target: info.target.clone(),
            system_includes: info
                .system_includes
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            predefined_macros: info.predefined_macros.clone(),
            resource_files: info
                .resource_files
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            disabled: info.disabled,
        }
    }

    fn into_compiler_info(self) -> CompilerInfo {
        CompilerInfo {
            version: self.version,
            target: self.target,
            system_includes: self.system_includes.into_iter().map(Into::into).collect(),
            predefined_macros: self.predefined_macros,
            resource_files: self.resource_files.into_iter().map(Into::into).collect(),
            disabled: self.disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_info() -> CompilerInfo {
        CompilerInfo {
            version: "13.2.0".to_string(),
            target: "x86_64-linux-gnu".to_string(),
            system_includes: vec![PathBuf::from("/usr/include")],
            predefined_macros: BTreeMap::from([("__GNUC__".to_string(), "13".to_string())]),
            resource_files: vec![],
            disabled: false,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CompilerInfoCache::open(&dir.path().join("compiler_info.db"))
            .await
            .expect("open cache");
        let key = CompilerInfoCache::cache_key(Path::new("/usr/bin/gcc"), Some("/usr/bin"));
        cache.put(&key, &sample_info()).expect("put");
        let fetched = cache.get(&key).expect("hit");
        assert_eq!(fetched.version, "13.2.0");
        assert!(!fetched.disabled);
    }

    #[tokio::test]
    async fn mark_disabled_propagates_to_subsequent_lookups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CompilerInfoCache::open(&dir.path().join("compiler_info.db"))
            .await
            .expect("open cache");
        let key = CompilerInfoCache::cache_key(Path::new("/usr/bin/gcc"), None);
        cache.put(&key, &sample_info()).expect("put");
        cache.mark_disabled(&key).expect("mark disabled");
        let fetched = cache.get(&key).expect("hit");
        assert!(fetched.disabled);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CompilerInfoCache::open(&dir.path().join("compiler_info.db"))
            .await
            .expect("open cache");
        assert!(cache.get("unknown").is_none());
    }
}
