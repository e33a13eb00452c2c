//! Provenance store implementations.
//!
//! Tracks every data item with its source, trust level, and derivation
//! parents, plus the file-path → writer mapping that lets file reads
//! inherit the writer's trust. Two backends behind the
//! [`ProvenanceStore`] trait:
//!
//! - [`InMemoryProvenanceStore`]: maps behind `Arc<RwLock>`, used in tests
//!   and when durable storage is unavailable.
//! - [`SqliteProvenanceStore`]: `provenance` + `provenance_parents` +
//!   `file_provenance` tables; the derivation closure walks a recursive
//!   CTE over the join table.
//!
//! The trust gate recomputes trust from the full derivation closure on
//! every call — a cached trust field is never consulted. An id whose
//! record is missing (evicted or never created) is unsafe.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info};

use sentinel_types::errors::SentinelError;
use sentinel_types::models::{new_id, DataSource, ScanResult, TaggedData, TrustLevel};
use sentinel_types::traits::ProvenanceStore;

use crate::db::SentinelDb;

/// Depth bound for closure walks; beyond this a chain is treated as
/// unsafe rather than walked further.
const MAX_CHAIN_DEPTH: usize = 50;

// ============================================================
// InMemoryProvenanceStore
// ============================================================

struct MemoryInner {
    items: HashMap<String, TaggedData>,
    /// Insertion order for capacity eviction.
    order: VecDeque<String>,
    file_writers: HashMap<String, String>,
}

/// In-memory provenance store bounded by a capacity.
#[derive(Clone)]
pub struct InMemoryProvenanceStore {
    inner: Arc<RwLock<MemoryInner>>,
    max_entries: usize,
}

impl InMemoryProvenanceStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner {
                items: HashMap::new(),
                order: VecDeque::new(),
                file_writers: HashMap::new(),
            })),
            max_entries,
        }
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Apply the union rule: any untrusted parent makes the child untrusted.
fn effective_trust(
    requested: TrustLevel,
    parents: &[String],
    lookup: impl Fn(&str) -> Option<TrustLevel>,
) -> TrustLevel {
    if requested == TrustLevel::Untrusted {
        return TrustLevel::Untrusted;
    }
    for parent_id in parents {
        match lookup(parent_id) {
            Some(TrustLevel::Untrusted) | None => return TrustLevel::Untrusted,
            Some(TrustLevel::Trusted) => {}
        }
    }
    requested
}

#[async_trait]
impl ProvenanceStore for InMemoryProvenanceStore {
    async fn create_tagged_data(
        &self,
        content: &str,
        source: DataSource,
        trust_level: TrustLevel,
        originated_from: &str,
        derived_from: &[String],
    ) -> Result<TaggedData, SentinelError> {
        let mut inner = self.inner.write().await;

        let trust = effective_trust(trust_level, derived_from, |id| {
            inner.items.get(id).map(|d| d.trust_level)
        });

        let data = TaggedData {
            id: new_id(),
            content: content.to_string(),
            content_digest: TaggedData::digest(content),
            source,
            trust_level: trust,
            originated_from: originated_from.to_string(),
            scan_results: BTreeMap::new(),
            derived_from: derived_from.to_vec(),
            created_at: Utc::now(),
        };

        inner.order.push_back(data.id.clone());
        inner.items.insert(data.id.clone(), data.clone());

        // Evict oldest past capacity; dangling file mappings go with them.
        while inner.items.len() > self.max_entries {
            if let Some(evicted) = inner.order.pop_front() {
                inner.items.remove(&evicted);
                inner.file_writers.retain(|_, writer| *writer != evicted);
            }
        }

        debug!(
            event = "tagged_data_created",
            data_id = %data.id,
            source = ?source,
            trust_level = ?data.trust_level,
        );
        Ok(data)
    }

    async fn get(&self, data_id: &str) -> Result<Option<TaggedData>, SentinelError> {
        Ok(self.inner.read().await.items.get(data_id).cloned())
    }

    async fn attach_scan_results(
        &self,
        data_id: &str,
        results: &BTreeMap<String, ScanResult>,
    ) -> Result<(), SentinelError> {
        let mut inner = self.inner.write().await;
        match inner.items.get_mut(data_id) {
            Some(item) => {
                item.scan_results = results.clone();
                Ok(())
            }
            None => Err(SentinelError::Provenance(format!(
                "no such data id: {data_id}"
            ))),
        }
    }

    async fn is_trust_safe_for_execution(
        &self,
        data_ids: &[String],
    ) -> Result<bool, SentinelError> {
        let inner = self.inner.read().await;

        // Breadth-first over the merged closure, cycle-protected.
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> =
            data_ids.iter().map(|id| (id.clone(), 0)).collect();

        while let Some((id, depth)) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if depth > MAX_CHAIN_DEPTH {
                return Ok(false);
            }
            let Some(item) = inner.items.get(&id) else {
                // Unknown ancestry cannot be vouched for.
                return Ok(false);
            };
            if item.trust_level == TrustLevel::Untrusted {
                return Ok(false);
            }
            for parent in &item.derived_from {
                if !visited.contains(parent) {
                    queue.push_back((parent.clone(), depth + 1));
                }
            }
        }

        Ok(true)
    }

    async fn record_file_write(&self, path: &str, data_id: &str) -> Result<(), SentinelError> {
        let mut inner = self.inner.write().await;
        inner.file_writers.insert(path.to_string(), data_id.to_string());
        info!(event = "file_provenance_recorded", path, data_id);
        Ok(())
    }

    async fn get_file_writer(&self, path: &str) -> Result<Option<String>, SentinelError> {
        Ok(self.inner.read().await.file_writers.get(path).cloned())
    }
}

// ============================================================
// SqliteProvenanceStore
// ============================================================

/// SQLite-backed provenance store.
pub struct SqliteProvenanceStore {
    db: SentinelDb,
    max_entries: i64,
}

impl SqliteProvenanceStore {
    pub fn new(db: SentinelDb, max_entries: usize) -> Self {
        Self {
            db,
            max_entries: max_entries as i64,
        }
    }

    async fn evict_past_capacity(&self) -> Result<(), SentinelError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provenance")
            .fetch_one(self.db.pool())
            .await
            .map_err(db_err)?;

        if count.0 > self.max_entries {
            let excess = count.0 - self.max_entries;
            sqlx::query(
                "DELETE FROM provenance WHERE data_id IN \
                 (SELECT data_id FROM provenance ORDER BY rowid ASC LIMIT ?)",
            )
            .bind(excess)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
            info!(event = "provenance_evicted", count = excess);
        }
        Ok(())
    }

    fn row_to_tagged(row: &sqlx::sqlite::SqliteRow) -> Result<TaggedData, SentinelError> {
        let source: String = row.try_get("source").map_err(db_err)?;
        let trust: String = row.try_get("trust_level").map_err(db_err)?;
        let scan_json: String = row.try_get("scan_results").map_err(db_err)?;
        Ok(TaggedData {
            id: row.try_get("data_id").map_err(db_err)?,
            content: row.try_get("content").map_err(db_err)?,
            content_digest: row.try_get("content_digest").map_err(db_err)?,
            source: source_from_str(&source)?,
            trust_level: trust_from_str(&trust)?,
            originated_from: row.try_get("originated_from").map_err(db_err)?,
            scan_results: serde_json::from_str(&scan_json).unwrap_or_default(),
            derived_from: Vec::new(),
            created_at: row.try_get("created_at").map_err(db_err)?,
        })
    }

    async fn load_parents(&self, data_id: &str) -> Result<Vec<String>, SentinelError> {
        let rows = sqlx::query(
            "SELECT parent_id FROM provenance_parents WHERE child_id = ? ORDER BY ord",
        )
        .bind(data_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("parent_id").map_err(db_err))
            .collect()
    }
}

fn db_err(e: impl std::fmt::Display) -> SentinelError {
    SentinelError::Database(e.to_string())
}

fn source_to_str(source: DataSource) -> &'static str {
    match source {
        DataSource::User => "user",
        DataSource::Planner => "planner",
        DataSource::Worker => "worker",
        DataSource::File => "file",
        DataSource::Tool => "tool",
        DataSource::Web => "web",
    }
}

fn source_from_str(s: &str) -> Result<DataSource, SentinelError> {
    match s {
        "user" => Ok(DataSource::User),
        "planner" => Ok(DataSource::Planner),
        "worker" => Ok(DataSource::Worker),
        "file" => Ok(DataSource::File),
        "tool" => Ok(DataSource::Tool),
        "web" => Ok(DataSource::Web),
        other => Err(SentinelError::Provenance(format!("unknown source: {other}"))),
    }
}

fn trust_to_str(trust: TrustLevel) -> &'static str {
    match trust {
        TrustLevel::Trusted => "trusted",
        TrustLevel::Untrusted => "untrusted",
    }
}

fn trust_from_str(s: &str) -> Result<TrustLevel, SentinelError> {
    match s {
        "trusted" => Ok(TrustLevel::Trusted),
        "untrusted" => Ok(TrustLevel::Untrusted),
        other => Err(SentinelError::Provenance(format!(
            "unknown trust level: {other}"
        ))),
    }
}

#[async_trait]
impl ProvenanceStore for SqliteProvenanceStore {
    async fn create_tagged_data(
        &self,
        content: &str,
        source: DataSource,
        trust_level: TrustLevel,
        originated_from: &str,
        derived_from: &[String],
    ) -> Result<TaggedData, SentinelError> {
        // Union rule over the direct parents' stored trust (each parent's
        // trust was itself computed transitively at creation).
        let mut trust = trust_level;
        if trust == TrustLevel::Trusted {
            for parent_id in derived_from {
                let row = sqlx::query("SELECT trust_level FROM provenance WHERE data_id = ?")
                    .bind(parent_id)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(db_err)?;
                match row {
                    Some(r) => {
                        let t: String = r.try_get("trust_level").map_err(db_err)?;
                        if trust_from_str(&t)? == TrustLevel::Untrusted {
                            trust = TrustLevel::Untrusted;
                            break;
                        }
                    }
                    None => {
                        trust = TrustLevel::Untrusted;
                        break;
                    }
                }
            }
        }

        let data = TaggedData {
            id: new_id(),
            content: content.to_string(),
            content_digest: TaggedData::digest(content),
            source,
            trust_level: trust,
            originated_from: originated_from.to_string(),
            scan_results: BTreeMap::new(),
            derived_from: derived_from.to_vec(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO provenance \
             (data_id, content, content_digest, source, trust_level, originated_from, scan_results, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, '{}', ?)",
        )
        .bind(&data.id)
        .bind(&data.content)
        .bind(&data.content_digest)
        .bind(source_to_str(source))
        .bind(trust_to_str(trust))
        .bind(&data.originated_from)
        .bind(data.created_at)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        for (ord, parent_id) in derived_from.iter().enumerate() {
            sqlx::query(
                "INSERT INTO provenance_parents (child_id, parent_id, ord) VALUES (?, ?, ?)",
            )
            .bind(&data.id)
            .bind(parent_id)
            .bind(ord as i64)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        }

        self.evict_past_capacity().await?;
        Ok(data)
    }

    async fn get(&self, data_id: &str) -> Result<Option<TaggedData>, SentinelError> {
        let row = sqlx::query(
            "SELECT data_id, content, content_digest, source, trust_level, originated_from, \
             scan_results, created_at FROM provenance WHERE data_id = ?",
        )
        .bind(data_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let mut data = Self::row_to_tagged(&row)?;
                data.derived_from = self.load_parents(data_id).await?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn attach_scan_results(
        &self,
        data_id: &str,
        results: &BTreeMap<String, ScanResult>,
    ) -> Result<(), SentinelError> {
        let json = serde_json::to_string(results).map_err(|e| db_err(e.to_string()))?;
        let updated = sqlx::query("UPDATE provenance SET scan_results = ? WHERE data_id = ?")
            .bind(json)
            .bind(data_id)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(SentinelError::Provenance(format!(
                "no such data id: {data_id}"
            )));
        }
        Ok(())
    }

    async fn is_trust_safe_for_execution(
        &self,
        data_ids: &[String],
    ) -> Result<bool, SentinelError> {
        for data_id in data_ids {
            // Closure over the join table; a NULL trust level marks an
            // ancestor whose record is gone.
            let rows = sqlx::query(
                "WITH RECURSIVE chain(data_id, depth) AS (\
                     SELECT ?, 0 \
                     UNION \
                     SELECT pp.parent_id, chain.depth + 1 \
                     FROM provenance_parents pp \
                     JOIN chain ON pp.child_id = chain.data_id \
                     WHERE chain.depth < ? \
                 ) \
                 SELECT DISTINCT chain.data_id AS cid, p.trust_level AS trust \
                 FROM chain LEFT JOIN provenance p ON p.data_id = chain.data_id",
            )
            .bind(data_id)
            .bind(MAX_CHAIN_DEPTH as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;

            for row in rows {
                let trust: Option<String> = row.try_get("trust").map_err(db_err)?;
                match trust {
                    None => return Ok(false),
                    Some(t) if trust_from_str(&t)? == TrustLevel::Untrusted => return Ok(false),
                    Some(_) => {}
                }
            }
        }
        Ok(true)
    }

    async fn record_file_write(&self, path: &str, data_id: &str) -> Result<(), SentinelError> {
        sqlx::query(
            "INSERT OR REPLACE INTO file_provenance (file_path, writer_data_id, created_at) \
             VALUES (?, ?, ?)",
        )
        .bind(path)
        .bind(data_id)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        info!(event = "file_provenance_recorded", path, data_id);
        Ok(())
    }

    async fn get_file_writer(&self, path: &str) -> Result<Option<String>, SentinelError> {
        let row = sqlx::query("SELECT writer_data_id FROM file_provenance WHERE file_path = ?")
            .bind(path)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get::<String, _>("writer_data_id").map_err(db_err))
            .transpose()
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> InMemoryProvenanceStore {
        InMemoryProvenanceStore::new(100)
    }

    async fn sqlite_store() -> SqliteProvenanceStore {
        SqliteProvenanceStore::new(SentinelDb::in_memory().await.unwrap(), 100)
    }

    async fn trusted(store: &dyn ProvenanceStore, content: &str) -> TaggedData {
        store
            .create_tagged_data(content, DataSource::Tool, TrustLevel::Trusted, "test", &[])
            .await
            .unwrap()
    }

    async fn untrusted(store: &dyn ProvenanceStore, content: &str) -> TaggedData {
        store
            .create_tagged_data(content, DataSource::Worker, TrustLevel::Untrusted, "test", &[])
            .await
            .unwrap()
    }

    // ----------------------------------------------------------
    // Union rule
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_union_rule_untrusted_parent() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let parent = untrusted(store, "tainted").await;
            let child = store
                .create_tagged_data(
                    "derived",
                    DataSource::Tool,
                    TrustLevel::Trusted,
                    "test",
                    &[parent.id.clone()],
                )
                .await
                .unwrap();
            assert_eq!(child.trust_level, TrustLevel::Untrusted);
        }
    }

    #[tokio::test]
    async fn test_union_rule_all_trusted_parents() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let a = trusted(store, "a").await;
            let b = trusted(store, "b").await;
            let child = store
                .create_tagged_data(
                    "derived",
                    DataSource::Tool,
                    TrustLevel::Trusted,
                    "test",
                    &[a.id.clone(), b.id.clone()],
                )
                .await
                .unwrap();
            assert_eq!(child.trust_level, TrustLevel::Trusted);
        }
    }

    #[tokio::test]
    async fn test_unknown_parent_is_untrusted() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let child = store
                .create_tagged_data(
                    "derived",
                    DataSource::Tool,
                    TrustLevel::Trusted,
                    "test",
                    &["no-such-id".to_string()],
                )
                .await
                .unwrap();
            assert_eq!(child.trust_level, TrustLevel::Untrusted);
        }
    }

    // ----------------------------------------------------------
    // Trust gate
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_trust_gate_deep_chain() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let root = untrusted(store, "worker output").await;
            let mid = store
                .create_tagged_data(
                    "file contents",
                    DataSource::File,
                    TrustLevel::Trusted,
                    "file_read",
                    &[root.id.clone()],
                )
                .await
                .unwrap();
            let leaf = store
                .create_tagged_data(
                    "final",
                    DataSource::Tool,
                    TrustLevel::Trusted,
                    "tool",
                    &[mid.id.clone()],
                )
                .await
                .unwrap();
            // The untrusted root three hops back taints the leaf.
            assert!(!store
                .is_trust_safe_for_execution(&[leaf.id.clone()])
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_trust_gate_all_trusted() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let a = trusted(store, "a").await;
            let b = store
                .create_tagged_data(
                    "b",
                    DataSource::Tool,
                    TrustLevel::Trusted,
                    "tool",
                    &[a.id.clone()],
                )
                .await
                .unwrap();
            assert!(store
                .is_trust_safe_for_execution(&[a.id.clone(), b.id.clone()])
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_trust_gate_unknown_id_unsafe() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            assert!(!store
                .is_trust_safe_for_execution(&["missing-id".to_string()])
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_trust_gate_empty_set_safe() {
        let store = memory_store().await;
        assert!(store.is_trust_safe_for_execution(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_trust_gate_cycle_protected() {
        // Cycles cannot be created through the public API (records are
        // immutable and parents must precede children), but the walk must
        // still terminate on a self-referential chain seeded directly.
        let store = memory_store().await;
        let a = trusted(&store, "a").await;
        {
            let mut inner = store.inner.write().await;
            let item = inner.items.get_mut(&a.id).unwrap();
            item.derived_from = vec![a.id.clone()];
        }
        assert!(store
            .is_trust_safe_for_execution(&[a.id.clone()])
            .await
            .unwrap());
    }

    // ----------------------------------------------------------
    // File provenance
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_file_write_and_lookup() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let writer = untrusted(store, "script body").await;
            store
                .record_file_write("/workspace/script.sh", &writer.id)
                .await
                .unwrap();
            let found = store.get_file_writer("/workspace/script.sh").await.unwrap();
            assert_eq!(found.as_deref(), Some(writer.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_file_rewrite_replaces_writer() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let first = untrusted(store, "v1").await;
            let second = trusted(store, "v2").await;
            store.record_file_write("/workspace/a.txt", &first.id).await.unwrap();
            store.record_file_write("/workspace/a.txt", &second.id).await.unwrap();
            let found = store.get_file_writer("/workspace/a.txt").await.unwrap();
            assert_eq!(found.as_deref(), Some(second.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_untracked_file_has_no_writer() {
        let store = memory_store().await;
        assert!(store.get_file_writer("/workspace/old.txt").await.unwrap().is_none());
    }

    // ----------------------------------------------------------
    // Records
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_get_roundtrip_sqlite() {
        let store = sqlite_store().await;
        let parent = trusted(&store, "p").await;
        let created = store
            .create_tagged_data(
                "body",
                DataSource::Worker,
                TrustLevel::Untrusted,
                "worker_pipeline",
                &[parent.id.clone()],
            )
            .await
            .unwrap();

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "body");
        assert_eq!(fetched.content_digest, TaggedData::digest("body"));
        assert_eq!(fetched.source, DataSource::Worker);
        assert_eq!(fetched.trust_level, TrustLevel::Untrusted);
        assert_eq!(fetched.derived_from, vec![parent.id]);
    }

    #[tokio::test]
    async fn test_attach_scan_results() {
        for store in [
            &memory_store().await as &dyn ProvenanceStore,
            &sqlite_store().await as &dyn ProvenanceStore,
        ] {
            let data = trusted(store, "content").await;
            let mut results = BTreeMap::new();
            results.insert(
                "credential_scanner".to_string(),
                ScanResult::clean("credential_scanner"),
            );
            store.attach_scan_results(&data.id, &results).await.unwrap();
            let fetched = store.get(&data.id).await.unwrap().unwrap();
            assert!(fetched.scan_results.contains_key("credential_scanner"));
        }
    }

    #[tokio::test]
    async fn test_attach_to_missing_id_errors() {
        let store = memory_store().await;
        let result = store.attach_scan_results("ghost", &BTreeMap::new()).await;
        assert!(result.is_err());
    }

    // ----------------------------------------------------------
    // Capacity
    // ----------------------------------------------------------

    #[tokio::test]
    async fn test_memory_capacity_eviction() {
        let store = InMemoryProvenanceStore::new(5);
        let first = trusted(&store, "first").await;
        for i in 0..10 {
            trusted(&store, &format!("item {i}")).await;
        }
        assert_eq!(store.len().await, 5);
        // The oldest record is gone; its id is now unsafe.
        assert!(store.get(&first.id).await.unwrap().is_none());
        assert!(!store
            .is_trust_safe_for_execution(&[first.id.clone()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_capacity_eviction() {
        let store = SqliteProvenanceStore::new(SentinelDb::in_memory().await.unwrap(), 5);
        let first = trusted(&store, "first").await;
        for i in 0..10 {
            trusted(&store, &format!("item {i}")).await;
        }
        assert!(store.get(&first.id).await.unwrap().is_none());
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provenance")
            .fetch_one(store.db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 5);
    }
}
