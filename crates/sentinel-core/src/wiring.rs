//! Wiring: construct a gateway from configuration.
//!
//! The only place where concrete backends are chosen. Stores prefer the
//! SQLite backends and fall back to in-memory when durable storage is
//! unavailable; a missing policy file or PIN file is fatal — the service
//! must not start open.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sentinel_security::pipeline::ScanPipeline;
use sentinel_security::policy::PolicyEngine;
use sentinel_store::{
    InMemoryApprovalQueue, InMemoryAuditLog, InMemoryProvenanceStore, InMemorySessionStore,
    SentinelDb, SqliteApprovalQueue, SqliteAuditLog, SqliteProvenanceStore, SqliteSessionStore,
};
use sentinel_tools::ToolExecutor;
use sentinel_types::config::SentinelConfig;
use sentinel_types::errors::SentinelError;
use sentinel_types::traits::{ApprovalQueue, AuditLog, ProvenanceStore, SessionStore};

use crate::auth::{FixedWindowRateLimiter, LockoutTracker, PinVerifier};
use crate::bus::EventBus;
use crate::gateway::Gateway;
use crate::llm::{LocalWorker, RemotePlanner};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorDeps};

struct Stores {
    provenance: Arc<dyn ProvenanceStore>,
    sessions: Arc<dyn SessionStore>,
    approvals: Arc<dyn ApprovalQueue>,
    audit: Arc<dyn AuditLog>,
}

async fn build_stores(config: &SentinelConfig) -> Stores {
    if !config.db_path.is_empty() {
        match SentinelDb::connect(&config.db_path).await {
            Ok(db) => {
                info!(event = "stores_sqlite", db_path = %config.db_path);
                return Stores {
                    provenance: Arc::new(SqliteProvenanceStore::new(
                        db.clone(),
                        config.provenance_max_entries,
                    )),
                    sessions: Arc::new(SqliteSessionStore::new(
                        db.clone(),
                        config.session_ttl,
                        config.session_max_count,
                    )),
                    approvals: Arc::new(SqliteApprovalQueue::new(db.clone(), config.approval_ttl)),
                    audit: Arc::new(SqliteAuditLog::new(db)),
                };
            }
            Err(e) => {
                warn!(
                    event = "stores_fallback_memory",
                    db_path = %config.db_path,
                    error = %e,
                    "durable storage unavailable, falling back to in-memory stores"
                );
            }
        }
    }

    Stores {
        provenance: Arc::new(InMemoryProvenanceStore::new(config.provenance_max_entries)),
        sessions: Arc::new(InMemorySessionStore::new(
            config.session_ttl,
            config.session_max_count,
        )),
        approvals: Arc::new(InMemoryApprovalQueue::new(config.approval_ttl)),
        audit: Arc::new(InMemoryAuditLog::new()),
    }
}

/// Build a fully wired gateway. `planner_api_key` comes from the
/// operator's secret store, never from the environment of untrusted code.
pub async fn build_gateway(
    config: &SentinelConfig,
    planner_api_key: &str,
) -> Result<Gateway, SentinelError> {
    config.validate()?;

    let engine = Arc::new(PolicyEngine::from_file(
        &config.policy_file,
        &config.workspace_path,
    )?);

    let stores = build_stores(config).await;

    let worker = Arc::new(LocalWorker::new(
        &config.worker_url,
        &config.worker_model,
        config.worker_timeout,
    ));
    let planner = Arc::new(RemotePlanner::new(
        &config.planner_url,
        planner_api_key,
        &config.planner_model,
        config.planner_max_tokens,
        config.planner_timeout,
        config.planner_retries,
    ));

    let pipeline = Arc::new(ScanPipeline::new(
        config,
        engine.policy(),
        worker,
        stores.provenance.clone(),
    )?);
    let executor = Arc::new(ToolExecutor::new(engine, stores.provenance.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorDeps {
            planner,
            pipeline: pipeline.clone(),
            executor,
            approvals: stores.approvals.clone(),
            sessions: stores.sessions.clone(),
            provenance: stores.provenance,
            audit: stores.audit,
            bus: Arc::new(EventBus::new()),
        },
        OrchestratorConfig {
            approval_mode: config.approval_mode,
            conversation_enabled: config.conversation_enabled,
            spotlighting_enabled: config.spotlighting_enabled,
            conversation_warn_threshold: config.conversation_warn_threshold,
            conversation_block_threshold: config.conversation_block_threshold,
        },
    ));

    let pin = if config.pin_required {
        PinVerifier::from_file(&config.pin_file)?
    } else {
        PinVerifier::disabled()
    };

    Ok(Gateway::new(
        orchestrator,
        pipeline,
        stores.approvals,
        stores.sessions,
        pin,
        FixedWindowRateLimiter::new(Duration::from_secs(60), config.rate_limit_per_minute),
        LockoutTracker::new(config.auth_max_failures, config.auth_lockout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config(dir: &tempfile::TempDir) -> SentinelConfig {
        let policy_path = dir.path().join("policy.yaml");
        let mut f = std::fs::File::create(&policy_path).unwrap();
        writeln!(
            f,
            "writable_paths: [\"{ws}/**\"]\nread_allowed_paths: [\"{ws}/**\"]",
            ws = dir.path().display()
        )
        .unwrap();

        SentinelConfig {
            policy_file: policy_path.to_str().unwrap().to_string(),
            workspace_path: dir.path().to_str().unwrap().to_string(),
            db_path: ":memory:".to_string(),
            pin_required: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_with_sqlite_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let gateway = build_gateway(&config, "test-key").await.unwrap();
        let health = gateway.health().await;
        assert!(health.ok);
    }

    #[tokio::test]
    async fn test_build_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        // An unwritable database directory forces the in-memory fallback.
        config.db_path = "/nonexistent-dir/sentinel.db".to_string();
        let gateway = build_gateway(&config, "test-key").await.unwrap();
        assert!(gateway.health().await.ok);
    }

    #[tokio::test]
    async fn test_missing_policy_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.policy_file = "/nonexistent/policy.yaml".to_string();
        assert!(build_gateway(&config, "k").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_pin_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.pin_required = true;
        config.pin_file = "/nonexistent/pin".to_string();
        assert!(build_gateway(&config, "k").await.is_err());
    }
}
