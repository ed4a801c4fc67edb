//! Enforcement façade: the entry point agents use.
//!
//! Every call checks the agent's profile, runs the store operation, and writes
//! exactly one audit record for the attempt, whatever the outcome. Writes are
//! always enforced. Reads are enforced when the profile is strict; otherwise a
//! denial is logged and recorded as advisory and the read proceeds.

use crate::core::audit::{AuditLogger, AuditOp, reason_for};
use crate::core::document::{DocumentStore, SaveReceipt, Snapshot};
use crate::core::error::PmsError;
use crate::core::permission::{
    AgentProfile, Decision, Operation, PermissionValidator, ProfileRegistry, decide,
};
use crate::core::transaction::{DiskFs, StagingFs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
pub struct Enforcer {
    docs: DocumentStore,
    permissions: PermissionValidator,
}

impl Enforcer {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PmsError> {
        Self::open_with_fs(root, Arc::new(DiskFs))
    }

    pub fn open_with_fs(root: impl Into<PathBuf>, fs: Arc<dyn StagingFs>) -> Result<Self, PmsError> {
        Ok(Self::new(DocumentStore::open_with_fs(root, fs)?))
    }

    pub fn new(docs: DocumentStore) -> Self {
        let agents_dir = docs.store().resolve(&docs.config().agents_dir);
        let permissions = PermissionValidator::new(ProfileRegistry::new(agents_dir));
        Self { docs, permissions }
    }

    pub fn docs(&self) -> &DocumentStore {
        &self.docs
    }

    pub fn permissions(&self) -> &PermissionValidator {
        &self.permissions
    }

    pub fn audit(&self) -> &AuditLogger {
        self.docs.audit()
    }

    pub fn session_id(&self) -> &str {
        self.audit().session_id()
    }

    /// The agent's profile, if it exists and parses.
    pub fn validate_agent(&self, agent_id: &str) -> Result<Arc<AgentProfile>, PmsError> {
        self.permissions.profile(agent_id)
    }

    /// Permission check with no side effects.
    pub fn check(&self, agent_id: &str, op: Operation, scope: &str) -> Result<Decision, PmsError> {
        self.permissions.validate(agent_id, op, scope)
    }

    pub fn agent_load(&self, agent_id: &str, scope: &str) -> Result<Snapshot, PmsError> {
        let advisory = match self.authorize(agent_id, Operation::Read, scope, AuditOp::Read)?.1 {
            Authorized::Granted => None,
            Authorized::Advisory(reason) => Some(reason),
        };
        let result = self.docs.load(scope);
        let reason = match (&result, advisory) {
            (Ok(_), advisory) => advisory.map(|r| format!("advisory_denial: {}", r)),
            (Err(e), Some(r)) => Some(format!("{} (advisory_denial: {})", reason_for(e), r)),
            (Err(e), None) => Some(reason_for(e)),
        };
        self.audit()
            .record(agent_id, scope, AuditOp::Read, result.is_ok(), reason);
        result
    }

    /// Save with the write mode declared in the agent's profile.
    pub fn agent_save(&self, agent_id: &str, scope: &str, content: &[u8]) -> Result<SaveReceipt, PmsError> {
        let (profile, _) = self.authorize(agent_id, Operation::Write, scope, AuditOp::Write)?;
        let result = self.docs.save(scope, content, profile.scopes.mode);
        self.record_outcome(agent_id, scope, AuditOp::Write, &result);
        result
    }

    pub fn agent_rollback(&self, agent_id: &str, scope: &str, target_version: u64) -> Result<SaveReceipt, PmsError> {
        self.authorize(agent_id, Operation::Write, scope, AuditOp::Rollback)?;
        // The store records the rollback attempt itself.
        self.docs.rollback(scope, target_version, agent_id)
    }

    /// Record one audit entry for a finished operation.
    pub(crate) fn record_outcome<T>(
        &self,
        agent_id: &str,
        scope: &str,
        op: AuditOp,
        result: &Result<T, PmsError>,
    ) {
        let reason = result.as_ref().err().map(reason_for);
        self.audit()
            .record(agent_id, scope, op, result.is_ok(), reason);
    }

    /// Resolve the profile and decide. Denials that end the call are audited
    /// here; granted and advisory outcomes leave the record to the caller.
    fn authorize(
        &self,
        agent_id: &str,
        op: Operation,
        scope: &str,
        audit_op: AuditOp,
    ) -> Result<(Arc<AgentProfile>, Authorized), PmsError> {
        let profile = match self.permissions.profile(agent_id) {
            Ok(p) => p,
            Err(e) => {
                self.audit()
                    .record(agent_id, scope, audit_op, false, Some(reason_for(&e)));
                return Err(e);
            }
        };
        match decide(&profile, op, scope) {
            Decision::Allow => Ok((profile, Authorized::Granted)),
            Decision::Deny(reason) if !profile.enforces(op) => {
                if profile.enforcement.log_violations {
                    warn!(agent_id, scope, %op, %reason, "advisory permission denial");
                }
                Ok((profile, Authorized::Advisory(reason)))
            }
            Decision::Deny(reason) => {
                let err = PmsError::Permission {
                    agent: agent_id.to_string(),
                    operation: op.to_string(),
                    scope: scope.to_string(),
                };
                if profile.enforcement.log_violations {
                    warn!(agent_id, scope, %op, %reason, "permission denied");
                }
                self.audit()
                    .record(agent_id, scope, audit_op, false, Some(reason_for(&err)));
                Err(err)
            }
        }
    }
}

enum Authorized {
    Granted,
    Advisory(String),
}
