//! Change-proposal ledger for protected documents.
//!
//! Proposals live as CSV rows (`id,author,timestamp,description,status`) in the
//! configured ledger scope. Rows are only ever appended: the first row for an
//! id carries the author and description, and the last row carries its current
//! status. Each transition row records the actor who made it in `author`.
//!
//! Lifecycle: `proposed -> reviewed -> approved -> merged`, one step at a time.
//! Reviewing and approving need the `reviewer` role and an actor other than the
//! author; merging needs the configured owner agent holding the `owner` role.

use crate::core::audit::AuditOp;
use crate::core::document::{SaveReceipt, WriteMode};
use crate::core::enforcer::Enforcer;
use crate::core::error::PmsError;
use crate::core::permission::{AgentProfile, Decision, Operation, Role, decide};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Reviewed,
    Approved,
    Merged,
}

impl ProposalStatus {
    pub fn next(self) -> Option<ProposalStatus> {
        match self {
            ProposalStatus::Proposed => Some(ProposalStatus::Reviewed),
            ProposalStatus::Reviewed => Some(ProposalStatus::Approved),
            ProposalStatus::Approved => Some(ProposalStatus::Merged),
            ProposalStatus::Merged => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Reviewed => "reviewed",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = PmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proposed" => Ok(ProposalStatus::Proposed),
            "reviewed" => Ok(ProposalStatus::Reviewed),
            "approved" => Ok(ProposalStatus::Approved),
            "merged" => Ok(ProposalStatus::Merged),
            other => Err(PmsError::ValidationError(format!(
                "unknown proposal status '{}'",
                other
            ))),
        }
    }
}

/// One row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub id: u64,
    pub author: String,
    pub timestamp: String,
    pub description: String,
    pub status: ProposalStatus,
}

/// A proposal folded from its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Proposal {
    pub id: u64,
    pub author: String,
    pub created_at: String,
    pub description: String,
    pub status: ProposalStatus,
    pub updated_at: String,
    pub updated_by: String,
}

pub fn parse_rows(bytes: &[u8]) -> Result<Vec<LedgerRow>, PmsError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let mut rows = Vec::new();
    for row in reader.deserialize::<LedgerRow>() {
        rows.push(row?);
    }
    Ok(rows)
}

fn append_row(current: &[u8], row: &LedgerRow) -> Result<Vec<u8>, PmsError> {
    let fresh = current.iter().all(u8::is_ascii_whitespace);
    let mut out = if fresh { Vec::new() } else { current.to_vec() };
    if !fresh && !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(&mut out);
        writer.serialize(row)?;
        writer.flush().map_err(PmsError::IoError)?;
    }
    Ok(out)
}

/// Fold rows into proposals, ordered by id.
pub fn fold(rows: &[LedgerRow]) -> Vec<Proposal> {
    let mut by_id: BTreeMap<u64, Proposal> = BTreeMap::new();
    for row in rows {
        by_id
            .entry(row.id)
            .and_modify(|p| {
                p.status = row.status;
                p.updated_at = row.timestamp.clone();
                p.updated_by = row.author.clone();
            })
            .or_insert_with(|| Proposal {
                id: row.id,
                author: row.author.clone(),
                created_at: row.timestamp.clone(),
                description: row.description.clone(),
                status: row.status,
                updated_at: row.timestamp.clone(),
                updated_by: row.author.clone(),
            });
    }
    by_id.into_values().collect()
}

fn find(rows: &[LedgerRow], id: u64) -> Result<Proposal, PmsError> {
    fold(rows)
        .into_iter()
        .find(|p| p.id == id)
        .ok_or_else(|| PmsError::ValidationError(format!("no proposal with id {}", id)))
}

fn check_step(proposal: &Proposal, to: ProposalStatus) -> Result<(), PmsError> {
    if proposal.status.next() == Some(to) {
        Ok(())
    } else {
        Err(PmsError::InvalidTransition {
            id: proposal.id,
            from: proposal.status.to_string(),
            to: to.to_string(),
        })
    }
}

fn denied(actor: &str, action: &str, scope: &str) -> PmsError {
    PmsError::Permission {
        agent: actor.to_string(),
        operation: action.to_string(),
        scope: scope.to_string(),
    }
}

pub struct ProposalLedger<'a> {
    enforcer: &'a Enforcer,
}

impl<'a> ProposalLedger<'a> {
    pub fn new(enforcer: &'a Enforcer) -> Self {
        Self { enforcer }
    }

    fn scope(&self) -> &str {
        &self.enforcer.docs().config().ledger.scope
    }

    fn protected_scope(&self) -> &str {
        &self.enforcer.docs().config().ledger.protected_scope
    }

    fn owner(&self) -> &str {
        &self.enforcer.docs().config().ledger.owner
    }

    /// All proposals with their current status. An unwritten ledger is empty.
    pub fn list(&self) -> Result<Vec<Proposal>, PmsError> {
        match self.enforcer.docs().load(self.scope()) {
            Ok(snap) => Ok(fold(&parse_rows(&snap.content)?)),
            Err(PmsError::ScopeNotFound(s)) if s == self.scope() && self.is_declared() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: u64) -> Result<Proposal, PmsError> {
        self.list()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PmsError::ValidationError(format!("no proposal with id {}", id)))
    }

    fn is_declared(&self) -> bool {
        self.enforcer.docs().index().resolve(self.scope()).is_ok()
    }

    /// Open a proposal. Any agent with a valid profile may propose.
    pub fn propose(&self, author: &str, description: &str) -> Result<u64, PmsError> {
        let scope = self.scope().to_string();
        let result = self.enforcer.validate_agent(author).and_then(|_| {
            self.enforcer
                .docs()
                .update(&scope, WriteMode::Dual, |current| {
                    let rows = parse_rows(current)?;
                    let id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
                    let row = LedgerRow {
                        id,
                        author: author.to_string(),
                        timestamp: time::now_epoch_z(),
                        description: description.to_string(),
                        status: ProposalStatus::Proposed,
                    };
                    Ok((append_row(current, &row)?, id))
                })
                .map(|(id, _)| id)
        });
        self.enforcer
            .record_outcome(author, &scope, AuditOp::Write, &result);
        if let Ok(id) = &result {
            info!(id, author, "proposal opened");
        }
        result
    }

    /// Move a proposal one step forward. Advancing to `merged` records the
    /// status only; [`ProposalLedger::merge`] also applies the content.
    pub fn advance(&self, id: u64, to: ProposalStatus, actor: &str) -> Result<Proposal, PmsError> {
        let scope = self.scope().to_string();
        let result = self.enforcer.validate_agent(actor).and_then(|profile| {
            self.enforcer
                .docs()
                .update(&scope, WriteMode::Dual, |current| {
                    let rows = parse_rows(current)?;
                    let proposal = find(&rows, id)?;
                    check_step(&proposal, to)?;
                    self.check_role(&proposal, to, &profile)?;
                    let row = LedgerRow {
                        id,
                        author: actor.to_string(),
                        timestamp: time::now_epoch_z(),
                        description: proposal.description.clone(),
                        status: to,
                    };
                    let next = append_row(current, &row)?;
                    let updated = Proposal {
                        status: to,
                        updated_at: row.timestamp,
                        updated_by: row.author,
                        ..proposal
                    };
                    Ok((next, updated))
                })
                .map(|(p, _)| p)
        });
        self.enforcer
            .record_outcome(actor, &scope, AuditOp::Write, &result);
        if result.is_ok() {
            info!(id, status = %to, actor, "proposal advanced");
        }
        result
    }

    /// Apply an approved proposal: save `content` to the protected scope as the
    /// owner, then record it as merged. Either both happen or neither is visible.
    pub fn merge(&self, id: u64, actor: &str, content: &[u8]) -> Result<SaveReceipt, PmsError> {
        let protected = self.protected_scope().to_string();
        let result = self.merge_inner(id, actor, content);
        self.enforcer
            .record_outcome(actor, &protected, AuditOp::Write, &result);
        if result.is_ok() {
            info!(id, actor, scope = %protected, "proposal merged");
        }
        result
    }

    fn merge_inner(&self, id: u64, actor: &str, content: &[u8]) -> Result<SaveReceipt, PmsError> {
        let profile = self.enforcer.validate_agent(actor)?;
        let docs = self.enforcer.docs();
        let protected = self.protected_scope();

        let ledger_lock = docs.lock(self.scope())?;
        let current = docs
            .read_locked(&ledger_lock)?
            .map(|s| s.content)
            .unwrap_or_default();
        let rows = parse_rows(&current)?;
        let proposal = find(&rows, id)?;
        check_step(&proposal, ProposalStatus::Merged)?;
        self.check_role(&proposal, ProposalStatus::Merged, &profile)?;
        if let Decision::Deny(_) = decide(&profile, Operation::Write, protected) {
            return Err(denied(actor, "write", protected));
        }

        let protected_lock = docs.lock(protected)?;
        let prior = docs.capture_locked(&protected_lock)?;
        let receipt = docs.save_locked(&protected_lock, content, WriteMode::Dual)?;

        let row = LedgerRow {
            id,
            author: actor.to_string(),
            timestamp: time::now_epoch_z(),
            description: proposal.description,
            status: ProposalStatus::Merged,
        };
        let recorded = append_row(&current, &row)
            .and_then(|next| docs.save_locked(&ledger_lock, &next, WriteMode::Dual));
        if let Err(e) = recorded {
            if let Err(undo) = docs.revert_locked(&protected_lock, &prior) {
                error!(
                    id,
                    scope = protected,
                    error = %undo,
                    "could not undo protected save after ledger failure"
                );
            }
            return Err(e);
        }
        Ok(receipt)
    }

    fn check_role(&self, proposal: &Proposal, to: ProposalStatus, actor: &AgentProfile) -> Result<(), PmsError> {
        let scope = self.scope();
        match to {
            ProposalStatus::Reviewed | ProposalStatus::Approved => {
                if !actor.has_role(Role::Reviewer) {
                    return Err(denied(&actor.agent_id, to.as_str(), scope));
                }
                if actor.agent_id == proposal.author {
                    return Err(denied(&actor.agent_id, &format!("{} own proposal", to), scope));
                }
                Ok(())
            }
            ProposalStatus::Merged => {
                if actor.agent_id != self.owner() || !actor.has_role(Role::Owner) {
                    return Err(denied(&actor.agent_id, "merge", self.protected_scope()));
                }
                Ok(())
            }
            ProposalStatus::Proposed => Err(PmsError::InvalidTransition {
                id: proposal.id,
                from: proposal.status.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "proposals",
        "version": "0.1.0",
        "description": "Change-proposal ledger for protected documents",
        "commands": [
            { "name": "list", "description": "List proposals and their current status" },
            { "name": "propose", "parameters": ["author", "description"] },
            { "name": "advance", "parameters": ["id", "status", "actor"] },
            { "name": "merge", "parameters": ["id", "actor", "file"] }
        ],
        "storage": ["ledger scope (CSV)"]
    })
}
