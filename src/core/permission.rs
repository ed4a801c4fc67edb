//! Agent profiles and scope permission checks.
//!
//! A profile lists read and write patterns. A pattern is either an exact scope
//! name or a literal prefix followed by `*`. Read access is granted by any read
//! or write pattern; write access only by write patterns. Any match grants.
//!
//! Profiles are loaded from `<agents_dir>/<agent_id>.toml` on first use and
//! shared as `Arc<AgentProfile>`; a loaded profile is never mutated. `reload`
//! builds a complete new cache and swaps it in.

use crate::core::document::WriteMode;
use crate::core::error::PmsError;
use crate::core::index::validate_scope_name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopePattern {
    Exact(String),
    /// Stored without the trailing `*`.
    PrefixWildcard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Wildcard,
}

impl ScopePattern {
    pub fn matches(&self, scope: &str) -> bool {
        match self {
            ScopePattern::Exact(name) => name == scope,
            ScopePattern::PrefixWildcard(prefix) => scope.starts_with(prefix.as_str()),
        }
    }

    pub fn kind(&self) -> MatchKind {
        match self {
            ScopePattern::Exact(_) => MatchKind::Exact,
            ScopePattern::PrefixWildcard(_) => MatchKind::Wildcard,
        }
    }
}

impl FromStr for ScopePattern {
    type Err = PmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PmsError::ValidationError("empty scope pattern".into()));
        }
        match s.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => Err(PmsError::ValidationError(format!(
                "scope pattern '{}' may only use '*' as its last character",
                s
            ))),
            Some(prefix) => Ok(ScopePattern::PrefixWildcard(prefix.to_string())),
            None if s.contains('*') => Err(PmsError::ValidationError(format!(
                "scope pattern '{}' may only use '*' as its last character",
                s
            ))),
            None => Ok(ScopePattern::Exact(s.to_string())),
        }
    }
}

impl TryFrom<String> for ScopePattern {
    type Error = PmsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ScopePattern> for String {
    fn from(p: ScopePattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePattern::Exact(name) => f.write_str(name),
            ScopePattern::PrefixWildcard(prefix) => write!(f, "{}*", prefix),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::Write => "write",
        })
    }
}

impl FromStr for Operation {
    type Err = PmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            other => Err(PmsError::ValidationError(format!(
                "unknown operation '{}': expected read or write",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reviewer,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScopeGrants {
    pub read: Vec<ScopePattern>,
    pub write: Vec<ScopePattern>,
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementSettings {
    pub enabled: bool,
    pub strict_mode: bool,
    pub log_violations: bool,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_mode: true,
            log_violations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub scopes: ScopeGrants,
    #[serde(default)]
    pub enforcement: EnforcementSettings,
}

impl AgentProfile {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Patterns consulted for `op`, in the order they are tried.
    pub fn applicable(&self, op: Operation) -> impl Iterator<Item = &ScopePattern> {
        let reads = match op {
            Operation::Read => self.scopes.read.as_slice(),
            Operation::Write => &[],
        };
        reads.iter().chain(self.scopes.write.iter())
    }

    pub fn find_match(&self, op: Operation, scope: &str) -> Option<&ScopePattern> {
        self.applicable(op).find(|p| p.matches(scope))
    }

    /// Denials on reads are enforced only when enforcement is on and strict.
    pub fn enforces(&self, op: Operation) -> bool {
        op == Operation::Write || (self.enforcement.enabled && self.enforcement.strict_mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Explanation {
    pub agent_id: String,
    pub operation: Operation,
    pub scope: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_kind: Option<MatchKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    /// Patterns that were tried, when nothing matched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MatrixRow {
    pub agent_id: String,
    /// `RW`, `R-`, `-W` or `--` per requested scope, in order.
    pub cells: Vec<(String, String)>,
}

type ProfileMap = HashMap<String, Arc<AgentProfile>>;

#[derive(Debug)]
pub struct ProfileRegistry {
    dir: PathBuf,
    cache: RwLock<Arc<ProfileMap>>,
}

impl ProfileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, agent_id: &str) -> Result<Arc<AgentProfile>, PmsError> {
        if let Some(p) = self.snapshot().get(agent_id) {
            return Ok(Arc::clone(p));
        }
        let profile = Arc::new(load_profile(&self.dir, agent_id)?);
        let mut guard = self
            .cache
            .write()
            .map_err(|_| PmsError::ConfigError("profile cache poisoned".into()))?;
        // Another thread may have loaded it first; keep theirs.
        if let Some(existing) = guard.get(agent_id) {
            return Ok(Arc::clone(existing));
        }
        let mut next = ProfileMap::clone(&guard);
        next.insert(agent_id.to_string(), Arc::clone(&profile));
        *guard = Arc::new(next);
        debug!(agent_id, "agent profile loaded");
        Ok(profile)
    }

    /// Re-read every profile in the directory and replace the cache in one step.
    /// On any malformed profile the previous cache stays in place.
    pub fn reload(&self) -> Result<usize, PmsError> {
        let mut fresh = ProfileMap::new();
        for agent_id in self.list_agents()? {
            let profile = load_profile(&self.dir, &agent_id)?;
            fresh.insert(agent_id, Arc::new(profile));
        }
        let count = fresh.len();
        let mut guard = self
            .cache
            .write()
            .map_err(|_| PmsError::ConfigError("profile cache poisoned".into()))?;
        *guard = Arc::new(fresh);
        debug!(count, "agent profiles reloaded");
        Ok(count)
    }

    pub fn invalidate(&self, agent_id: &str) {
        if let Ok(mut guard) = self.cache.write() {
            if guard.contains_key(agent_id) {
                let mut next = ProfileMap::clone(&guard);
                next.remove(agent_id);
                *guard = Arc::new(next);
            }
        }
    }

    /// Agent ids with a profile file, sorted.
    pub fn list_agents(&self) -> Result<Vec<String>, PmsError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PmsError::IoError(e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn snapshot(&self) -> Arc<ProfileMap> {
        self.cache
            .read()
            .map(|g| Arc::clone(&*g))
            .unwrap_or_default()
    }
}

fn load_profile(dir: &Path, agent_id: &str) -> Result<AgentProfile, PmsError> {
    validate_scope_name(agent_id).map_err(|_| PmsError::AgentNotFound(agent_id.to_string()))?;
    let path = dir.join(format!("{}.toml", agent_id));
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PmsError::AgentNotFound(agent_id.to_string()));
        }
        Err(e) => return Err(PmsError::IoError(e)),
    };
    let profile: AgentProfile = toml::from_str(&content).map_err(|e| {
        PmsError::AgentNotFound(format!("{} (malformed profile: {})", agent_id, e))
    })?;
    if profile.agent_id != agent_id {
        return Err(PmsError::AgentNotFound(format!(
            "{} (profile declares agent_id '{}')",
            agent_id, profile.agent_id
        )));
    }
    Ok(profile)
}

#[derive(Debug)]
pub struct PermissionValidator {
    registry: ProfileRegistry,
}

impl PermissionValidator {
    pub fn new(registry: ProfileRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn profile(&self, agent_id: &str) -> Result<Arc<AgentProfile>, PmsError> {
        self.registry.get(agent_id)
    }

    pub fn validate(&self, agent_id: &str, op: Operation, scope: &str) -> Result<Decision, PmsError> {
        let profile = self.profile(agent_id)?;
        Ok(decide(&profile, op, scope))
    }

    pub fn explain(&self, agent_id: &str, op: Operation, scope: &str) -> Result<Explanation, PmsError> {
        let profile = self.profile(agent_id)?;
        let matched = profile.find_match(op, scope);
        Ok(Explanation {
            agent_id: agent_id.to_string(),
            operation: op,
            scope: scope.to_string(),
            allowed: matched.is_some(),
            match_kind: matched.map(ScopePattern::kind),
            matched_pattern: matched.map(ToString::to_string),
            candidates: if matched.is_some() {
                Vec::new()
            } else {
                profile.applicable(op).map(ToString::to_string).collect()
            },
        })
    }

    /// Access grid for every known agent over `scopes`.
    pub fn permission_matrix(&self, scopes: &[String]) -> Result<Vec<MatrixRow>, PmsError> {
        let mut rows = Vec::new();
        for agent_id in self.registry.list_agents()? {
            let profile = self.profile(&agent_id)?;
            let cells = scopes
                .iter()
                .map(|scope| {
                    let r = profile.find_match(Operation::Read, scope).is_some();
                    let w = profile.find_match(Operation::Write, scope).is_some();
                    let cell = format!("{}{}", if r { 'R' } else { '-' }, if w { 'W' } else { '-' });
                    (scope.clone(), cell)
                })
                .collect();
            rows.push(MatrixRow { agent_id, cells });
        }
        Ok(rows)
    }

    pub fn list_agents(&self) -> Result<Vec<String>, PmsError> {
        self.registry.list_agents()
    }

    pub fn reload(&self) -> Result<usize, PmsError> {
        self.registry.reload()
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.registry.invalidate(agent_id)
    }
}

pub fn decide(profile: &AgentProfile, op: Operation, scope: &str) -> Decision {
    if profile.find_match(op, scope).is_some() {
        return Decision::Allow;
    }
    let patterns: Vec<String> = profile.applicable(op).map(ToString::to_string).collect();
    Decision::Deny(format!(
        "no {} pattern for '{}' matches (agent '{}' has [{}])",
        op,
        scope,
        profile.agent_id,
        patterns.join(", ")
    ))
}
