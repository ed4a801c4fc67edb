//! PMS: a persistent memory store for cooperating agents.
//!
//! A small, local, file-backed document store. Each document is addressed by a
//! logical *scope* declared in an index. The store guarantees:
//!
//! - **Atomic replace**: writes are staged, validated and committed with a
//!   single rename, so readers see whole old or whole new content
//! - **Integrity**: SHA-256 hashes recorded per version; tampering surfaces as
//!   [`core::error::PmsError::Integrity`] and is never repaired silently
//! - **Per-scope serialization**: writers to one scope queue on a lock file;
//!   locks left by dead processes are reclaimed
//! - **Scope permissions**: agents act through [`core::enforcer::Enforcer`],
//!   which checks their profile and writes one audit record per attempt
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   .pms/config.toml           store configuration
//!   .pms/meta/<scope>.json     version + hash sidecars
//!   .pms/backups/<scope>/      retained prior versions
//!   .pms/locks/<scope>.lock    write locks
//!   .pms/audit.events.jsonl    audit trail
//!   memory/index.toml          scope declarations
//!   agents/<agent_id>.toml     agent profiles
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage primitives, document store, permissions, audit, façade
//! - [`plugins`]: subsystems built on scopes (change-proposal ledger)

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{AgentsCommand, Cli, Command, ProposalCommand};
use crate::core::enforcer::Enforcer;
use crate::core::error::PmsError;
use crate::core::permission::Operation;
use crate::core::scaffold::{ScaffoldOptions, bootstrap};
use crate::core::{audit, logging, store, time};
use crate::plugins::proposals::{ProposalLedger, ProposalStatus};
use clap::Parser;
use colored::Colorize;
use serde_json::json;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Environment variable overriding the project root.
pub const ROOT_ENV: &str = "PMS_ROOT";

fn find_project_root(start_dir: &Path) -> Result<PathBuf, PmsError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(store::STATE_DIR).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(PmsError::ConfigError(
                "'.pms' directory not found in current or parent directories. Run `pms init` first."
                    .to_string(),
            ));
        }
    }
}

fn resolve_root(explicit: Option<PathBuf>) -> Result<PathBuf, PmsError> {
    if let Some(root) = explicit {
        return Ok(root);
    }
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    find_project_root(&std::env::current_dir()?)
}

/// Leading hex digits of a hash for display; the whole value if it is shorter.
fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn read_input(file: Option<&Path>) -> Result<Vec<u8>, PmsError> {
    match file {
        Some(path) => std::fs::read(path).map_err(PmsError::IoError),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, cmd: &str, text: impl FnOnce() -> String, extra: serde_json::Value) {
        if self.json {
            println!("{}", time::command_envelope(cmd, "ok", extra));
        } else {
            println!("{}", text());
        }
    }
}

pub fn run() -> Result<(), PmsError> {
    logging::init();
    let cli = Cli::parse();
    let out = Output {
        json: cli.format == "json",
    };

    if let Command::Init {
        dir,
        force,
        dry_run,
    } = &cli.command
    {
        let target_dir = match dir {
            Some(d) => d.clone(),
            None => std::env::current_dir()?,
        };
        let actions = bootstrap(&ScaffoldOptions {
            target_dir: target_dir.clone(),
            force: *force,
            dry_run: *dry_run,
        })?;
        let lines: Vec<String> = actions.iter().map(|a| a.describe()).collect();
        out.emit(
            "init",
            || {
                let mut s = format!("{} {}", "Initialized".green().bold(), target_dir.display());
                for line in &lines {
                    s.push_str(&format!("\n  {}", line));
                }
                s
            },
            json!({ "root": target_dir, "actions": lines }),
        );
        return Ok(());
    }

    let root = resolve_root(cli.root)?;
    let enforcer = Enforcer::open(&root)?;

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Load { agent, scope } => {
            let snap = enforcer.agent_load(&agent, &scope)?;
            if out.json {
                out.emit(
                    "load",
                    String::new,
                    json!({
                        "scope": snap.scope,
                        "version": snap.version,
                        "content_hash": snap.content_hash,
                        "last_modified": snap.last_modified,
                        "content": String::from_utf8_lossy(&snap.content),
                    }),
                );
            } else {
                io::stdout().write_all(&snap.content)?;
            }
        }
        Command::Save { agent, scope, file } => {
            let content = read_input(file.as_deref())?;
            let receipt = enforcer.agent_save(&agent, &scope, &content)?;
            out.emit(
                "save",
                || {
                    format!(
                        "{} {} v{} ({}, {})",
                        "saved".green(),
                        receipt.scope,
                        receipt.version,
                        receipt.mode,
                        short_hash(&receipt.content_hash)
                    )
                },
                json!({ "receipt": receipt }),
            );
        }
        Command::Rollback {
            agent,
            scope,
            version,
        } => {
            let receipt = enforcer.agent_rollback(&agent, &scope, version)?;
            out.emit(
                "rollback",
                || {
                    format!(
                        "{} {} to v{} as v{}",
                        "restored".green(),
                        receipt.scope,
                        version,
                        receipt.version
                    )
                },
                json!({ "receipt": receipt, "restored": version }),
            );
        }
        Command::History { scope } => {
            let versions = enforcer.docs().history(&scope)?;
            out.emit(
                "history",
                || {
                    versions
                        .iter()
                        .map(|v| {
                            format!(
                                "{:>4}{} {} {:>8}B {}",
                                v.version,
                                if v.current { "*" } else { " " },
                                v.saved_at,
                                v.size,
                                short_hash(&v.content_hash)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
                json!({ "scope": scope, "versions": versions }),
            );
        }
        Command::Verify { scope } => {
            let reports = match scope {
                Some(s) => vec![enforcer.docs().verify(&s)?],
                None => enforcer.docs().verify_all()?,
            };
            let failed = reports.iter().filter(|r| !r.ok).count();
            out.emit(
                "verify",
                || {
                    reports
                        .iter()
                        .map(|r| {
                            let mark = if r.ok { "ok".green() } else { "FAIL".red().bold() };
                            format!("{:<6} {:<24} {}", mark, r.scope, r.detail)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
                json!({ "reports": reports, "failed": failed }),
            );
            if failed > 0 {
                return Err(PmsError::ValidationError(format!(
                    "{} scope(s) failed verification",
                    failed
                )));
            }
        }
        Command::Agents(group) => run_agents(&enforcer, &out, group.command)?,
        Command::Audit {
            agent,
            limit,
            violations,
        } => {
            let records = audit::read_log(enforcer.audit().path())?;
            if violations {
                let summary = audit::summarize_violations(&records);
                out.emit(
                    "audit",
                    || {
                        let mut s = format!("violations: {}", summary.total_violations);
                        s.push_str(&format!(
                            "\nagents: {}",
                            summary.agents_with_violations.join(", ")
                        ));
                        for (scope, n) in &summary.top_scopes {
                            s.push_str(&format!("\n  {:<24} {}", scope, n));
                        }
                        s
                    },
                    json!({ "summary": summary }),
                );
            } else {
                let shown: Vec<_> = match &agent {
                    Some(a) => audit::agent_activity(&records, a, limit),
                    None => records.iter().rev().take(limit).cloned().collect(),
                };
                out.emit(
                    "audit",
                    || {
                        shown
                            .iter()
                            .map(|r| {
                                let mark = if r.success { "ok".green() } else { "denied".red() };
                                format!(
                                    "{} {:<6} {:<16} {:<8} {:<24} {}",
                                    r.ts,
                                    mark,
                                    r.agent_id,
                                    r.operation,
                                    r.scope,
                                    r.reason.as_deref().unwrap_or("")
                                )
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    },
                    json!({ "records": shown }),
                );
            }
        }
        Command::Proposal(group) => run_proposal(&enforcer, &out, group.command)?,
    }
    Ok(())
}

fn run_agents(enforcer: &Enforcer, out: &Output, command: AgentsCommand) -> Result<(), PmsError> {
    let permissions = enforcer.permissions();
    match command {
        AgentsCommand::List => {
            let agents = permissions.list_agents()?;
            out.emit("agents.list", || agents.join("\n"), json!({ "agents": agents }));
        }
        AgentsCommand::Show { agent } => {
            let profile = enforcer.validate_agent(&agent)?;
            out.emit(
                "agents.show",
                || toml::to_string_pretty(profile.as_ref()).unwrap_or_default(),
                json!({ "profile": profile.as_ref() }),
            );
        }
        AgentsCommand::Matrix => {
            let scopes: Vec<String> = enforcer
                .docs()
                .index()
                .scopes()
                .map(str::to_string)
                .collect();
            let rows = permissions.permission_matrix(&scopes)?;
            out.emit(
                "agents.matrix",
                || {
                    let mut s = format!("{:<20}", "agent");
                    for scope in &scopes {
                        s.push_str(&format!(" {:<18}", scope));
                    }
                    for row in &rows {
                        s.push_str(&format!("\n{:<20}", row.agent_id));
                        for (_, cell) in &row.cells {
                            s.push_str(&format!(" {:<18}", cell));
                        }
                    }
                    s
                },
                json!({ "scopes": scopes, "rows": rows }),
            );
        }
        AgentsCommand::Test {
            agent,
            operation,
            scope,
        } => {
            let op: Operation = operation.parse()?;
            let e = permissions.explain(&agent, op, &scope)?;
            out.emit(
                "agents.test",
                || {
                    if e.allowed {
                        format!(
                            "{} {} may {} {} via {}",
                            "ALLOW".green().bold(),
                            e.agent_id,
                            e.operation,
                            e.scope,
                            e.matched_pattern.as_deref().unwrap_or("")
                        )
                    } else {
                        format!(
                            "{} {} may not {} {} (patterns: [{}])",
                            "DENY".red().bold(),
                            e.agent_id,
                            e.operation,
                            e.scope,
                            e.candidates.join(", ")
                        )
                    }
                },
                json!({ "explanation": e }),
            );
        }
        AgentsCommand::Reload => {
            let count = permissions.reload()?;
            out.emit(
                "agents.reload",
                || format!("reloaded {} profile(s)", count),
                json!({ "count": count }),
            );
        }
    }
    Ok(())
}

fn run_proposal(enforcer: &Enforcer, out: &Output, command: ProposalCommand) -> Result<(), PmsError> {
    let ledger = ProposalLedger::new(enforcer);
    match command {
        ProposalCommand::List => {
            let proposals = ledger.list()?;
            out.emit(
                "proposal.list",
                || {
                    proposals
                        .iter()
                        .map(|p| {
                            format!(
                                "#{:<4} {:<9} {:<16} {}",
                                p.id, p.status, p.author, p.description
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                },
                json!({ "proposals": proposals }),
            );
        }
        ProposalCommand::Propose {
            author,
            description,
        } => {
            let id = ledger.propose(&author, &description)?;
            out.emit(
                "proposal.propose",
                || format!("opened proposal #{}", id),
                json!({ "id": id }),
            );
        }
        ProposalCommand::Advance { id, status, actor } => {
            let to: ProposalStatus = status.parse()?;
            let p = ledger.advance(id, to, &actor)?;
            out.emit(
                "proposal.advance",
                || format!("proposal #{} is now {}", p.id, p.status),
                json!({ "proposal": p }),
            );
        }
        ProposalCommand::Merge { id, actor, file } => {
            let content = read_input(file.as_deref())?;
            let receipt = ledger.merge(id, &actor, &content)?;
            out.emit(
                "proposal.merge",
                || format!("merged proposal #{} into {} v{}", id, receipt.scope, receipt.version),
                json!({ "id": id, "receipt": receipt }),
            );
        }
    }
    Ok(())
}
