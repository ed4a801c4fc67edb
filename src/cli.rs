//! CLI struct definitions for the `pms` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "pms",
    version = env!("CARGO_PKG_VERSION"),
    about = "Persistent memory store: atomic, integrity-checked, permissioned documents for cooperating agents."
)]
pub(crate) struct Cli {
    /// Project root (defaults to $PMS_ROOT, then the nearest directory containing `.pms/`).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    pub format: String,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Bootstrap a project: .pms/ layout, config, index and sample agents
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
        /// Overwrite existing files.
        #[clap(long)]
        force: bool,
        /// Show what would change without writing files.
        #[clap(long)]
        dry_run: bool,
    },
    /// Read a scope as an agent and print its content
    Load {
        #[clap(long)]
        agent: String,
        scope: String,
    },
    /// Write a scope as an agent
    Save {
        #[clap(long)]
        agent: String,
        scope: String,
        /// File holding the new content; reads stdin when omitted.
        #[clap(long)]
        file: Option<PathBuf>,
    },
    /// Restore a retained version of a scope as an agent
    Rollback {
        #[clap(long)]
        agent: String,
        scope: String,
        version: u64,
    },
    /// List retained versions of a scope
    History { scope: String },
    /// Check stored content against recorded hashes and structural rules
    Verify {
        /// Scope to verify; all declared scopes when omitted.
        scope: Option<String>,
    },
    /// Inspect agent profiles and permissions
    Agents(AgentsCli),
    /// Show audit records
    Audit {
        /// Only records for this agent.
        #[clap(long)]
        agent: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
        /// Print the violation summary instead of records.
        #[clap(long)]
        violations: bool,
    },
    /// Change proposals for the protected document
    Proposal(ProposalCli),
}

#[derive(clap::Args, Debug)]
pub(crate) struct AgentsCli {
    #[clap(subcommand)]
    pub command: AgentsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AgentsCommand {
    /// List agents with a profile
    List,
    /// Show one agent's profile
    Show { agent: String },
    /// Access grid of every agent over every declared scope
    Matrix,
    /// Explain whether an agent may perform an operation on a scope
    Test {
        agent: String,
        /// 'read' or 'write'
        operation: String,
        scope: String,
    },
    /// Re-read every profile from disk
    Reload,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ProposalCli {
    #[clap(subcommand)]
    pub command: ProposalCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ProposalCommand {
    /// List proposals and their current status
    List,
    /// Open a proposal
    Propose {
        #[clap(long)]
        author: String,
        description: String,
    },
    /// Move a proposal to its next status
    Advance {
        id: u64,
        /// 'reviewed', 'approved' or 'merged'
        status: String,
        #[clap(long)]
        actor: String,
    },
    /// Apply an approved proposal to the protected document
    Merge {
        id: u64,
        #[clap(long)]
        actor: String,
        /// File holding the merged document; reads stdin when omitted.
        #[clap(long)]
        file: Option<PathBuf>,
    },
}
