//! Project bootstrap for a new PMS root.
//!
//! Creates the private `.pms/` layout, a default `config.toml`, an index that
//! declares the standard scopes, and sample agent profiles.
//!
//! - Never scaffolds over existing files unless `force` is set
//! - `dry_run` reports what would be written and touches nothing

use crate::core::config::PmsConfig;
use crate::core::error::PmsError;
use crate::core::store::Store;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ScaffoldOptions {
    /// Project root to bootstrap
    pub target_dir: PathBuf,
    /// Overwrite files that already exist
    pub force: bool,
    /// Report actions without writing
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaffoldAction {
    Wrote(PathBuf),
    WouldWrite(PathBuf),
    WouldSkip(PathBuf),
}

impl ScaffoldAction {
    pub fn describe(&self) -> String {
        match self {
            ScaffoldAction::Wrote(p) => format!("wrote: {}", p.display()),
            ScaffoldAction::WouldWrite(p) => format!("would-write: {}", p.display()),
            ScaffoldAction::WouldSkip(p) => {
                format!("would-skip: {} (exists; pass --force to overwrite)", p.display())
            }
        }
    }
}

const DEFAULT_INDEX: &str = r#"[flags]
dual_rollback_enabled = true
sha_validation_enabled = true

[scopes.project_status]
path = "docs/project_status.md"
kind = "text"

[scopes.blueprint]
path = "docs/blueprint.md"
kind = "text"
integrity_checked = true
protected = true

[scopes.blueprint_changes]
path = "docs/blueprint_changes.csv"
kind = "tabular"
integrity_checked = true
required_sections = ["id", "author", "timestamp", "description", "status"]

[scopes.backlog_f1]
path = "docs/backlog/backlog_f1.yaml"
kind = "structured"
"#;

const SAMPLE_AGENTS: &[(&str, &str)] = &[
    (
        "blueprint_agent",
        r#"agent_id = "blueprint_agent"
roles = ["owner", "reviewer"]

[scopes]
read = ["*"]
write = ["blueprint"]
mode = "dual"
"#,
    ),
    (
        "backlog_agent",
        r#"agent_id = "backlog_agent"

[scopes]
read = ["project_status", "blueprint", "backlog_*"]
write = ["backlog_f*"]
mode = "single"
"#,
    ),
    (
        "reviewer_agent",
        r#"agent_id = "reviewer_agent"
roles = ["reviewer"]

[scopes]
read = ["*"]
"#,
    ),
    (
        "status_agent",
        r#"agent_id = "status_agent"

[scopes]
read = ["project_status", "backlog_*"]
write = ["project_status"]

[enforcement]
strict_mode = false
"#,
    ),
];

fn ensure_parent(path: &Path) -> Result<(), PmsError> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).map_err(PmsError::IoError)?;
    }
    Ok(())
}

fn write_file(
    opts: &ScaffoldOptions,
    rel_path: &Path,
    content: &str,
    actions: &mut Vec<ScaffoldAction>,
) -> Result<(), PmsError> {
    let dest = opts.target_dir.join(rel_path);

    if dest.exists() && !opts.force {
        if opts.dry_run {
            actions.push(ScaffoldAction::WouldSkip(dest));
            return Ok(());
        }
        return Err(PmsError::ValidationError(format!(
            "Refusing to overwrite existing path without --force: {}",
            dest.display()
        )));
    }

    if opts.dry_run {
        actions.push(ScaffoldAction::WouldWrite(dest));
        return Ok(());
    }

    ensure_parent(&dest)?;
    fs::write(&dest, content).map_err(PmsError::IoError)?;
    actions.push(ScaffoldAction::Wrote(dest));
    Ok(())
}

pub fn bootstrap(opts: &ScaffoldOptions) -> Result<Vec<ScaffoldAction>, PmsError> {
    let store = Store::new(&opts.target_dir);
    let config = PmsConfig::default();
    let mut actions = Vec::new();

    if !opts.dry_run {
        store.ensure_layout()?;
    }

    let config_rel = store
        .config_path()
        .strip_prefix(&opts.target_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(".pms/config.toml"));
    write_file(opts, &config_rel, &config.to_toml_string()?, &mut actions)?;
    write_file(opts, &config.index_path, DEFAULT_INDEX, &mut actions)?;

    for (agent_id, body) in SAMPLE_AGENTS {
        let rel = config.agents_dir.join(format!("{}.toml", agent_id));
        write_file(opts, &rel, body, &mut actions)?;
    }
    Ok(actions)
}
