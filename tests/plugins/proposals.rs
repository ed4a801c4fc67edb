use pms::core::enforcer::Enforcer;
use pms::core::error::PmsError;
use pms::core::scaffold::{ScaffoldOptions, bootstrap};
use pms::core::transaction::{DiskFs, StagingFs};
use pms::plugins::proposals::{ProposalLedger, ProposalStatus, parse_rows};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use tempfile::tempdir;

const BLUEPRINT_V1: &[u8] = b"# Blueprint\n\n## Layers\ncore, plugins\n";
const BLUEPRINT_V2: &[u8] = b"# Blueprint\n\n## Layers\ncore, plugins, cli\n";

fn setup(root: &Path) {
    bootstrap(&ScaffoldOptions {
        target_dir: root.to_path_buf(),
        force: false,
        dry_run: false,
    })
    .expect("bootstrap");
    // Require the heading so malformed merges fail validation.
    let index_path = root.join("memory/index.toml");
    let index = fs::read_to_string(&index_path).expect("read index");
    let index = index.replace(
        "integrity_checked = true\nprotected = true\n",
        "integrity_checked = true\nprotected = true\nrequired_sections = [\"# Blueprint\"]\n",
    );
    assert!(index.contains("required_sections = [\"# Blueprint\"]"));
    fs::write(&index_path, index).expect("write index");
}

fn seed_blueprint(enforcer: &Enforcer) {
    enforcer
        .agent_save("blueprint_agent", "blueprint", BLUEPRINT_V1)
        .expect("seed blueprint");
}

fn approved(ledger: &ProposalLedger<'_>, author: &str, description: &str) -> u64 {
    let id = ledger.propose(author, description).expect("propose");
    ledger
        .advance(id, ProposalStatus::Reviewed, "reviewer_agent")
        .expect("review");
    ledger
        .advance(id, ProposalStatus::Approved, "reviewer_agent")
        .expect("approve");
    id
}

/// Fails the final rename of the ledger file once armed.
#[derive(Debug, Default)]
struct LedgerCommitFails {
    armed: AtomicBool,
}

impl StagingFs for LedgerCommitFails {
    fn write_staged(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        DiskFs.write_staged(path, bytes)
    }

    fn replace(&self, staged: &Path, target: &Path) -> io::Result<()> {
        let is_ledger = target
            .file_name()
            .is_some_and(|n| n == "blueprint_changes.csv");
        if is_ledger && self.armed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        DiskFs.replace(staged, target)
    }
}

#[test]
fn proposal_walks_the_role_gated_lifecycle() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let enforcer = Enforcer::open(tmp.path()).expect("open");
    seed_blueprint(&enforcer);
    let ledger = ProposalLedger::new(&enforcer);

    let id = ledger
        .propose("backlog_agent", "add cli layer")
        .expect("propose");
    assert_eq!(id, 1);

    // No skipping steps.
    assert!(matches!(
        ledger.merge(id, "blueprint_agent", BLUEPRINT_V2),
        Err(PmsError::InvalidTransition { .. })
    ));
    assert!(matches!(
        ledger.advance(id, ProposalStatus::Approved, "reviewer_agent"),
        Err(PmsError::InvalidTransition { .. })
    ));

    // Reviewing needs the reviewer role and a different agent than the author.
    assert!(matches!(
        ledger.advance(id, ProposalStatus::Reviewed, "backlog_agent"),
        Err(PmsError::Permission { .. })
    ));
    let own = ledger
        .propose("reviewer_agent", "rename layers")
        .expect("second proposal");
    assert!(matches!(
        ledger.advance(own, ProposalStatus::Reviewed, "reviewer_agent"),
        Err(PmsError::Permission { .. })
    ));

    ledger
        .advance(id, ProposalStatus::Reviewed, "reviewer_agent")
        .expect("review");
    ledger
        .advance(id, ProposalStatus::Approved, "reviewer_agent")
        .expect("approve");

    // Only the owner merges.
    assert!(matches!(
        ledger.merge(id, "reviewer_agent", BLUEPRINT_V2),
        Err(PmsError::Permission { .. })
    ));
    assert!(matches!(
        ledger.advance(id, ProposalStatus::Merged, "reviewer_agent"),
        Err(PmsError::Permission { .. })
    ));
    assert_eq!(
        enforcer.docs().load("blueprint").expect("load").content,
        BLUEPRINT_V1
    );

    let receipt = ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect("merge");
    assert_eq!(receipt.scope, "blueprint");
    assert_eq!(
        enforcer.docs().load("blueprint").expect("load").content,
        BLUEPRINT_V2
    );

    let merged = ledger.get(id).expect("get");
    assert_eq!(merged.status, ProposalStatus::Merged);
    assert_eq!(merged.author, "backlog_agent");
    assert_eq!(merged.updated_by, "blueprint_agent");
    assert_eq!(
        ledger.get(own).expect("get own").status,
        ProposalStatus::Proposed
    );

    // The ledger itself only grew.
    let raw = enforcer
        .docs()
        .load("blueprint_changes")
        .expect("ledger content");
    let rows = parse_rows(&raw.content).expect("parse ledger");
    assert_eq!(rows.len(), 5);
    assert!(matches!(
        ledger.merge(id, "blueprint_agent", BLUEPRINT_V2),
        Err(PmsError::InvalidTransition { .. })
    ));
}

#[test]
fn merge_with_invalid_content_changes_nothing() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let enforcer = Enforcer::open(tmp.path()).expect("open");
    seed_blueprint(&enforcer);
    let ledger = ProposalLedger::new(&enforcer);
    let id = approved(&ledger, "backlog_agent", "drop the heading");

    let err = ledger
        .merge(id, "blueprint_agent", b"no heading here\n")
        .expect_err("structural check");
    assert!(matches!(err, PmsError::Transaction { .. }), "{err:?}");

    assert_eq!(ledger.get(id).expect("get").status, ProposalStatus::Approved);
    let snap = enforcer.docs().load("blueprint").expect("load");
    assert_eq!(snap.content, BLUEPRINT_V1);
    assert_eq!(snap.version, 1);
}

#[test]
fn ledger_failure_during_merge_restores_blueprint() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let seam = Arc::new(LedgerCommitFails::default());
    let enforcer = Enforcer::open_with_fs(tmp.path(), seam.clone()).expect("open");
    seed_blueprint(&enforcer);
    let ledger = ProposalLedger::new(&enforcer);
    let id = approved(&ledger, "backlog_agent", "add cli layer");

    seam.armed.store(true, Ordering::SeqCst);
    let err = ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect_err("ledger commit fails");
    assert!(matches!(err, PmsError::Transaction { .. }), "{err:?}");
    seam.armed.store(false, Ordering::SeqCst);

    let snap = enforcer.docs().load("blueprint").expect("load");
    assert_eq!(snap.content, BLUEPRINT_V1);
    assert_eq!(ledger.get(id).expect("get").status, ProposalStatus::Approved);

    // A retry after the fault clears goes through.
    ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect("merge retry");
    assert_eq!(
        enforcer.docs().load("blueprint").expect("load").content,
        BLUEPRINT_V2
    );
}

#[test]
fn concurrent_proposers_get_distinct_ids() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let enforcer = Enforcer::open(tmp.path()).expect("open");
    let barrier = Barrier::new(4);

    std::thread::scope(|s| {
        for n in 0..4 {
            let enforcer = &enforcer;
            let barrier = &barrier;
            s.spawn(move || {
                let ledger = ProposalLedger::new(enforcer);
                barrier.wait();
                ledger
                    .propose("backlog_agent", &format!("change {}", n))
                    .expect("propose");
            });
        }
    });

    let ledger = ProposalLedger::new(&enforcer);
    let ids: Vec<u64> = ledger
        .list()
        .expect("list")
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[test]
fn unknown_author_cannot_propose() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let enforcer = Enforcer::open(tmp.path()).expect("open");
    let ledger = ProposalLedger::new(&enforcer);

    assert!(matches!(
        ledger.propose("ghost", "anything"),
        Err(PmsError::AgentNotFound(_))
    ));
    assert!(ledger.list().expect("list").is_empty());

    let recent = enforcer.audit().recent();
    assert_eq!(recent.len(), 1);
    assert!(!recent[0].success);
    assert_eq!(recent[0].scope, "blueprint_changes");
}

#[test]
fn owner_can_record_merge_without_content() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let enforcer = Enforcer::open(tmp.path()).expect("open");
    seed_blueprint(&enforcer);
    let ledger = ProposalLedger::new(&enforcer);
    let id = approved(&ledger, "backlog_agent", "applied by hand");

    let p = ledger
        .advance(id, ProposalStatus::Merged, "blueprint_agent")
        .expect("owner advance");
    assert_eq!(p.status, ProposalStatus::Merged);
    assert_eq!(p.updated_by, "blueprint_agent");
    assert_eq!(
        enforcer.docs().load("blueprint").expect("load").content,
        BLUEPRINT_V1
    );
}

#[test]
fn failed_merge_into_unwritten_blueprint_leaves_it_unwritten() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let seam = Arc::new(LedgerCommitFails::default());
    let enforcer = Enforcer::open_with_fs(tmp.path(), seam.clone()).expect("open");
    let ledger = ProposalLedger::new(&enforcer);
    let id = approved(&ledger, "backlog_agent", "first blueprint");

    seam.armed.store(true, Ordering::SeqCst);
    let err = ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect_err("ledger commit fails");
    assert!(matches!(err, PmsError::Transaction { .. }), "{err:?}");
    seam.armed.store(false, Ordering::SeqCst);

    assert!(matches!(
        enforcer.docs().load("blueprint"),
        Err(PmsError::ScopeNotFound(_))
    ));
    assert!(!tmp.path().join("docs/blueprint.md").exists());
    assert!(!tmp.path().join(".pms/meta/blueprint.json").exists());
    assert_eq!(enforcer.docs().current_version("blueprint").expect("version"), 0);
    assert!(enforcer.docs().verify("blueprint").expect("verify").ok);
    assert_eq!(ledger.get(id).expect("get").status, ProposalStatus::Approved);

    let receipt = ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect("merge retry");
    assert_eq!(receipt.version, 1);
    assert_eq!(ledger.get(id).expect("get").status, ProposalStatus::Merged);
}

#[test]
fn failed_merge_is_undone_without_retained_backups() {
    let tmp = tempdir().expect("tempdir");
    setup(tmp.path());
    let index_path = tmp.path().join("memory/index.toml");
    let index = fs::read_to_string(&index_path)
        .expect("read index")
        .replace("dual_rollback_enabled = true", "dual_rollback_enabled = false");
    fs::write(&index_path, index).expect("write index");

    let seam = Arc::new(LedgerCommitFails::default());
    let enforcer = Enforcer::open_with_fs(tmp.path(), seam.clone()).expect("open");
    assert!(!enforcer.docs().index().flags().dual_rollback_enabled);
    seed_blueprint(&enforcer);
    let ledger = ProposalLedger::new(&enforcer);
    let id = approved(&ledger, "backlog_agent", "add cli layer");

    seam.armed.store(true, Ordering::SeqCst);
    assert!(ledger.merge(id, "blueprint_agent", BLUEPRINT_V2).is_err());
    seam.armed.store(false, Ordering::SeqCst);

    let snap = enforcer.docs().load("blueprint").expect("load");
    assert_eq!(snap.content, BLUEPRINT_V1);
    assert_eq!(snap.version, 1);
    let history = enforcer.docs().history("blueprint").expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(ledger.get(id).expect("get").status, ProposalStatus::Approved);

    let receipt = ledger
        .merge(id, "blueprint_agent", BLUEPRINT_V2)
        .expect("merge retry");
    assert_eq!(receipt.version, 2);
}
