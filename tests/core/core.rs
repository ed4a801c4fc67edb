use pms::core::audit::{self, AuditOp};
use pms::core::document::{DocumentStore, WriteMode};
use pms::core::enforcer::Enforcer;
use pms::core::error::PmsError;
use pms::core::integrity::content_hash;
use pms::core::lock::ScopeLock;
use pms::core::scaffold::{ScaffoldOptions, bootstrap};
use pms::core::transaction::{DiskFs, StagingFs};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tempfile::tempdir;

const INDEX: &str = r##"
[scopes.status]
path = "docs/status.md"

[scopes.blueprint]
path = "docs/blueprint.md"
integrity_checked = true
protected = true
required_sections = ["# Blueprint"]

[scopes.backlog_f1]
path = "docs/backlog/backlog_f1.yaml"
kind = "structured"
required_sections = ["fase"]

[scopes.backlog_f2]
path = "docs/backlog/backlog_f2.yaml"
kind = "structured"
"##;

fn write_agent(root: &Path, id: &str, body: &str) {
    let dir = root.join("agents");
    fs::create_dir_all(&dir).expect("agents dir");
    fs::write(dir.join(format!("{}.toml", id)), body).expect("write profile");
}

fn project(root: &Path) {
    fs::create_dir_all(root.join("memory")).expect("memory dir");
    fs::write(root.join("memory/index.toml"), INDEX).expect("write index");
    write_agent(
        root,
        "A",
        "agent_id = \"A\"\n[scopes]\nread = [\"status\"]\nwrite = [\"backlog_f*\"]\n",
    );
    write_agent(
        root,
        "architect",
        "agent_id = \"architect\"\nroles = [\"owner\"]\n[scopes]\nread = [\"*\"]\nwrite = [\"blueprint\", \"status\"]\nmode = \"dual\"\n",
    );
    write_agent(
        root,
        "viewer",
        "agent_id = \"viewer\"\n[scopes]\nread = [\"*\"]\nwrite = [\"status\"]\nmode = \"read_only\"\n",
    );
}

fn set_config(root: &Path, body: &str) {
    fs::create_dir_all(root.join(".pms")).expect("state dir");
    fs::write(root.join(".pms/config.toml"), body).expect("write config");
}

/// Commit path that fails with a full disk once armed.
#[derive(Debug, Default)]
struct FullDisk {
    armed: AtomicBool,
    fail_staging: bool,
}

impl StagingFs for FullDisk {
    fn write_staged(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if self.fail_staging && self.armed.load(Ordering::SeqCst) {
            // Leave a partial file behind, like an interrupted write.
            fs::write(path, &bytes[..bytes.len() / 2])?;
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        DiskFs.write_staged(path, bytes)
    }

    fn replace(&self, staged: &Path, target: &Path) -> io::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        DiskFs.replace(staged, target)
    }
}

/// Fails replacing a metadata sidecar once armed, after the content has landed.
#[derive(Debug, Default)]
struct SidecarFails {
    armed: AtomicBool,
}

impl StagingFs for SidecarFails {
    fn write_staged(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        DiskFs.write_staged(path, bytes)
    }

    fn replace(&self, staged: &Path, target: &Path) -> io::Result<()> {
        let is_sidecar = target
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == "meta");
        if is_sidecar && self.armed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        DiskFs.replace(staged, target)
    }
}

fn staging_is_empty(root: &Path) -> bool {
    fs::read_dir(root.join(".pms/staging"))
        .map(|d| d.count() == 0)
        .unwrap_or(true)
}

#[test]
fn disk_full_during_commit_leaves_blueprint_intact() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let fs_seam = Arc::new(FullDisk::default());
    let docs = DocumentStore::open_with_fs(root, fs_seam.clone()).expect("open");

    docs.save("blueprint", b"# Blueprint\nv1\n", WriteMode::Dual)
        .expect("first save");
    let before = docs.load("blueprint").expect("load before");

    fs_seam.armed.store(true, Ordering::SeqCst);
    let err = docs
        .save("blueprint", b"# Blueprint\nv2\n", WriteMode::Dual)
        .expect_err("commit must fail");
    assert!(matches!(err, PmsError::Transaction { .. }), "{err:?}");
    fs_seam.armed.store(false, Ordering::SeqCst);

    let after = docs.load("blueprint").expect("load after");
    assert_eq!(after.content, before.content);
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.version, 1);
    assert!(staging_is_empty(root));
    assert!(!ScopeLock::is_held(docs.store(), "blueprint"));
}

#[test]
fn failed_metadata_update_leaves_content_and_hash_in_step() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let fs_seam = Arc::new(SidecarFails::default());
    let docs = DocumentStore::open_with_fs(root, fs_seam.clone()).expect("open");
    docs.save("blueprint", b"# Blueprint\nv1\n", WriteMode::Dual)
        .expect("first save");
    docs.save("status", b"green", WriteMode::Single)
        .expect("first status");

    fs_seam.armed.store(true, Ordering::SeqCst);
    let err = docs
        .save("blueprint", b"# Blueprint\nv2\n", WriteMode::Dual)
        .expect_err("sidecar write fails");
    assert!(matches!(err, PmsError::Transaction { .. }), "{err:?}");
    assert!(matches!(
        docs.save("status", b"red", WriteMode::Single),
        Err(PmsError::Transaction { .. })
    ));
    fs_seam.armed.store(false, Ordering::SeqCst);

    let snap = docs.load("blueprint").expect("load after failure");
    assert_eq!(snap.content, b"# Blueprint\nv1\n");
    assert_eq!(snap.version, 1);
    assert!(docs.verify("blueprint").expect("verify").ok);
    assert_eq!(fs::read(root.join("docs/status.md")).expect("status"), b"green");

    // A fresh store agrees.
    let reopened = DocumentStore::open(root).expect("reopen");
    assert_eq!(reopened.load("blueprint").expect("reload").version, 1);
    let receipt = reopened
        .save("blueprint", b"# Blueprint\nv2\n", WriteMode::Dual)
        .expect("retry");
    assert_eq!(receipt.version, 2);
}

#[test]
fn interrupted_staging_write_leaves_target_and_staging_clean() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let fs_seam = Arc::new(FullDisk {
        armed: AtomicBool::new(false),
        fail_staging: true,
    });
    let docs = DocumentStore::open_with_fs(root, fs_seam.clone()).expect("open");
    docs.save("blueprint", b"# Blueprint\nkeep\n", WriteMode::Dual)
        .expect("first save");

    fs_seam.armed.store(true, Ordering::SeqCst);
    assert!(docs
        .save("blueprint", b"# Blueprint\nlost\n", WriteMode::Dual)
        .is_err());

    let bytes = fs::read(root.join("docs/blueprint.md")).expect("read target");
    assert_eq!(bytes, b"# Blueprint\nkeep\n");
    assert!(staging_is_empty(root));
}

#[test]
fn failed_structural_validation_is_a_transaction_error() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let docs = DocumentStore::open(root).expect("open");
    docs.save("backlog_f1", b"fase: 1\n", WriteMode::Dual)
        .expect("valid save");

    let err = docs
        .save("backlog_f1", b"historias: []\n", WriteMode::Dual)
        .expect_err("missing key");
    assert!(matches!(err, PmsError::Transaction { .. }));
    assert!(err.to_string().contains("fase"));

    // In-place writes are checked too.
    assert!(matches!(
        docs.save("backlog_f1", b"historias: []\n", WriteMode::Single),
        Err(PmsError::Transaction { .. })
    ));
    let snap = docs.load("backlog_f1").expect("load");
    assert_eq!(snap.content, b"fase: 1\n");
    assert_eq!(snap.version, 1);
}

#[test]
fn integrity_round_trip_and_external_tampering() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let docs = DocumentStore::open(root).expect("open");

    let content = b"# Blueprint\n\nlayers: core, plugins\n";
    let receipt = docs
        .save("blueprint", content, WriteMode::Dual)
        .expect("save");
    let snap = docs.load("blueprint").expect("load");
    assert_eq!(snap.content, content);
    assert_eq!(snap.content_hash, content_hash(content));
    assert_eq!(snap.content_hash, receipt.content_hash);

    fs::write(root.join("docs/blueprint.md"), b"# Blueprint\n\nedited by hand\n").expect("tamper");
    match docs.load("blueprint") {
        Err(PmsError::Integrity {
            scope,
            expected,
            actual,
        }) => {
            assert_eq!(scope, "blueprint");
            assert_eq!(expected, receipt.content_hash);
            assert_ne!(actual, expected);
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }

    // A fresh store sees the same recorded hash.
    let reopened = DocumentStore::open(root).expect("reopen");
    assert!(matches!(
        reopened.load("blueprint"),
        Err(PmsError::Integrity { .. })
    ));
    assert!(!reopened.verify("blueprint").expect("verify").ok);
}

#[test]
fn declared_hash_in_index_guards_unversioned_content() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    fs::create_dir_all(root.join("memory")).expect("memory dir");
    fs::create_dir_all(root.join("docs")).expect("docs dir");
    fs::write(root.join("docs/charter.md"), b"charter v1").expect("write doc");
    fs::write(
        root.join("memory/index.toml"),
        format!(
            "[scopes.charter]\npath = \"docs/charter.md\"\nintegrity_checked = true\nexpected_hash = \"{}\"\n",
            content_hash(b"charter v0")
        ),
    )
    .expect("write index");

    let docs = DocumentStore::open(root).expect("open");
    assert!(matches!(
        docs.load("charter"),
        Err(PmsError::Integrity { .. })
    ));

    // Policy `never` turns the check off.
    set_config(root, "integrity_policy = \"never\"\n");
    let docs = DocumentStore::open(root).expect("reopen");
    assert_eq!(docs.load("charter").expect("load").version, 0);
}

#[test]
fn undeclared_and_unwritten_scopes_are_not_found() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let docs = DocumentStore::open(root).expect("open");
    assert!(matches!(
        docs.load("roadmap"),
        Err(PmsError::ScopeNotFound(_))
    ));
    assert!(matches!(
        docs.save("roadmap", b"x", WriteMode::Dual),
        Err(PmsError::ScopeNotFound(_))
    ));
    assert!(matches!(
        docs.load("status"),
        Err(PmsError::ScopeNotFound(_))
    ));
    assert!(!root.join("docs/roadmap.md").exists());
}

#[test]
fn wildcard_writer_is_denied_on_blueprint_with_one_audit_record() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let enforcer = Enforcer::open(root).expect("open");

    enforcer
        .agent_save("A", "backlog_f2", b"fase: 2\n")
        .expect("wildcard grant");
    let err = enforcer
        .agent_save("A", "blueprint", b"# Blueprint\nhijack\n")
        .expect_err("blueprint is not granted");
    assert!(matches!(err, PmsError::Permission { .. }));
    assert!(!root.join("docs/blueprint.md").exists());

    let records = audit::read_log(&root.join(".pms/audit.events.jsonl")).expect("read log");
    let denied: Vec<_> = records.iter().filter(|r| r.scope == "blueprint").collect();
    assert_eq!(denied.len(), 1);
    assert!(!denied[0].success);
    assert_eq!(denied[0].agent_id, "A");
    assert_eq!(denied[0].operation, AuditOp::Write);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.session_id == enforcer.session_id()));
}

#[test]
fn read_only_profile_mode_rejects_writes() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let enforcer = Enforcer::open(root).expect("open");

    let err = enforcer
        .agent_save("viewer", "status", b"nope")
        .expect_err("read_only");
    assert!(matches!(err, PmsError::Transaction { .. }));
    assert!(!root.join("docs/status.md").exists());

    let recent = enforcer.audit().recent();
    assert_eq!(recent.len(), 1);
    assert!(recent[0].reason.as_deref().unwrap_or("").starts_with("transaction"));
}

#[test]
fn second_writer_waits_for_first_commit() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let docs = Arc::new(DocumentStore::open(root).expect("open"));
    let barrier = Arc::new(Barrier::new(2));

    let d1 = Arc::clone(&docs);
    let gate1 = Arc::clone(&barrier);
    let first = std::thread::spawn(move || {
        let lock = d1.lock("status").expect("first lock");
        gate1.wait();
        std::thread::sleep(Duration::from_millis(200));
        d1.save_locked(&lock, b"first", WriteMode::Single)
            .expect("first save");
        Instant::now()
    });

    let d2 = Arc::clone(&docs);
    let gate2 = Arc::clone(&barrier);
    let second = std::thread::spawn(move || {
        gate2.wait();
        let started = Instant::now();
        d2.save("status", b"second", WriteMode::Single)
            .expect("second save");
        (started, Instant::now())
    });

    let first_done = first.join().expect("first thread");
    let (second_started, second_done) = second.join().expect("second thread");
    assert!(second_done >= first_done);
    assert!(second_done.duration_since(second_started) >= Duration::from_millis(150));

    let snap = docs.load("status").expect("load");
    assert_eq!(snap.content, b"second");
    assert_eq!(snap.version, 2);
}

#[test]
fn lock_wait_is_bounded_and_retryable() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    set_config(root, "lock_timeout_ms = 100\n");
    let docs = DocumentStore::open(root).expect("open");

    let _held = docs.lock("status").expect("hold");
    let started = Instant::now();
    let err = docs
        .save("status", b"late", WriteMode::Single)
        .expect_err("timeout");
    assert!(err.is_retryable());
    assert!(matches!(err, PmsError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Other scopes are unaffected.
    docs.save("backlog_f2", b"fase: 1\n", WriteMode::Single)
        .expect("independent scope");
}

#[cfg(target_os = "linux")]
#[test]
fn lock_left_by_dead_process_is_reclaimed() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    set_config(root, "lock_timeout_ms = 100\n");
    fs::create_dir_all(root.join(".pms/locks")).expect("locks dir");
    fs::write(root.join(".pms/locks/status.lock"), "4194305\n").expect("stale lock");

    let docs = DocumentStore::open(root).expect("open");
    docs.save("status", b"after crash", WriteMode::Single)
        .expect("reclaimed");
}

#[test]
fn concurrent_readers_never_see_partial_content() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let docs = Arc::new(DocumentStore::open(root).expect("open"));
    let a = vec![b'a'; 64 * 1024];
    let b = vec![b'b'; 64 * 1024];
    docs.save("status", &a, WriteMode::Dual).expect("seed");

    let writer_docs = Arc::clone(&docs);
    let writer = std::thread::spawn(move || {
        for i in 0..40 {
            let body = if i % 2 == 0 { &b } else { &a };
            writer_docs
                .save("status", body, WriteMode::Dual)
                .expect("writer save");
        }
    });

    for _ in 0..200 {
        let snap = docs.load("status").expect("reader load");
        assert_eq!(snap.content.len(), 64 * 1024);
        let first = snap.content[0];
        assert!(snap.content.iter().all(|&c| c == first));
    }
    writer.join().expect("writer thread");
}

#[test]
fn rollback_through_facade_is_audited_as_rollback() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    let enforcer = Enforcer::open(root).expect("open");

    enforcer
        .agent_save("architect", "blueprint", b"# Blueprint\nv1\n")
        .expect("v1");
    enforcer
        .agent_save("architect", "blueprint", b"# Blueprint\nv2\n")
        .expect("v2");
    let history = enforcer.docs().history("blueprint").expect("history");
    assert_eq!(
        history.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![1, 2]
    );

    assert!(matches!(
        enforcer.agent_rollback("A", "blueprint", 1),
        Err(PmsError::Permission { .. })
    ));
    let receipt = enforcer
        .agent_rollback("architect", "blueprint", 1)
        .expect("rollback");
    assert_eq!(receipt.version, 3);
    assert_eq!(
        enforcer.docs().load("blueprint").expect("load").content,
        b"# Blueprint\nv1\n"
    );

    let ops: Vec<(String, AuditOp, bool)> = enforcer
        .audit()
        .recent()
        .into_iter()
        .map(|r| (r.agent_id, r.operation, r.success))
        .collect();
    assert_eq!(
        ops,
        vec![
            ("architect".to_string(), AuditOp::Write, true),
            ("architect".to_string(), AuditOp::Write, true),
            ("A".to_string(), AuditOp::Rollback, false),
            ("architect".to_string(), AuditOp::Rollback, true),
        ]
    );
}

#[test]
fn audit_sink_failure_does_not_block_saves() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    project(root);
    // A directory at the log path makes every append fail.
    fs::create_dir_all(root.join(".pms/audit.events.jsonl")).expect("block audit path");
    let enforcer = Enforcer::open(root).expect("open");

    enforcer
        .agent_save("A", "backlog_f2", b"fase: 3\n")
        .expect("save despite audit failure");
    assert_eq!(enforcer.audit().failure_count(), 1);
    assert_eq!(enforcer.audit().recent().len(), 1);
}

#[test]
fn bootstrap_then_operate() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    bootstrap(&ScaffoldOptions {
        target_dir: root.to_path_buf(),
        force: false,
        dry_run: false,
    })
    .expect("bootstrap");

    let enforcer = Enforcer::open(root).expect("open");
    enforcer
        .agent_save("status_agent", "project_status", b"# Status\n")
        .expect("status write");
    // Non-strict profile: read outside grants is advisory.
    enforcer
        .agent_save("blueprint_agent", "blueprint", b"# Blueprint\n")
        .expect("owner write");
    let snap = enforcer
        .agent_load("status_agent", "blueprint")
        .expect("advisory read");
    assert_eq!(snap.content, b"# Blueprint\n");

    let summary = enforcer.audit().violation_summary();
    assert_eq!(summary.total_violations, 1);
    assert_eq!(summary.agents_with_violations, vec!["status_agent"]);

    let reports = enforcer.docs().verify_all().expect("verify all");
    assert!(reports.iter().all(|r| r.ok), "{reports:?}");
}
