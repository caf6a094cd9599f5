//! Tests for the PHGL file sink, replay, and audit failures.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use phantom_trust::clock::{Clock, ManualClock};
use phantom_trust::config::Config;
use phantom_trust::dnauth::sequence::MatchMode;
use phantom_trust::dnauth::verifier::KdfParams;
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::sink::{decode_frames, JournalStore};
use phantom_trust::geology::{
    replay, verify_chain, AuditEvent, AuditLog, AuditSink, EventKind, FrameSink, NewEvent,
};
use phantom_trust::governor::EvalRequest;
use phantom_trust::qrnet::code::FileClass;

use super::{builder, builder_with_sink, exercise};

/// Sink that fails every call while `broken` is set.
struct FlakySink {
    broken: Arc<AtomicBool>,
    flushes: Arc<AtomicUsize>,
}

impl AuditSink for FlakySink {
    fn append(&mut self, _event: &AuditEvent) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        Ok(())
    }

    fn flush(&mut self, _up_to_seq: u64) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn flaky() -> (FlakySink, Arc<AtomicBool>, Arc<AtomicUsize>) {
    let broken = Arc::new(AtomicBool::new(false));
    let flushes = Arc::new(AtomicUsize::new(0));
    let sink = FlakySink {
        broken: Arc::clone(&broken),
        flushes: Arc::clone(&flushes),
    };
    (sink, broken, flushes)
}

/// In-memory journal whose sync fails while `failing` is set.
#[derive(Clone, Default)]
struct SharedJournal {
    bytes: Arc<Mutex<Vec<u8>>>,
    failing: Arc<AtomicBool>,
}

impl SharedJournal {
    fn subjects(&self) -> Vec<String> {
        let bytes = self.bytes.lock().expect("journal lock").clone();
        let events = decode_frames(&bytes).expect("journal should decode");
        verify_chain(&events).expect("journal chain should hold");
        events.into_iter().map(|e| e.subject).collect()
    }
}

impl Write for SharedJournal {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().expect("journal lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
        }
        Ok(())
    }
}

impl JournalStore for SharedJournal {
    fn byte_len(&mut self) -> io::Result<u64> {
        let len = self.bytes.lock().expect("journal lock").len();
        Ok(u64::try_from(len).expect("length should fit"))
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).expect("length should fit");
        self.bytes.lock().expect("journal lock").truncate(len);
        Ok(())
    }
}

fn log_over(journal: &SharedJournal, durable: bool) -> AuditLog {
    let sink = FrameSink::from_store(Box::new(journal.clone())).expect("header should write");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
    AuditLog::with_sink(clock, Box::new(sink), durable)
}

fn note(subject: &str) -> NewEvent {
    NewEvent::new(EventKind::PolicyChanged, subject)
}

#[test]
fn recovery_never_writes_a_rejected_frame() {
    let journal = SharedJournal::default();
    let log = log_over(&journal, true);
    assert_eq!(log.append(note("a")).expect("append should succeed"), 0);

    journal.failing.store(true, Ordering::SeqCst);
    let err = log
        .append(note("rejected"))
        .expect_err("sync failure should reject the event");
    assert_eq!(err.kind(), ErrorKind::AuditFailure);
    assert_eq!(log.len(), 1);
    assert_eq!(journal.subjects(), ["a"], "store is cut back to the last sync");
    assert!(!log.recover(), "store still fails");

    journal.failing.store(false, Ordering::SeqCst);
    assert!(log.recover());
    assert_eq!(journal.subjects(), ["a"]);
    assert_eq!(log.append(note("b")).expect("append should succeed"), 1);
    assert_eq!(journal.subjects(), ["a", "b"]);
    assert!(log.verify_chain().is_ok());
}

#[test]
fn failed_flush_keeps_acknowledged_frames_for_retry() {
    let journal = SharedJournal::default();
    let log = log_over(&journal, false);
    log.append(note("a")).expect("append should succeed");
    log.append(note("b")).expect("append should succeed");
    assert!(journal.subjects().is_empty(), "frames are staged until flush");

    journal.failing.store(true, Ordering::SeqCst);
    let err = log.flush_all().expect_err("flush should fail");
    assert_eq!(err.kind(), ErrorKind::AuditFailure);
    assert!(journal.subjects().is_empty());

    journal.failing.store(false, Ordering::SeqCst);
    assert!(log.recover());
    assert_eq!(journal.subjects(), ["a", "b"]);
    assert_eq!(log.append(note("c")).expect("append should succeed"), 2);
    log.flush_all().expect("flush should succeed");
    assert_eq!(journal.subjects(), ["a", "b", "c"]);
}

#[tokio::test]
async fn journal_file_replays_and_reopens() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("audit.phgl");
    let mut config = Config::default();
    config.audit.path = Some(path.clone());

    let head = {
        let core = builder(config.clone()).build().expect("core should build");
        exercise(&core).await;
        core.flush().expect("flush should succeed");
        core.audit().head_hash()
    };

    let replayed = replay(&path).expect("journal should replay");
    assert_eq!(replayed.len(), 4);
    assert_eq!(replayed.last().map(AuditEvent::content_hash), Some(head));

    let core = builder(config).build().expect("core should reopen");
    assert_eq!(core.audit().len(), 4);
    assert_eq!(core.audit().head_hash(), head);
    let eval = core
        .governor()
        .evaluate(EvalRequest::new("uname(&v)", "again"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.audit_seq, 4, "sequence continues after reopen");
    core.flush().expect("flush should succeed");

    let replayed = replay(&path).expect("journal should replay");
    assert_eq!(replayed.len(), 5);
}

#[tokio::test]
async fn corrupted_journal_is_rejected() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("audit.phgl");
    let mut config = Config::default();
    config.audit.path = Some(path.clone());
    {
        let core = builder(config.clone()).build().expect("core should build");
        exercise(&core).await;
        core.flush().expect("flush should succeed");
    }

    let mut bytes = std::fs::read(&path).expect("journal should be readable");
    let at = bytes
        .windows(5)
        .position(|w| w == b"alice")
        .expect("first event names alice");
    bytes[at] = b'b';
    std::fs::write(&path, &bytes).expect("journal should be writable");

    let err = replay(&path).expect_err("edited journal should fail");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(builder(config).build().is_err(), "core refuses a broken journal");

    let torn = decode_frames(&bytes[..bytes.len() - 3]).expect_err("torn frame should fail");
    assert_eq!(torn.kind(), ErrorKind::InvalidInput);
    assert!(decode_frames(b"NOPE\0\0\0\x01").is_err());
}

#[tokio::test]
async fn failed_append_leaves_every_component_unchanged() {
    let (sink, broken, _flushes) = flaky();
    let core = builder_with_sink(Box::new(sink)).build().expect("core should build");
    core.dnauth()
        .register("alice", "ATGCATGCATGC", MatchMode::Exact, KdfParams { iterations: 16 })
        .expect("register should succeed");
    let before = core.audit().len();

    broken.store(true, Ordering::SeqCst);
    let err = core
        .governor()
        .evaluate(EvalRequest::new("uname(&u)", "info"))
        .await
        .expect_err("evaluation cannot commit without the log");
    assert_eq!(err.kind(), ErrorKind::AuditFailure);
    assert_eq!(core.governor().stats().evaluations, 0);
    assert!(core.governor().history(0, 10).is_empty());
    assert_eq!(core.governor().cache_stats().len, 0);
    assert!(!core.audit().is_healthy());

    let err = core
        .dnauth()
        .register("bob", "ATGCATGCATGC", MatchMode::Exact, KdfParams { iterations: 16 })
        .expect_err("registration cannot commit without the log");
    assert_eq!(err.kind(), ErrorKind::AuditFailure);
    assert_eq!(
        core.dnauth().lookup("bob").map_err(|e| e.kind()).err(),
        Some(ErrorKind::NotFound)
    );

    let err = core
        .qrnet()
        .create_code_as("alice", "/geo/a", b"hello", FileClass::User)
        .expect_err("creation cannot commit without the log");
    assert_eq!(err.kind(), ErrorKind::AuditFailure);
    assert_eq!(core.qrnet().stats().codes, 0);
    assert_eq!(core.qrnet().stats().content_items, 0);
    assert_eq!(core.governor().state_version(), 1);
    assert!(core.governor().set_strict(true).is_err());
    assert_eq!(core.governor().state_version(), 1);
    assert_eq!(core.audit().len(), before);

    assert!(!core.audit().recover(), "sink is still broken");
    broken.store(false, Ordering::SeqCst);
    assert!(core.audit().recover());
    core.qrnet()
        .create_code_as("alice", "/geo/a", b"hello", FileClass::User)
        .expect("creation should succeed once the log recovers");
    assert_eq!(core.qrnet().stats().codes, 1);
    assert!(core.audit().verify_chain().is_ok());
}

#[tokio::test]
async fn durable_logs_flush_every_append() {
    let (sink, _broken, flushes) = flaky();
    let mut config = Config::default();
    config.audit.durable = true;
    let core = builder(config)
        .sink(Box::new(sink))
        .build()
        .expect("core should build");
    exercise(&core).await;
    assert_eq!(flushes.load(Ordering::SeqCst), 4);
    core.flush().expect("nothing left to flush");
    assert_eq!(flushes.load(Ordering::SeqCst), 4);
}
