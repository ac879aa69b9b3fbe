use anyhow::Result;
use file_kind::cache::CachedDetection;
use file_kind::cancel::{Cancellation, Cancelled};
use file_kind::classification::{CapabilityFlags, Classification};
use file_kind::detector::{DetectorChain, detector_fn, empty_file_detector_fn};
use file_kind::fs::{FileRef, MemoryFileSystem};
use file_kind::matcher::Matcher;
use file_kind::registry::Registry;
use file_kind::removed::RemovedMapping;
use file_kind::resolver::Provenance;
use file_kind::service::{ClassifySource, FileEvent, FileTypeService};
use file_kind::store::{LmdbAttributeStore, MemoryAttributeStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn language(name: &str) -> Classification {
    Classification::builder(name)
        .flags(CapabilityFlags::TEXT | CapabilityFlags::LANGUAGE)
        .build()
}

struct Harness {
    fs: Arc<MemoryFileSystem>,
    sink: Arc<Mutex<Vec<FileRef>>>,
    service: FileTypeService,
}

fn harness(detectors: DetectorChain) -> Harness {
    let fs = Arc::new(MemoryFileSystem::new());
    let sink = Arc::new(Mutex::new(Vec::new()));
    let service = FileTypeService::builder()
        .file_system(fs.clone())
        .store(Arc::new(MemoryAttributeStore::new()))
        .detectors(detectors)
        .reparse_sink(sink.clone())
        .background_redetect(false)
        .build()
        .expect("service builds");
    Harness { fs, sink, service }
}

#[test]
fn scenario_a_plugin_overrides_bundled_until_unregistered() -> Result<()> {
    let h = harness(DetectorChain::new());
    let registry = h.service.registry();
    assert_eq!(registry.classify_by_name("pom.xml").name(), "XML");

    let report = registry.register(
        language("FancyXML"),
        Provenance::plugin("fancy"),
        vec![Matcher::extension("xml")],
    )?;
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].loser, "XML");
    assert!(!report.conflicts[0].approved);
    assert_eq!(registry.classify_by_name("pom.xml").name(), "FancyXML");
    assert!(
        registry
            .removed_mappings()
            .contains(&RemovedMapping::new(Matcher::extension("xml"), "XML", false))
    );

    assert!(registry.unregister("FancyXML"));
    assert_eq!(registry.classify_by_name("pom.xml").name(), "XML");
    Ok(())
}

#[test]
fn scenario_b_nul_bytes_classify_as_binary() {
    let h = harness(DetectorChain::new());
    h.fs.add_file("/w/foo.bin", b"abc\x00def".to_vec());
    let file = h.service.file_ref("/w/foo.bin");

    let outcome = h
        .service
        .classify_file_detailed(&file, &Cancellation::none())
        .expect("not cancelled");
    assert!(outcome.classification.is_unknown());
    assert_eq!(outcome.source, ClassifySource::Content);
    assert_eq!(h.service.cache().peek(&file), CachedDetection::Binary);
}

#[test]
fn scenario_c_empty_file_claimed_by_empty_detector() {
    let detectors = DetectorChain::new().push(empty_file_detector_fn("marker", |input| {
        input
            .file
            .name()
            .starts_with("__init__")
            .then(|| language("PythonPackage"))
    }));
    let h = harness(detectors);
    h.fs.add_file("/w/__init__", Vec::new());
    h.fs.add_file("/w/other", Vec::new());

    let init = h.service.file_ref("/w/__init__");
    assert_eq!(h.service.classify_file(&init).name(), "PythonPackage");
    assert!(h.service.cache().peek(&init).was_detected());

    let other = h.service.file_ref("/w/other");
    assert!(h.service.classify_file(&other).is_unknown());
    assert_eq!(h.service.cache().peek(&other), CachedDetection::Unclassified);
}

#[test]
fn scenario_d_content_change_emits_one_reparse() {
    let h = harness(DetectorChain::new());
    h.fs.add_file("/w/data", b"plain words".to_vec());
    let file = h.service.file_ref("/w/data");
    assert!(h.service.classify_file(&file).is_plain_text());

    h.fs.add_file("/w/data", b"\x00\xff\x00".to_vec());
    for _ in 0..3 {
        h.service.on_file_event(FileEvent::ContentChanged(file.clone()));
    }
    assert_eq!(h.service.queue().pending_len(), 1);
    h.service.queue().drain_once();
    assert_eq!(h.sink.lock().as_slice(), &[file.clone()]);

    h.service.on_file_event(FileEvent::ContentChanged(file.clone()));
    h.service.queue().drain_once();
    assert_eq!(h.sink.lock().len(), 1);
}

#[test]
fn scenario_e_concurrent_equal_rank_registration() {
    for _ in 0..10 {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = ["Left", "Right"]
            .into_iter()
            .map(|name| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register(
                            language(name),
                            Provenance::plugin(name.to_lowercase()),
                            vec![Matcher::extension("both")],
                        )
                        .expect("registers")
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread joins");
        }
        let winner = registry.classify_by_name("x.both");
        assert!(["Left", "Right"].contains(&winner.name()));
        assert_eq!(registry.table_snapshot().entries().filter(|(m, _)| *m == Matcher::extension("both")).count(), 1);
    }
}

#[test]
fn registration_is_idempotent() -> Result<()> {
    let registry = Registry::new();
    let matchers = vec![Matcher::extension("foo"), Matcher::exact("Foofile")];
    registry.register(language("Foo"), Provenance::plugin("p"), matchers.clone())?;
    let before = registry.associations_of("Foo");
    let report = registry.register(language("Foo"), Provenance::plugin("p"), matchers)?;
    assert!(report.conflicts.is_empty());
    assert_eq!(registry.associations_of("Foo"), before);
    Ok(())
}

#[test]
fn generation_bump_invalidates_every_file() {
    let h = harness(DetectorChain::new());
    let files: Vec<_> = (0..5)
        .map(|i| {
            let path = format!("/w/f{i}");
            h.fs.add_file(path.as_str(), b"text".to_vec());
            h.service.file_ref(&path)
        })
        .collect();
    for file in &files {
        h.service.classify_file(file);
    }
    h.service.invalidate_all();
    for file in &files {
        assert_eq!(h.service.cache().peek(file), CachedDetection::Unknown);
        let outcome = h
            .service
            .classify_file_detailed(file, &Cancellation::none())
            .expect("not cancelled");
        assert_eq!(outcome.source, ClassifySource::Content);
    }
}

#[test]
fn detector_panic_is_skipped() {
    let detectors = DetectorChain::new()
        .push(detector_fn("explodes", |_| panic!("detector bug")))
        .push(detector_fn("shout", |input| {
            input
                .text
                .is_some_and(|t| t.starts_with("HELLO"))
                .then(|| language("Shout"))
        }));
    let h = harness(detectors);
    h.fs.add_file("/w/greeting", b"HELLO there".to_vec());
    let file = h.service.file_ref("/w/greeting");
    assert_eq!(h.service.classify_file(&file).name(), "Shout");
}

#[test]
fn cancelled_query_leaves_no_cache_entry() {
    let h = harness(DetectorChain::new());
    h.fs.add_file("/w/slow", b"text".to_vec());
    let file = h.service.file_ref("/w/slow");
    let cancel = Cancellation::new();
    cancel.cancel();
    let result = h.service.classify_file_detailed(&file, &cancel);
    assert_eq!(result, Err(Cancelled));
    assert_eq!(h.service.cache().peek(&file), CachedDetection::Unknown);
    assert_eq!(h.fs.stat_count("/w/slow"), 0);
    assert_eq!(h.fs.read_count("/w/slow"), 0);
}

#[test]
fn content_edited_while_stopped_is_detected_again() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("db.lmdb");
    let fs = Arc::new(MemoryFileSystem::new());
    fs.add_file("/w/data", b"plain words".to_vec());

    let open = || -> Result<FileTypeService> {
        FileTypeService::builder()
            .file_system(fs.clone())
            .store(Arc::new(LmdbAttributeStore::open(db.clone())?))
            .background_redetect(false)
            .build()
    };

    let service = open()?;
    let file = service.file_ref("/w/data");
    assert!(service.classify_file(&file).is_plain_text());
    service.shutdown()?;
    drop(service);

    std::thread::sleep(Duration::from_millis(2));
    fs.add_file("/w/data", b"\x00\x01".to_vec());

    let service = open()?;
    let file = service.file_ref("/w/data");
    let outcome = service
        .classify_file_detailed(&file, &Cancellation::none())
        .expect("not cancelled");
    assert!(outcome.classification.is_unknown());
    assert_eq!(outcome.source, ClassifySource::Content);
    service.shutdown()?;
    Ok(())
}

#[test]
fn unreadable_file_degrades_and_retries_in_background() {
    let fs = Arc::new(MemoryFileSystem::new());
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut config = file_kind::config::EngineConfig::default();
    config.redetect.retry_backoff_ms = 10;
    config.redetect.poll_interval_ms = 5;
    let service = FileTypeService::builder()
        .file_system(fs.clone())
        .reparse_sink(sink.clone())
        .config(config)
        .build()
        .expect("service builds");

    fs.add_file("/w/locked", b"text".to_vec());
    fs.fail_reads("/w/locked", "sharing violation");
    let file = service.file_ref("/w/locked");
    assert!(service.classify_file(&file).is_unknown());
    assert!(!service.cache().peek(&file).was_detected());

    assert_eq!(service.classify_nonblocking(&file), None);
    std::thread::sleep(Duration::from_millis(15));
    fs.clear_failure("/w/locked");
    assert!(service.queue().wait_idle(Duration::from_secs(5)));
    assert!(service.classify_nonblocking(&file).is_some_and(|c| c.is_plain_text()));
    assert_eq!(sink.lock().as_slice(), &[file]);
    service.shutdown().expect("shutdown");
}

#[test]
fn detection_and_registry_state_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("db.lmdb");
    let fs = Arc::new(MemoryFileSystem::new());
    fs.add_file("/w/README", b"read me".to_vec());
    fs.add_file("/w/tool", b"#!/bin/bash\necho hi\n".to_vec());

    {
        let service = FileTypeService::builder()
            .file_system(fs.clone())
            .store(Arc::new(LmdbAttributeStore::open(db.clone())?))
            .buffered(true)
            .background_redetect(false)
            .build()?;
        service.registry().associate(Matcher::extension("cfg"), "TOML")?;
        service
            .registry()
            .disassociate(&Matcher::extension("pyw"), "Python");
        let readme = service.file_ref("/w/README");
        let tool = service.file_ref("/w/tool");
        assert!(service.classify_file(&readme).is_plain_text());
        assert_eq!(service.classify_file(&tool).name(), "Shell");
        service.shutdown()?;
    }

    let service = FileTypeService::builder()
        .file_system(fs.clone())
        .store(Arc::new(LmdbAttributeStore::open(db)?))
        .background_redetect(false)
        .build()?;
    let readme = service.file_ref("/w/README");
    let tool = service.file_ref("/w/tool");
    let cached = service.classify_file_detailed(&readme, &Cancellation::none()).expect("not cancelled");
    assert_eq!(cached.source, ClassifySource::Cache);
    assert_eq!(
        service.cache().read_cached(&tool),
        CachedDetection::Named(service.registry().classify_by_name("x.sh"))
    );
    assert_eq!(fs.read_count("/w/README"), 1);

    assert_eq!(service.registry().classify_by_name("app.cfg").name(), "TOML");
    assert!(service.registry().classify_by_name("gui.pyw").is_unknown());
    assert!(
        service
            .registry()
            .removed_mappings()
            .contains(&RemovedMapping::new(Matcher::extension("pyw"), "Python", true))
    );
    Ok(())
}
