//! End-to-end build flow tests.
//!
//! These drive the engine through real on-disk module trees with a
//! recording backend in place of a container engine, so the full path from
//! manifest resolution through scheduling, digesting, and caching is
//! exercised without a daemon.

use kiln::backend::{Backend, BuildRequest};
use kiln::{BuildOptions, BuildStatus, DigestCache, Engine, KilnError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Backend that records every build instead of talking to an engine.
#[derive(Default)]
struct RecordingBackend {
    builds: Mutex<Vec<RecordedBuild>>,
    /// Builds whose image tag contains one of these fail with the given
    /// message.
    fail_when: Mutex<Vec<(String, String)>>,
    /// Artificial latency, for claim races.
    delay: Option<Duration>,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

#[derive(Clone)]
struct RecordedBuild {
    image: String,
    recipe: String,
    archive: Vec<u8>,
}

impl RecordingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Default::default() })
    }

    fn fail_for(&self, needle: &str, message: &str) {
        self.fail_when.lock().unwrap().push((needle.to_string(), message.to_string()));
    }

    fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.lock().unwrap().clone()
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn build(&self, context_tar: &[u8], recipe_path: &str, request: &BuildRequest) -> Result<(), KilnError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.builds.lock().unwrap().push(RecordedBuild {
            image: request.image.clone(),
            recipe: recipe_path.to_string(),
            archive: context_tar.to_vec(),
        });
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        for (needle, message) in self.fail_when.lock().unwrap().iter() {
            if request.image.contains(needle.as_str()) {
                return Err(KilnError::Backend { message: message.clone() });
            }
        }
        Ok(())
    }
}

fn write_module(dir: &Path, manifest: &str, dockerfile: Option<&str>) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("kiln.yaml"), manifest).unwrap();
    if let Some(content) = dockerfile {
        fs::write(dir.join("Dockerfile"), content).unwrap();
    }
}

fn basic_project(name: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        &format!("build:\n  name: test/{}\n", name),
        Some("FROM alpine:3.11.6\nCMD [\"sh\", \"-c\", \"echo Hello\"]\n"),
    );
    dir
}

fn engine_with(backend: Arc<RecordingBackend>, cache_root: &Path) -> Engine {
    Engine::with_config(
        backend,
        2,
        DigestCache::with_root(cache_root.to_path_buf()),
    )
}

fn options() -> BuildOptions {
    BuildOptions { skip_hooks: true, ..Default::default() }
}

fn archive_paths(archive: &[u8]) -> Vec<String> {
    let mut tar = tar::Archive::new(archive);
    tar.entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn test_basic_build_then_cache_hit() {
    let project = basic_project("basic");
    let cache_root = TempDir::new().unwrap();

    let backend = RecordingBackend::new();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(project.path().join("kiln.yaml")).unwrap();
    assert_eq!(module.status(), BuildStatus::Pending);
    engine.build(&module, &options()).unwrap();
    assert_eq!(module.status(), BuildStatus::Succeeded);
    assert_eq!(backend.build_count(), 1);
    assert_eq!(backend.builds()[0].image, "test/basic:latest");
    assert_eq!(backend.builds()[0].recipe, "Dockerfile");

    // The digest record landed in the cache root.
    assert_eq!(fs::read_dir(cache_root.path()).unwrap().count(), 1);

    // A fresh engine run with no file changes performs no backend work.
    let backend2 = RecordingBackend::new();
    let engine2 = engine_with(backend2.clone(), cache_root.path());
    let module2 = engine2.get_module(project.path().join("kiln.yaml")).unwrap();
    engine2.build(&module2, &options()).unwrap();
    assert_eq!(module2.status(), BuildStatus::Succeeded);
    assert_eq!(backend2.build_count(), 0);
}

#[test]
fn test_no_cache_forces_rebuild() {
    let project = basic_project("nocache");
    let cache_root = TempDir::new().unwrap();

    let backend = RecordingBackend::new();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(project.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();

    let backend2 = RecordingBackend::new();
    let engine2 = engine_with(backend2.clone(), cache_root.path());
    let module2 = engine2.get_module(project.path().join("kiln.yaml")).unwrap();
    let opts = BuildOptions { no_cache: true, ..options() };
    engine2.build(&module2, &opts).unwrap();
    assert_eq!(backend2.build_count(), 1);
}

#[test]
fn test_missing_dockerfile_fails_validation() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "build:\n  name: test/missing\n", None);
    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let err = engine.get_module(dir.path().join("kiln.yaml")).unwrap_err();
    assert!(err.to_string().contains("missing Dockerfile"), "got: {err}");
    assert_eq!(backend.build_count(), 0);
}

#[test]
fn test_missing_image_name() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "build: {}\n", Some("FROM alpine:3.11.6\n"));
    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend, cache_root.path());
    let err = engine.get_module(dir.path().join("kiln.yaml")).unwrap_err();
    assert!(matches!(err, KilnError::MissingImageName));
}

#[test]
fn test_failing_dependency_aggregated() {
    let root = TempDir::new().unwrap();
    write_module(
        root.path(),
        "dependencies: [\"dep\"]\nbuild:\n  name: test/root\n",
        Some("FROM alpine:3.11.6\n"),
    );
    write_module(
        &root.path().join("dep"),
        "build:\n  name: test/root-dep\n",
        Some("FROM alpine:3.11.6\nRUN exit 1\n"),
    );

    let backend = RecordingBackend::new();
    backend.fail_for(
        "root-dep",
        "The command '/bin/sh -c exit 1' returned a non-zero code: 1",
    );
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    let err = engine.build(&module, &options()).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("dependency 'dep':"), "got: {message}");
    assert!(message.contains("returned a non-zero code: 1"), "got: {message}");

    assert_eq!(module.status(), BuildStatus::Failed);
    assert_eq!(module.dependencies()[0].status(), BuildStatus::Failed);
    // The root module never reached the backend.
    assert_eq!(backend.build_count(), 1);
}

#[test]
fn test_dockerignored_file_missing_from_archive() {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "build:\n  name: test/ignored\n",
        Some("FROM alpine:3.11.6\nCOPY foo.txt .\nCOPY bar.txt .\n"),
    );
    fs::write(dir.path().join("foo.txt"), "keep").unwrap();
    fs::write(dir.path().join("bar.txt"), "drop").unwrap();
    fs::write(dir.path().join(".dockerignore"), "bar.txt\n").unwrap();

    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();

    let paths = archive_paths(&backend.builds()[0].archive);
    assert!(paths.contains(&"foo.txt".to_string()));
    assert!(paths.contains(&"Dockerfile".to_string()));
    assert!(
        !paths.contains(&"bar.txt".to_string()),
        "ignored file leaked into the archive: {paths:?}"
    );
}

#[test]
fn test_unrelated_edit_is_still_a_cache_hit() {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "build:\n  name: test/unrelated\n",
        Some("FROM alpine:3.11.6\nCOPY foo.txt .\n"),
    );
    fs::write(dir.path().join("foo.txt"), "referenced").unwrap();
    fs::write(dir.path().join("notes.txt"), "not referenced").unwrap();

    let cache_root = TempDir::new().unwrap();
    let backend = RecordingBackend::new();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();
    assert_eq!(backend.build_count(), 1);

    // Edit a file no copy directive reaches, then rebuild from scratch.
    fs::write(dir.path().join("notes.txt"), "edited freely").unwrap();
    let backend2 = RecordingBackend::new();
    let engine2 = engine_with(backend2.clone(), cache_root.path());
    let module2 = engine2.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine2.build(&module2, &options()).unwrap();
    assert_eq!(backend2.build_count(), 0, "unrelated edit must not invalidate the digest");

    // Editing the referenced file does invalidate.
    fs::write(dir.path().join("foo.txt"), "changed").unwrap();
    let backend3 = RecordingBackend::new();
    let engine3 = engine_with(backend3.clone(), cache_root.path());
    let module3 = engine3.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine3.build(&module3, &options()).unwrap();
    assert_eq!(backend3.build_count(), 1);
}

#[test]
fn test_recipe_edit_invalidates_cache() {
    let project = basic_project("recipe-edit");
    let cache_root = TempDir::new().unwrap();

    let backend = RecordingBackend::new();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(project.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();

    fs::write(
        project.path().join("Dockerfile"),
        "FROM alpine:3.11.6\nCMD [\"sh\", \"-c\", \"echo Changed\"]\n",
    )
    .unwrap();
    let backend2 = RecordingBackend::new();
    let engine2 = engine_with(backend2.clone(), cache_root.path());
    let module2 = engine2.get_module(project.path().join("kiln.yaml")).unwrap();
    engine2.build(&module2, &options()).unwrap();
    assert_eq!(backend2.build_count(), 1, "recipe edits must invalidate the digest");
}

#[test]
fn test_concurrent_builds_share_one_backend_call() {
    let project = basic_project("concurrent");
    let cache_root = TempDir::new().unwrap();
    let backend = RecordingBackend::with_delay(Duration::from_millis(50));
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(project.path().join("kiln.yaml")).unwrap();

    let mut threads = Vec::new();
    for _ in 0..6 {
        let engine = engine.clone();
        let module = Arc::clone(&module);
        threads.push(std::thread::spawn(move || engine.build(&module, &options())));
    }
    for thread in threads {
        thread.join().unwrap().unwrap();
    }
    assert_eq!(backend.build_count(), 1, "exactly one thread may own the build");
    assert_eq!(module.status(), BuildStatus::Succeeded);
}

#[test]
fn test_diamond_dependency_builds_once() {
    let root = TempDir::new().unwrap();
    write_module(root.path(), "dependencies: [\"a\", \"b\"]\n", None);
    write_module(&root.path().join("a"), "dependencies: [\"../shared\"]\n", None);
    write_module(&root.path().join("b"), "dependencies: [\"../shared\"]\n", None);
    write_module(
        &root.path().join("shared"),
        "build:\n  name: test/diamond-shared\n",
        Some("FROM alpine:3.11.6\n"),
    );

    let backend = RecordingBackend::with_delay(Duration::from_millis(20));
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();
    assert_eq!(backend.build_count(), 1, "shared dependency must build once");
    assert_eq!(module.status(), BuildStatus::Succeeded);
}

#[test]
fn test_dependencies_complete_before_dependent() {
    let root = TempDir::new().unwrap();
    write_module(
        root.path(),
        "dependencies: [\"dep\"]\nbuild:\n  name: test/ordered-root\n",
        Some("FROM test/ordered-dep:latest\n"),
    );
    write_module(
        &root.path().join("dep"),
        "build:\n  name: test/ordered-dep\n",
        Some("FROM alpine:3.11.6\n"),
    );

    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();

    let images: Vec<String> = backend.builds().iter().map(|b| b.image.clone()).collect();
    assert_eq!(images, vec!["test/ordered-dep:latest", "test/ordered-root:latest"]);
}

#[test]
fn test_aggregation_module_without_build_block() {
    let root = TempDir::new().unwrap();
    write_module(root.path(), "dependencies: [\"dep\"]\n", None);
    write_module(
        &root.path().join("dep"),
        "build:\n  name: test/agg-dep\n",
        Some("FROM alpine:3.11.6\n"),
    );

    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();
    assert_eq!(module.status(), BuildStatus::Succeeded);
    assert_eq!(backend.build_count(), 1);
}

#[test]
fn test_multiple_failing_dependencies_reported_in_order() {
    let root = TempDir::new().unwrap();
    write_module(root.path(), "dependencies: [\"a\", \"b\"]\n", None);
    write_module(
        &root.path().join("a"),
        "build:\n  name: test/multi-a\n",
        Some("FROM alpine:3.11.6\n"),
    );
    write_module(
        &root.path().join("b"),
        "build:\n  name: test/multi-b\n",
        Some("FROM alpine:3.11.6\n"),
    );

    let backend = RecordingBackend::new();
    backend.fail_for("multi-a", "a exploded");
    backend.fail_for("multi-b", "b exploded");
    let cache_root = TempDir::new().unwrap();
    let engine = engine_with(backend, cache_root.path());
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    let message = engine.build(&module, &options()).unwrap_err().to_string();
    let pos_a = message.find("dependency 'a': a exploded").expect("entry for a");
    let pos_b = message.find("dependency 'b': b exploded").expect("entry for b");
    assert!(pos_a < pos_b, "failures must keep declared order: {message}");
}

#[test]
fn test_hooks_run_only_when_backend_builds() {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "build:\n  name: test/hooks\n  before: [\"echo pre >> hooks.log\"]\n  after: [\"echo post >> hooks.log\"]\n",
        Some("FROM alpine:3.11.6\n"),
    );
    let cache_root = TempDir::new().unwrap();
    let opts = BuildOptions::default();

    let backend = RecordingBackend::new();
    let engine = engine_with(backend, cache_root.path());
    let module = engine.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &opts).unwrap();
    let log = fs::read_to_string(dir.path().join("hooks.log")).unwrap();
    assert_eq!(log, "pre\npost\n");

    // Cache hit: the backend is skipped and so are the hooks.
    let backend2 = RecordingBackend::new();
    let engine2 = engine_with(backend2.clone(), cache_root.path());
    let module2 = engine2.get_module(dir.path().join("kiln.yaml")).unwrap();
    engine2.build(&module2, &opts).unwrap();
    assert_eq!(backend2.build_count(), 0);
    let log = fs::read_to_string(dir.path().join("hooks.log")).unwrap();
    assert_eq!(log, "pre\npost\n", "hooks must not run on a cache hit");
}

#[test]
fn test_failing_pre_hook_aborts_build() {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "build:\n  name: test/hookfail\n  before: [\"exit 7\"]\n",
        Some("FROM alpine:3.11.6\n"),
    );
    let cache_root = TempDir::new().unwrap();
    let backend = RecordingBackend::new();
    let engine = engine_with(backend.clone(), cache_root.path());
    let module = engine.get_module(dir.path().join("kiln.yaml")).unwrap();
    let err = engine.build(&module, &BuildOptions::default()).unwrap_err();
    assert!(err.to_string().contains("pre-build hook failure"), "got: {err}");
    assert_eq!(backend.build_count(), 0);
    assert_eq!(module.status(), BuildStatus::Failed);
}

#[test]
fn test_builder_mismatch_fails() {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "build:\n  name: test/pinned\n  builder: kaniko\n",
        Some("FROM alpine:3.11.6\n"),
    );
    let cache_root = TempDir::new().unwrap();
    // RecordingBackend reports itself as "docker".
    let engine = engine_with(RecordingBackend::new(), cache_root.path());
    let module = engine.get_module(dir.path().join("kiln.yaml")).unwrap();
    let err = engine.build(&module, &options()).unwrap_err();
    assert!(err.to_string().contains("requires builder 'kaniko'"), "got: {err}");
}

#[test]
fn test_failed_module_outcome_is_shared_with_waiters() {
    let project = basic_project("shared-failure");
    let cache_root = TempDir::new().unwrap();
    let backend = RecordingBackend::with_delay(Duration::from_millis(40));
    backend.fail_for("shared-failure", "engine said no");
    let engine = engine_with(backend, cache_root.path());
    let module = engine.get_module(project.path().join("kiln.yaml")).unwrap();

    let mut threads = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        let module = Arc::clone(&module);
        threads.push(std::thread::spawn(move || engine.build(&module, &options())));
    }
    let mut messages = BTreeMap::new();
    for thread in threads {
        let err = thread.join().unwrap().unwrap_err().to_string();
        *messages.entry(err).or_insert(0) += 1;
    }
    assert_eq!(messages.len(), 1, "every waiter sees the same outcome: {messages:?}");
    assert!(messages.keys().next().unwrap().contains("engine said no"));
    // The recorded error names the backend that failed.
    assert_eq!(module.error().as_deref(), Some("docker: engine said no"));
}

#[test]
fn test_deep_chain_with_capacity_one_pool() {
    // A chain deeper than the pool would deadlock if dependency waits
    // consumed pool slots.
    let root = TempDir::new().unwrap();
    write_module(
        root.path(),
        "dependencies: [\"mid\"]\nbuild:\n  name: test/chain-root\n",
        Some("FROM alpine:3.11.6\n"),
    );
    write_module(
        &root.path().join("mid"),
        "dependencies: [\"leaf\"]\nbuild:\n  name: test/chain-mid\n",
        Some("FROM alpine:3.11.6\n"),
    );
    write_module(
        &root.path().join("mid").join("leaf"),
        "build:\n  name: test/chain-leaf\n",
        Some("FROM alpine:3.11.6\n"),
    );

    let backend = RecordingBackend::new();
    let cache_root = TempDir::new().unwrap();
    let engine = Engine::with_config(
        backend.clone(),
        1,
        DigestCache::with_root(cache_root.path().to_path_buf()),
    );
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();
    assert_eq!(backend.build_count(), 3);
    let images: Vec<String> = backend.builds().iter().map(|b| b.image.clone()).collect();
    assert_eq!(
        images,
        vec![
            "test/chain-leaf:latest",
            "test/chain-mid:latest",
            "test/chain-root:latest"
        ]
    );
}

#[test]
fn test_concurrency_respects_pool_capacity() {
    let root = TempDir::new().unwrap();
    let mut deps = Vec::new();
    for i in 0..6 {
        let name = format!("dep{}", i);
        write_module(
            &root.path().join(&name),
            &format!("build:\n  name: test/wide-{}\n", name),
            Some("FROM alpine:3.11.6\n"),
        );
        deps.push(format!("\"{}\"", name));
    }
    write_module(root.path(), &format!("dependencies: [{}]\n", deps.join(", ")), None);

    let backend = RecordingBackend::with_delay(Duration::from_millis(30));
    let cache_root = TempDir::new().unwrap();
    let engine = Engine::with_config(
        backend.clone(),
        2,
        DigestCache::with_root(cache_root.path().to_path_buf()),
    );
    let module = engine.get_module(root.path().join("kiln.yaml")).unwrap();
    engine.build(&module, &options()).unwrap();
    assert_eq!(backend.build_count(), 6);
    assert!(
        backend.peak_concurrent.load(Ordering::SeqCst) <= 2,
        "backend concurrency exceeded the pool capacity"
    );
}
