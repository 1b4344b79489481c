use super::*;
use crate::packages::archive::build_tar_gz;
use crate::status::{State, Status};
use crate::triggers::{Trigger, TriggerHandle, TriggerRunner, TriggerState};
use std::path::Path;
use tempfile::{TempDir, tempdir};

struct FakeHandle {
    result: TriggerState,
}

impl TriggerHandle for FakeHandle {
    fn poll(&mut self) -> TriggerState {
        self.result.clone()
    }

    fn output(&self) -> &str {
        ""
    }
}

/// Records every trigger started; fails the ones listed in `fail`
#[derive(Default)]
struct FakeRunner {
    started: Vec<(String, TriggerPoint)>,
    fail: Vec<(String, TriggerPoint)>,
}

impl TriggerRunner for FakeRunner {
    fn start(&mut self, script: &Path, trigger: &Trigger) -> Result<Box<dyn TriggerHandle>> {
        assert!(script.exists(), "script {} missing", script.display());
        let key = (trigger.package.clone(), trigger.point);
        let result = if self.fail.contains(&key) {
            TriggerState::Error("exit status: 1".to_string())
        } else {
            TriggerState::Success
        };
        self.started.push(key);
        Ok(Box::new(FakeHandle { result }))
    }
}

fn setup() -> (TempDir, PackageBase) {
    let dir = tempdir().unwrap();
    let pb = PackageBase::init(dir.path()).unwrap();
    (dir, pb)
}

fn control(name: &str, version: &str) -> String {
    format!(
        "Package: {}\nVersion: {}\nStandards-Version: 0.7\nInstalled-Size: 100\n",
        name, version
    )
}

fn add_archive_with_control(
    pb: &PackageBase,
    name: &str,
    version: &str,
    control: &str,
    files: &[(&str, &[u8])],
) {
    let mut all: Vec<(&str, &[u8])> = vec![("Package/Control", control.as_bytes())];
    all.extend_from_slice(files);
    build_tar_gz(&pb.archive_path(name, version), &all).unwrap();
}

fn add_archive(pb: &PackageBase, name: &str, version: &str, files: &[(&str, &[u8])]) {
    add_archive_with_control(pb, name, version, &control(name, version), files);
}

fn select(pb: &mut PackageBase, name: &str, version: &str) {
    pb.selected
        .insert(name, Status::new(State::Installed, version, "any"));
}

fn deselect(pb: &mut PackageBase, name: &str) {
    pb.selected.insert(name, Status::default().with_state(State::Removed));
}

fn run(engine: &mut UnpackEngine, pb: &mut PackageBase, runner: &mut FakeRunner) -> UnpackState {
    for _ in 0..10_000 {
        let state = engine.poll(pb, runner);
        if state.is_terminal() {
            return state;
        }
    }
    panic!("engine did not reach a terminal state");
}

/// Unpack and mark installed, the way a finished commit leaves it
fn install(pb: &mut PackageBase, name: &str, version: &str, files: &[(&str, &[u8])]) {
    add_archive(pb, name, version, files);
    select(pb, name, version);
    let mut engine = UnpackEngine::new(pb, [name]);
    assert_eq!(run(&mut engine, pb, &mut FakeRunner::default()), UnpackState::Done);
    let current = pb.current.get(name);
    pb.current.insert(name, current.with_state(State::Installed));
    pb.current.commit().unwrap();
}

/// Staging or backup debris anywhere under `dir`
fn leftovers(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains("~stevedore-") {
            found.push(path.clone());
        }
        if path.is_dir() {
            found.extend(leftovers(&path));
        }
    }
    found
}

fn read(path: PathBuf) -> String {
    fs::read_to_string(path).unwrap()
}

/// Poll until the engine enters `state`, then do `steps` units of work in it
fn poll_into(
    engine: &mut UnpackEngine,
    pb: &mut PackageBase,
    runner: &mut FakeRunner,
    state: UnpackState,
    steps: usize,
) {
    while engine.state() != state {
        assert!(!engine.state().is_terminal(), "never reached {}", state);
        engine.poll(pb, runner);
    }
    for _ in 0..steps {
        assert_eq!(engine.poll(pb, runner), state);
    }
}

fn assert_counters_cleared(engine: &UnpackEngine) {
    assert_eq!(engine.files_done(), 0);
    assert_eq!(engine.bytes_done(), 0);
    assert_eq!(engine.files_total(), 0);
    assert_eq!(engine.bytes_total(), 0);
}

#[test]
fn test_fresh_install() {
    let (dir, mut pb) = setup();
    add_archive(
        &pb,
        "Hello",
        "1.0-1",
        &[
            ("Apps/Hello/!Run", b"run"),
            ("Apps/Hello/Docs/ReadMe", b"hello"),
            ("Apps/Hello/Empty/", b""),
        ],
    );
    select(&mut pb, "Hello", "1.0-1");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert_eq!(engine.packages_to_unpack().len(), 1);
    assert!(engine.packages_to_remove().is_empty());
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "run");
    assert_eq!(read(dir.path().join("Apps/Hello/Docs/ReadMe")), "hello");
    assert!(dir.path().join("Apps/Hello/Empty").is_dir());
    assert!(leftovers(dir.path()).is_empty());

    let current = pb.current.get("Hello");
    assert_eq!(current.state, State::Unpacked);
    assert_eq!(current.version, "1.0-1");

    let manifest = pb.manifest("Hello").unwrap().unwrap();
    assert!(manifest.contains("Apps/Hello/!Run"));
    assert!(manifest.contains("Apps/Hello/Empty/"));
    assert!(manifest.contains("Package/Control"));
    assert!(pb.control("Hello").unwrap().is_some());

    // Status was committed, not just held in memory
    let reopened = PackageBase::open(dir.path()).unwrap();
    assert_eq!(reopened.current.get("Hello").state, State::Unpacked);
}

#[test]
fn test_progress_counters() {
    let (_dir, mut pb) = setup();
    let control = control("Hello", "1");
    add_archive(&pb, "Hello", "1", &[("Apps/Hello/a", b"abc"), ("Apps/Hello/b", b"defgh")]);
    select(&mut pb, "Hello", "1");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner::default();
    while engine.state() != UnpackState::CopyPostRemove {
        engine.poll(&mut pb, &mut runner);
    }
    assert_eq!(engine.files_total(), 3);
    assert_eq!(engine.bytes_total(), 8 + control.len() as u64);
    assert_eq!(engine.files_done(), 0);
    assert_eq!(engine.progress()[0].estimate, Some(100));

    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Done);
    assert_eq!(engine.files_done(), engine.files_total());
    assert_eq!(engine.bytes_done(), engine.bytes_total());
    assert_eq!(engine.progress()[0].done, engine.bytes_total());
}

#[test]
fn test_upgrade_replaces_and_removes() {
    let (dir, mut pb) = setup();
    install(
        &mut pb,
        "Hello",
        "1",
        &[("Apps/Hello/!Run", b"one"), ("Apps/Hello/Old", b"old")],
    );

    add_archive(
        &pb,
        "Hello",
        "2",
        &[("Apps/Hello/!Run", b"two"), ("Apps/Hello/New", b"new")],
    );
    select(&mut pb, "Hello", "2");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert!(engine.packages_to_remove().contains("Hello"));
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "two");
    assert_eq!(read(dir.path().join("Apps/Hello/New")), "new");
    assert!(!dir.path().join("Apps/Hello/Old").exists());
    assert!(leftovers(dir.path()).is_empty());

    let current = pb.current.get("Hello");
    assert_eq!((current.state, current.version.as_str()), (State::Unpacked, "2"));
    let manifest = pb.manifest("Hello").unwrap().unwrap();
    assert!(manifest.contains("Apps/Hello/New"));
    assert!(!manifest.contains("Apps/Hello/Old"));
}

#[test]
fn test_removal() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/Hello/!Run", b"one"), ("Apps/Hello/Empty/", b"")]);
    deselect(&mut pb, "Hello");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert!(engine.packages_to_unpack().is_empty());
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert!(!dir.path().join("Apps/Hello").exists());
    assert!(dir.path().join("Apps").is_dir());
    assert!(leftovers(dir.path()).is_empty());
    assert_eq!(pb.current.get("Hello").state, State::Removed);
    assert!(pb.manifest("Hello").unwrap().is_none());
    assert!(pb.control("Hello").unwrap().is_none());
}

#[test]
fn test_removal_across_directories() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/A/x", b"x"), ("Apps/B/y", b"yy")]);
    assert_eq!(read(dir.path().join("Apps/A/x")), "x");
    assert_eq!(read(dir.path().join("Apps/B/y")), "yy");
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));

    deselect(&mut pb, "Hello");
    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert!(!dir.path().join("Apps/A").exists());
    assert!(!dir.path().join("Apps/B").exists());
    assert!(dir.path().join("Apps").is_dir());
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));
}

#[test]
fn test_removal_is_counted() {
    let (_dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/Hello/a", b"abc"), ("Apps/Hello/b", b"defgh")]);
    deselect(&mut pb, "Hello");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner::default();
    poll_into(&mut engine, &mut pb, &mut runner, UnpackState::CopyPostRemove, 0);
    // Two payload files plus the control record
    assert_eq!(engine.files_total(), 3);
    assert!(engine.bytes_total() > 8);
    assert_eq!(engine.files_done(), 0);

    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Done);
    assert_eq!(engine.files_done(), engine.files_total());
    assert_eq!(engine.bytes_done(), engine.bytes_total());
}

#[test]
fn test_conflict_aborts_before_touching_files() {
    let (dir, mut pb) = setup();
    let mine = dir.path().join("Apps/Hello/!Run");
    fs::create_dir_all(mine.parent().unwrap()).unwrap();
    fs::write(&mine, "mine").unwrap();

    add_archive(&pb, "Hello", "1", &[("Apps/Hello/!Run", b"theirs"), ("Apps/Hello/Other", b"x")]);
    select(&mut pb, "Hello", "1");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);

    assert_eq!(engine.files_that_conflict(), vec![mine.clone()]);
    assert!(engine.message().unwrap().contains("File conflict"));
    assert!(!engine.past_point_of_no_return());
    assert_eq!(read(mine), "mine");
    assert!(!dir.path().join("Apps/Hello/Other").exists());
    assert!(leftovers(dir.path()).is_empty());
    assert_eq!(pb.current.get("Hello").state, State::NotPresent);
    assert!(pb.manifest("Hello").unwrap().is_none());

    let reopened = PackageBase::open(dir.path()).unwrap();
    assert!(!reopened.current.contains("Hello"));
}

#[test]
fn test_packages_claiming_one_path_conflict() {
    let (_dir, mut pb) = setup();
    add_archive(&pb, "Zip", "1", &[("Apps/Zip/!Run", b"zip")]);
    add_archive(&pb, "Unzip", "1", &[("apps/zip/!RUN", b"unzip")]);
    select(&mut pb, "Zip", "1");
    select(&mut pb, "Unzip", "1");

    let mut engine = UnpackEngine::new(&pb, ["Zip", "Unzip"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);
    assert_eq!(engine.files_that_conflict().len(), 1);
}

#[test]
fn test_unsupported_standards_version() {
    let (dir, mut pb) = setup();
    let control = "Package: Future\nVersion: 1\nStandards-Version: 9.9\n";
    add_archive_with_control(&pb, "Future", "1", control, &[("Apps/Future/!Run", b"x")]);
    select(&mut pb, "Future", "1");

    let mut engine = UnpackEngine::new(&pb, ["Future"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);
    assert_eq!(engine.packages_cannot_process(), vec!["Future".to_string()]);
    assert!(engine.message().unwrap().contains("Cannot process"));
    assert!(!dir.path().join("Apps/Future").exists());
    assert_eq!(pb.current.get("Future").state, State::NotPresent);
}

#[test]
fn test_incompatible_environment() {
    let (_dir, mut pb) = setup();
    let control = "Package: Native\nVersion: 1\nEnvironment: x86\n";
    add_archive_with_control(&pb, "Native", "1", control, &[("Apps/Native/!Run", b"x")]);
    select(&mut pb, "Native", "1");

    let mut engine = UnpackEngine::new(&pb, ["Native"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);
    assert_eq!(engine.packages_cannot_process(), vec!["Native".to_string()]);
}

#[test]
fn test_missing_archive_unwinds() {
    let (_dir, mut pb) = setup();
    select(&mut pb, "Ghost", "1");

    let mut engine = UnpackEngine::new(&pb, ["Ghost"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);
    assert!(engine.message().is_some());
    assert_eq!(pb.current.get("Ghost").state, State::NotPresent);
}

const UNWIND_POINTS: &[UnpackState] = &[
    UnpackState::PreUnpack,
    UnpackState::PreRemove,
    UnpackState::CopyPostRemove,
    UnpackState::RunPreRemoveTriggers,
    UnpackState::RemoveFilesReplacedByDirs,
    UnpackState::Unpack,
    UnpackState::RunPreInstallTriggers,
    UnpackState::Replace,
    UnpackState::Remove,
];

#[test]
fn test_failure_before_post_remove_restores_everything() {
    for &point in UNWIND_POINTS {
        let (dir, mut pb) = setup();
        install(
            &mut pb,
            "Hello",
            "1",
            &[
                ("Apps/Hello/!Run", b"one"),
                ("Apps/Hello/Old", b"old"),
                ("Apps/Hello/Tool", b"tool file"),
                ("Package/Triggers/PostRemove", b"echo bye"),
            ],
        );
        add_archive(
            &pb,
            "Hello",
            "2",
            &[
                ("Apps/Hello/!Run", b"two"),
                ("Apps/Hello/New", b"new"),
                ("Apps/Hello/Tool/!Run", b"tool dir"),
                ("Apps/Hello/Empty/", b""),
            ],
        );
        select(&mut pb, "Hello", "2");

        let mut engine = UnpackEngine::new(&pb, ["Hello"]);
        engine.fail_at(point);
        assert_eq!(
            run(&mut engine, &mut pb, &mut FakeRunner::default()),
            UnpackState::Fail,
            "failure injected at {}",
            point
        );

        assert!(engine.message().unwrap().contains("injected"), "{}", point);
        assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "one", "{}", point);
        assert_eq!(read(dir.path().join("Apps/Hello/Old")), "old", "{}", point);
        assert_eq!(read(dir.path().join("Apps/Hello/Tool")), "tool file", "{}", point);
        assert!(!dir.path().join("Apps/Hello/New").exists(), "{}", point);
        assert!(!dir.path().join("Apps/Hello/Empty").exists(), "{}", point);
        assert!(leftovers(dir.path()).is_empty(), "{}: {:?}", point, leftovers(dir.path()));

        let current = pb.current.get("Hello");
        assert_eq!((current.state, current.version.as_str()), (State::Installed, "1"), "{}", point);
        let reopened = PackageBase::open(dir.path()).unwrap();
        assert_eq!(reopened.current.get("Hello").state, State::Installed, "{}", point);

        let manifest = pb.manifest("Hello").unwrap().unwrap();
        assert!(manifest.contains("Apps/Hello/Old"), "{}", point);
        assert!(!pb.metadata.has_staged_manifest("Hello"), "{}", point);

        assert_eq!(engine.files_done(), 0, "{}", point);
        assert_eq!(engine.bytes_done(), 0, "{}", point);
        assert_eq!(engine.files_total(), 0, "{}", point);
        assert_eq!(engine.bytes_total(), 0, "{}", point);
        assert!(engine.post_remove_copies().is_empty(), "{}", point);
        assert!(!pb.layout().post_remove_copy("Hello").exists(), "{}", point);
    }
}

#[test]
fn test_conflict_appearing_during_replace_unwinds() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/Hello/!Run", b"one"), ("Apps/Hello/Old", b"old")]);
    add_archive(
        &pb,
        "Hello",
        "2",
        &[
            ("Apps/Hello/!Run", b"two"),
            ("Apps/Hello/New", b"new"),
            ("Apps/Hello/Zed", b"zed"),
        ],
    );
    select(&mut pb, "Hello", "2");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner::default();
    poll_into(&mut engine, &mut pb, &mut runner, UnpackState::Replace, 2);
    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "two");
    assert_eq!(read(dir.path().join("Apps/Hello/New")), "new");

    let foreign = dir.path().join("Apps/Hello/Zed");
    fs::write(&foreign, "someone else's").unwrap();
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);

    assert!(!engine.past_point_of_no_return());
    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "one");
    assert_eq!(read(dir.path().join("Apps/Hello/Old")), "old");
    assert!(!dir.path().join("Apps/Hello/New").exists());
    assert_eq!(read(foreign), "someone else's");
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));

    let current = pb.current.get("Hello");
    assert_eq!((current.state, current.version.as_str()), (State::Installed, "1"));
    assert!(!pb.metadata.has_staged_manifest("Hello"));
    assert_counters_cleared(&engine);
}

#[test]
fn test_blocked_staging_during_unpack_unwinds() {
    let (dir, mut pb) = setup();
    add_archive(&pb, "Hello", "1", &[("Apps/A/x", b"x"), ("Apps/B/y", b"y")]);
    select(&mut pb, "Hello", "1");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner::default();
    // Stage the metadata, then the first file
    poll_into(&mut engine, &mut pb, &mut runner, UnpackState::Unpack, 2);
    assert_eq!(engine.files_done(), 1);

    let blocker = dir.path().join("Apps/B").join(filesystem::STAGE_TAG);
    fs::create_dir_all(blocker.parent().unwrap()).unwrap();
    fs::write(&blocker, "in the way").unwrap();
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);
    fs::remove_file(&blocker).unwrap();

    assert!(!dir.path().join("Apps/A").exists());
    assert!(!dir.path().join("Apps/B/y").exists());
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));
    assert_eq!(pb.current.get("Hello").state, State::NotPresent);
    assert!(!pb.metadata.has_staged_manifest("Hello"));
    assert_counters_cleared(&engine);
}

#[test]
fn test_blocked_backup_during_remove_unwinds() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/A/x", b"x"), ("Apps/B/y", b"y")]);
    deselect(&mut pb, "Hello");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner::default();
    poll_into(&mut engine, &mut pb, &mut runner, UnpackState::Remove, 1);
    assert!(!dir.path().join("Apps/A/x").exists());
    assert_eq!(engine.files_done(), 1);

    let blocker = dir.path().join("Apps/B").join(filesystem::BACKUP_TAG);
    fs::write(&blocker, "in the way").unwrap();
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);
    fs::remove_file(&blocker).unwrap();

    assert_eq!(read(dir.path().join("Apps/A/x")), "x");
    assert_eq!(read(dir.path().join("Apps/B/y")), "y");
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));

    let current = pb.current.get("Hello");
    assert_eq!((current.state, current.version.as_str()), (State::Installed, "1"));
    assert!(pb.manifest("Hello").unwrap().is_some());
    assert_counters_cleared(&engine);
}

#[test]
fn test_blocked_backup_while_moving_files_aside_unwinds() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Tool", "1", &[("Apps/A/Tool", b"a"), ("Apps/B/Tool", b"b")]);
    add_archive(
        &pb,
        "Tool",
        "2",
        &[("Apps/A/Tool/!Run", b"app a"), ("Apps/B/Tool/!Run", b"app b")],
    );
    select(&mut pb, "Tool", "2");

    let mut engine = UnpackEngine::new(&pb, ["Tool"]);
    let mut runner = FakeRunner::default();
    poll_into(&mut engine, &mut pb, &mut runner, UnpackState::RemoveFilesReplacedByDirs, 1);
    assert!(!dir.path().join("Apps/A/Tool").exists());

    let blocker = dir.path().join("Apps/B").join(filesystem::BACKUP_TAG);
    fs::write(&blocker, "in the way").unwrap();
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);
    fs::remove_file(&blocker).unwrap();

    assert_eq!(read(dir.path().join("Apps/A/Tool")), "a");
    assert_eq!(read(dir.path().join("Apps/B/Tool")), "b");
    assert!(leftovers(dir.path()).is_empty(), "{:?}", leftovers(dir.path()));

    let current = pb.current.get("Tool");
    assert_eq!((current.state, current.version.as_str()), (State::Installed, "1"));
    assert_counters_cleared(&engine);
}

#[test]
fn test_failure_past_post_remove_is_not_unwound() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/Hello/!Run", b"one")]);
    add_archive(&pb, "Hello", "2", &[("Apps/Hello/!Run", b"two"), ("Apps/Hello/Empty/", b"")]);
    select(&mut pb, "Hello", "2");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    engine.fail_at(UnpackState::CreateEmptyDirs);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);

    assert!(engine.past_point_of_no_return());
    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "two");
    assert_eq!(pb.current.get("Hello").state, State::HalfUnpacked);
}

#[test]
fn test_trigger_order_and_abort_on_failure() {
    let (dir, mut pb) = setup();
    install(
        &mut pb,
        "Hello",
        "1",
        &[
            ("Apps/Hello/!Run", b"one"),
            ("Package/Triggers/PreRemove", b"true"),
            ("Package/Triggers/PostInstall", b"true"),
        ],
    );
    add_archive(
        &pb,
        "Hello",
        "2",
        &[
            ("Apps/Hello/!Run", b"two"),
            ("Package/Triggers/PreInstall", b"true"),
            ("Package/Triggers/PostRemove", b"true"),
        ],
    );
    select(&mut pb, "Hello", "2");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    engine.fail_at(UnpackState::Remove);
    let mut runner = FakeRunner::default();
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);

    let points: Vec<TriggerPoint> = runner.started.iter().map(|(_, p)| *p).collect();
    assert_eq!(
        points,
        vec![
            TriggerPoint::PreRemove,
            TriggerPoint::PreInstall,
            TriggerPoint::AbortPreInstall,
            TriggerPoint::AbortPreRemove,
        ]
    );
    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "one");
}

#[test]
fn test_failing_trigger_unwinds() {
    let (dir, mut pb) = setup();
    install(
        &mut pb,
        "Hello",
        "1",
        &[("Apps/Hello/!Run", b"one"), ("Package/Triggers/PreRemove", b"false")],
    );
    add_archive(&pb, "Hello", "2", &[("Apps/Hello/!Run", b"two")]);
    select(&mut pb, "Hello", "2");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    let mut runner = FakeRunner {
        fail: vec![("Hello".to_string(), TriggerPoint::PreRemove)],
        ..Default::default()
    };
    assert_eq!(run(&mut engine, &mut pb, &mut runner), UnpackState::Fail);

    assert!(engine.message().unwrap().contains("PreRemove"));
    // The failed trigger never completed, so there is nothing to abort
    assert_eq!(runner.started.len(), 1);
    assert_eq!(read(dir.path().join("Apps/Hello/!Run")), "one");
    assert_eq!(pb.current.get("Hello").state, State::Installed);
}

#[test]
fn test_file_replaced_by_directory() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Tool", "1", &[("Apps/Tool", b"single file")]);
    add_archive(&pb, "Tool", "2", &[("Apps/Tool/!Run", b"app")]);
    select(&mut pb, "Tool", "2");

    let mut engine = UnpackEngine::new(&pb, ["Tool"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert!(dir.path().join("Apps/Tool").is_dir());
    assert_eq!(read(dir.path().join("Apps/Tool/!Run")), "app");
    assert!(leftovers(dir.path()).is_empty());
}

#[test]
fn test_directory_replaced_by_file() {
    let (dir, mut pb) = setup();
    install(&mut pb, "Tool", "1", &[("Apps/Tool/Empty/", b"")]);
    assert!(dir.path().join("Apps/Tool/Empty").is_dir());

    add_archive(&pb, "Tool", "2", &[("Apps/Tool/Empty", b"now a file")]);
    select(&mut pb, "Tool", "2");

    let mut engine = UnpackEngine::new(&pb, ["Tool"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);
    assert_eq!(read(dir.path().join("Apps/Tool/Empty")), "now a file");
}

#[test]
fn test_file_owned_by_unrelated_package_blocks_directory() {
    let (dir, mut pb) = setup();
    let blocker = dir.path().join("Apps/Tool");
    fs::create_dir_all(blocker.parent().unwrap()).unwrap();
    fs::write(&blocker, "not ours").unwrap();

    add_archive(&pb, "Tool", "1", &[("Apps/Tool/!Run", b"app")]);
    select(&mut pb, "Tool", "1");

    let mut engine = UnpackEngine::new(&pb, ["Tool"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);
    assert_eq!(engine.files_that_conflict(), vec![blocker.clone()]);
    assert_eq!(read(blocker), "not ours");
}

#[test]
fn test_post_remove_script_is_saved() {
    let (dir, mut pb) = setup();
    install(
        &mut pb,
        "Hello",
        "1",
        &[("Apps/Hello/!Run", b"one"), ("Package/Triggers/PostRemove", b"echo bye")],
    );
    deselect(&mut pb, "Hello");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    let copy = engine.post_remove_copies().get("Hello").unwrap().clone();
    assert_eq!(copy, pb.layout().post_remove_copy("Hello"));
    assert_eq!(read(copy), "echo bye");
    assert!(!dir.path().join("Apps/Hello").exists());
}

#[test]
fn test_resident_module_is_not_unpacked() {
    let (dir, mut pb) = setup();
    pb.register_module("SharedLib", "2.00").unwrap();
    let control = "Package: SharedLib\nVersion: 1.50-1\nModule-Version: 1.50\n";
    add_archive_with_control(&pb, "SharedLib", "1.50-1", control, &[("System/Modules/SharedLib", b"module")]);
    select(&mut pb, "SharedLib", "1.50-1");

    let mut engine = UnpackEngine::new(&pb, ["SharedLib"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);

    assert!(!dir.path().join("System/Modules/SharedLib").exists());
    let manifest = pb.manifest("SharedLib").unwrap().unwrap();
    assert!(!manifest.contains("System/Modules/SharedLib"));
    assert!(pb.control("SharedLib").unwrap().unwrap().raw().contains("Module-Resident: 2.00"));
    assert_eq!(pb.current.get("SharedLib").state, State::Unpacked);
}

#[test]
fn test_resident_module_shortcut_unwinds() {
    let (dir, mut pb) = setup();
    pb.register_module("SharedLib", "2.00").unwrap();
    add_archive(&pb, "SharedLib", "1.50", &[("System/Modules/SharedLib", b"module")]);
    select(&mut pb, "SharedLib", "1.50");

    let mut engine = UnpackEngine::new(&pb, ["SharedLib"]);
    engine.fail_at(UnpackState::Replace);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Fail);

    assert!(pb.control("SharedLib").unwrap().is_none());
    assert!(!pb.metadata.has_staged_manifest("SharedLib"));
    assert_eq!(pb.current.get("SharedLib").state, State::NotPresent);
    assert!(leftovers(dir.path()).is_empty());
}

#[test]
fn test_older_resident_module_is_unpacked() {
    let (dir, mut pb) = setup();
    pb.register_module("SharedLib", "1.00").unwrap();
    add_archive(&pb, "SharedLib", "1.50", &[("System/Modules/SharedLib", b"module")]);
    select(&mut pb, "SharedLib", "1.50");

    let mut engine = UnpackEngine::new(&pb, ["SharedLib"]);
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);
    assert_eq!(read(dir.path().join("System/Modules/SharedLib")), "module");
}

#[test]
fn test_nothing_to_do() {
    let (_dir, mut pb) = setup();
    install(&mut pb, "Hello", "1", &[("Apps/Hello/!Run", b"one")]);
    select(&mut pb, "Hello", "1");

    let mut engine = UnpackEngine::new(&pb, ["Hello"]);
    assert!(engine.is_empty());
    assert_eq!(run(&mut engine, &mut pb, &mut FakeRunner::default()), UnpackState::Done);
    assert_eq!(pb.current.get("Hello").state, State::Installed);
}
