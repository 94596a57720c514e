//! The local filesystem worker, driven through the scheduler.

#[path = "../common/mod.rs"]
mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use common::start;
use ioworker::protocol::{EntryKind, ErrorCode};
use ioworker::scheduler::{Job, JobError, JobOutput, Scheduler, SchedulerOptions};
use ioworker::Locator;

struct Fixture {
    scheduler: Scheduler,
    root: tempfile::TempDir,
    _sockets: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let sockets = tempfile::tempdir().unwrap();
        let (scheduler, _launcher) = start(sockets.path(), SchedulerOptions::default());
        Self {
            scheduler,
            root: tempfile::tempdir().unwrap(),
            _sockets: sockets,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.root.path().join(name)
    }

    fn locator(&self, name: &str) -> Locator {
        Locator::file(self.path(name))
    }

    async fn run(&self, job: Job) -> Result<JobOutput, JobError> {
        self.scheduler.submit(job).unwrap().wait().await
    }

    async fn error_code(&self, job: Job) -> ErrorCode {
        self.run(job).await.unwrap_err().code()
    }
}

fn mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[tokio::test]
async fn test_put_then_get() {
    let fx = Fixture::new();
    let body = vec![b'x'; 200_000];

    let job = Job::put(fx.locator("upload.bin"), Some(0o640), false, false);
    fx.scheduler.submit(job).unwrap().upload(body.clone()).await.unwrap();
    assert_eq!(std::fs::read(fx.path("upload.bin")).unwrap(), body);
    assert_eq!(mode(&fx.path("upload.bin")), 0o640);

    let output = fx.run(Job::get(fx.locator("upload.bin"))).await.unwrap();
    assert_eq!(output.data, body);
    assert_eq!(output.total_size, Some(body.len() as u64));
    assert_eq!(output.mime_type.as_deref(), Some("application/octet-stream"));
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_put_refuses_existing_file_without_overwrite() {
    let fx = Fixture::new();
    std::fs::write(fx.path("a.txt"), b"old").unwrap();

    let job = Job::put(fx.locator("a.txt"), None, false, false);
    let err = fx.scheduler.submit(job).unwrap().upload(b"new".to_vec()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileAlreadyExist);
    assert_eq!(std::fs::read(fx.path("a.txt")).unwrap(), b"old");

    let job = Job::put(fx.locator("a.txt"), None, true, false);
    fx.scheduler.submit(job).unwrap().upload(b"new".to_vec()).await.unwrap();
    assert_eq!(std::fs::read(fx.path("a.txt")).unwrap(), b"new");

    let job = Job::put(fx.locator("a.txt"), None, false, true);
    fx.scheduler.submit(job).unwrap().upload(b"er".to_vec()).await.unwrap();
    assert_eq!(std::fs::read(fx.path("a.txt")).unwrap(), b"newer");
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_resumes_at_offset() {
    let fx = Fixture::new();
    std::fs::write(fx.path("r.txt"), b"0123456789").unwrap();

    let job = Job::get(fx.locator("r.txt")).with_metadata("resume", "4");
    let output = fx.run(job).await.unwrap();
    assert_eq!(output.data, b"456789");
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stat_describes_files_and_directories() {
    let fx = Fixture::new();
    std::fs::write(fx.path("page.html"), b"<p>").unwrap();
    std::fs::create_dir(fx.path("sub")).unwrap();

    let entry = fx.run(Job::stat(fx.locator("page.html"))).await.unwrap().stat.unwrap();
    assert_eq!(entry.name, "page.html");
    assert_eq!(entry.kind, EntryKind::File);
    assert_eq!(entry.size, 3);
    assert_eq!(entry.mime_type.as_deref(), Some("text/html"));
    assert!(entry.mtime.is_some());

    let entry = fx.run(Job::stat(fx.locator("sub"))).await.unwrap().stat.unwrap();
    assert_eq!(entry.kind, EntryKind::Directory);

    let code = fx.error_code(Job::stat(fx.locator("missing"))).await;
    assert_eq!(code, ErrorCode::DoesNotExist);
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_list_dir() {
    let fx = Fixture::new();
    std::fs::write(fx.path("one"), b"1").unwrap();
    std::fs::write(fx.path("two"), b"22").unwrap();
    std::fs::create_dir(fx.path("three")).unwrap();
    std::os::unix::fs::symlink(fx.path("one"), fx.path("link")).unwrap();

    let output = fx.run(Job::list_dir(Locator::file(fx.root.path()))).await.unwrap();
    let mut names: Vec<&str> = output.entries.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["link", "one", "three", "two"]);
    assert_eq!(output.total_size, Some(4));

    let link = output.entries.iter().find(|e| e.name == "link").unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.link_dest.as_deref(), fx.path("one").to_str());

    let code = fx.error_code(Job::list_dir(fx.locator("one"))).await;
    assert_eq!(code, ErrorCode::IsFile);
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mkdir_rename_copy_delete() {
    let fx = Fixture::new();

    fx.run(Job::mkdir(fx.locator("dir"), Some(0o700))).await.unwrap();
    assert!(fx.path("dir").is_dir());
    assert_eq!(mode(&fx.path("dir")), 0o700);
    let code = fx.error_code(Job::mkdir(fx.locator("dir"), None)).await;
    assert_eq!(code, ErrorCode::DirAlreadyExist);

    std::fs::write(fx.path("a"), b"alpha").unwrap();
    fx.run(Job::rename(fx.locator("a"), fx.locator("b"), false)).await.unwrap();
    assert!(!fx.path("a").exists());
    assert_eq!(std::fs::read(fx.path("b")).unwrap(), b"alpha");

    fx.run(Job::copy(fx.locator("b"), fx.locator("c"), None, false)).await.unwrap();
    assert_eq!(std::fs::read(fx.path("c")).unwrap(), b"alpha");
    let code = fx.error_code(Job::copy(fx.locator("b"), fx.locator("c"), None, false)).await;
    assert_eq!(code, ErrorCode::FileAlreadyExist);
    let code = fx.error_code(Job::copy(fx.locator("dir"), fx.locator("d"), None, false)).await;
    assert_eq!(code, ErrorCode::IsDirectory);

    fx.run(Job::delete(fx.locator("c"), true)).await.unwrap();
    assert!(!fx.path("c").exists());
    fx.run(Job::delete(fx.locator("dir"), false)).await.unwrap();
    assert!(!fx.path("dir").exists());
    let code = fx.error_code(Job::delete(fx.locator("c"), true)).await;
    assert_eq!(code, ErrorCode::DoesNotExist);
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chmod_and_symlink() {
    let fx = Fixture::new();
    std::fs::write(fx.path("f"), b"").unwrap();

    fx.run(Job::chmod(fx.locator("f"), 0o600)).await.unwrap();
    assert_eq!(mode(&fx.path("f")), 0o600);

    fx.run(Job::symlink("f", fx.locator("ln"), false)).await.unwrap();
    assert_eq!(std::fs::read_link(fx.path("ln")).unwrap(), Path::new("f"));
    let code = fx.error_code(Job::symlink("f", fx.locator("ln"), false)).await;
    assert_eq!(code, ErrorCode::FileAlreadyExist);
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_errors() {
    let fx = Fixture::new();
    std::fs::create_dir(fx.path("d")).unwrap();

    assert_eq!(fx.error_code(Job::get(fx.locator("d"))).await, ErrorCode::IsDirectory);
    assert_eq!(fx.error_code(Job::get(fx.locator("nope"))).await, ErrorCode::DoesNotExist);

    let remote: Locator = "file://example.org/etc/hosts".parse().unwrap();
    assert_eq!(fx.error_code(Job::get(remote)).await, ErrorCode::UnsupportedAction);

    let special = Job::special(fx.locator("d"), vec![1, 2, 3]);
    assert_eq!(fx.error_code(special).await, ErrorCode::UnsupportedAction);
    fx.scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_escaped_locator_reaches_the_file() {
    let fx = Fixture::new();
    std::fs::write(fx.path("my file.txt"), b"spaced").unwrap();

    let text = fx.locator("my file.txt").to_string();
    assert!(text.ends_with("/my%20file.txt"), "{text}");
    let parsed: Locator = text.parse().unwrap();

    let output = fx.run(Job::get(parsed)).await.unwrap();
    assert_eq!(output.data, b"spaced");
    fx.scheduler.shutdown().await.unwrap();
}
