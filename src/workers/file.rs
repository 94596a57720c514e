//! Reference worker for the local filesystem (`file:` locators).

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::protocol::{
    ChmodArgs, CopyArgs, DelArgs, Entry, EntryKind, ErrorCode, Locator, MkdirArgs, PutArgs,
    RenameArgs, SymlinkArgs,
};
use crate::worker::{WorkerContext, WorkerProtocol, WorkerResult};

/// Read size for `get`.
const CHUNK_SIZE: usize = 64 * 1024;

/// Protocol name served by [`FileWorker`].
pub const PROTOCOL: &str = "file";

#[derive(Debug, Default)]
pub struct FileWorker;

fn io_code(err: &io::Error, fallback: ErrorCode) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::DoesNotExist,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
        io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExist,
        _ => fallback,
    }
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn entry_for(name: String, path: &Path, meta: &std::fs::Metadata, link_dest: Option<String>) -> Entry {
    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Directory
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    let mut entry = Entry::new(name, kind);
    entry.size = meta.len();
    entry.mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    entry.permissions = Some(meta.permissions().mode() & 0o7777);
    entry.link_dest = link_dest;
    entry.mime_type = match kind {
        EntryKind::Directory => Some("inode/directory".to_string()),
        EntryKind::File => Some(mime_for(path)),
        _ => None,
    };
    entry
}

async fn stat_path(path: &Path) -> io::Result<Entry> {
    let meta = fs::symlink_metadata(path).await?;
    let link_dest = if meta.file_type().is_symlink() {
        fs::read_link(path)
            .await
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    } else {
        None
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    Ok(entry_for(name, path, &meta, link_dest))
}

impl FileWorker {
    /// Local path for a locator, or report the error and return `None`.
    async fn local_path(ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<Option<PathBuf>> {
        if !locator.host.is_empty() && locator.host != "localhost" {
            ctx.error(
                ErrorCode::UnsupportedAction,
                format!("{PROTOCOL}: cannot reach remote host {}", locator.host),
            )
            .await?;
            return Ok(None);
        }
        if locator.path.is_empty() {
            ctx.error(ErrorCode::MalformedUrl, locator.to_string()).await?;
            return Ok(None);
        }
        Ok(Some(PathBuf::from(&locator.path)))
    }

    /// Report `FileAlreadyExist`/`DirAlreadyExist` if `path` exists.
    async fn refuse_existing(ctx: &mut WorkerContext, path: &Path) -> WorkerResult<bool> {
        match fs::symlink_metadata(path).await {
            Ok(meta) => {
                let code = if meta.is_dir() {
                    ErrorCode::DirAlreadyExist
                } else {
                    ErrorCode::FileAlreadyExist
                };
                ctx.error(code, path.display().to_string()).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl WorkerProtocol for FileWorker {
    async fn get(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, locator).await? else {
            return Ok(());
        };

        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CannotOpenForReading);
                return ctx.error(code, path.display().to_string()).await;
            }
        };
        if meta.is_dir() {
            return ctx.error(ErrorCode::IsDirectory, path.display().to_string()).await;
        }

        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CannotOpenForReading);
                return ctx.error(code, path.display().to_string()).await;
            }
        };

        ctx.mime_type(mime_for(&path)).await?;
        let total = meta.len();
        ctx.total_size(total).await?;

        let offset = ctx
            .metadata("resume")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&offset| offset > 0 && offset <= total)
            .unwrap_or(0);
        if offset > 0 {
            file.seek(io::SeekFrom::Start(offset)).await?;
            ctx.position(offset).await?;
        }

        let mut processed = offset;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    return ctx
                        .error(ErrorCode::CouldNotRead, format!("{}: {err}", path.display()))
                        .await;
                }
            };
            ctx.data(&buf[..n]).await?;
            processed += n as u64;
            ctx.processed_size(processed).await?;
        }

        ctx.data(&[]).await?;
        ctx.processed_size(processed).await?;
        ctx.finished().await
    }

    async fn put(&mut self, ctx: &mut WorkerContext, args: &PutArgs) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, &args.locator).await? else {
            return Ok(());
        };

        if let Ok(meta) = fs::metadata(&path).await {
            if meta.is_dir() {
                return ctx.error(ErrorCode::DirAlreadyExist, path.display().to_string()).await;
            }
            if !args.overwrite && !args.resume {
                return ctx.error(ErrorCode::FileAlreadyExist, path.display().to_string()).await;
            }
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true);
        if args.resume {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CannotOpenForWriting);
                return ctx.error(code, path.display().to_string()).await;
            }
        };

        let mut written = 0u64;
        loop {
            ctx.data_req().await?;
            let chunk = ctx.read_data().await?;
            if chunk.is_empty() {
                break;
            }
            if let Err(err) = file.write_all(&chunk).await {
                return ctx
                    .error(ErrorCode::CouldNotWrite, format!("{}: {err}", path.display()))
                    .await;
            }
            written += chunk.len() as u64;
            ctx.processed_size(written).await?;
        }
        file.flush().await?;

        if let Some(mode) = args.permissions {
            if let Err(err) = fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await {
                return ctx.error(io_code(&err, ErrorCode::CannotChmod), path.display().to_string()).await;
            }
        }
        ctx.finished().await
    }

    async fn stat(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, locator).await? else {
            return Ok(());
        };
        match stat_path(&path).await {
            Ok(entry) => {
                ctx.stat_entry(entry).await?;
                ctx.finished().await
            }
            Err(err) => {
                ctx.error(io_code(&err, ErrorCode::CouldNotStat), path.display().to_string())
                    .await
            }
        }
    }

    async fn mime_type(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, locator).await? else {
            return Ok(());
        };
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => ctx.mime_type("inode/directory").await?,
            Ok(_) => ctx.mime_type(mime_for(&path)).await?,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CouldNotStat);
                return ctx.error(code, path.display().to_string()).await;
            }
        }
        ctx.finished().await
    }

    async fn list_dir(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, locator).await? else {
            return Ok(());
        };

        let mut dir = match fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(err) => {
                let code = match fs::metadata(&path).await {
                    Ok(meta) if !meta.is_dir() => ErrorCode::IsFile,
                    _ => io_code(&err, ErrorCode::CannotEnterDirectory),
                };
                return ctx.error(code, path.display().to_string()).await;
            }
        };

        let mut count = 0u64;
        loop {
            let next = match dir.next_entry().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(err) => {
                    return ctx
                        .error(ErrorCode::CouldNotRead, format!("{}: {err}", path.display()))
                        .await;
                }
            };
            match stat_path(&next.path()).await {
                Ok(entry) => {
                    ctx.list_entry(entry).await?;
                    count += 1;
                }
                Err(err) => {
                    tracing::debug!(path = %next.path().display(), error = %err, "skipping entry");
                }
            }
        }

        ctx.total_size(count).await?;
        ctx.finished().await
    }

    async fn mkdir(&mut self, ctx: &mut WorkerContext, args: &MkdirArgs) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, &args.locator).await? else {
            return Ok(());
        };
        if Self::refuse_existing(ctx, &path).await? {
            return Ok(());
        }
        if let Err(err) = fs::create_dir(&path).await {
            let code = io_code(&err, ErrorCode::CouldNotMkdir);
            return ctx.error(code, path.display().to_string()).await;
        }
        if let Some(mode) = args.permissions {
            if let Err(err) = fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await {
                return ctx.error(io_code(&err, ErrorCode::CannotChmod), path.display().to_string()).await;
            }
        }
        ctx.finished().await
    }

    async fn rename(&mut self, ctx: &mut WorkerContext, args: &RenameArgs) -> WorkerResult<()> {
        let Some(src) = Self::local_path(ctx, &args.src).await? else {
            return Ok(());
        };
        let Some(dest) = Self::local_path(ctx, &args.dest).await? else {
            return Ok(());
        };
        if !args.overwrite && Self::refuse_existing(ctx, &dest).await? {
            return Ok(());
        }
        match fs::rename(&src, &dest).await {
            Ok(()) => ctx.finished().await,
            Err(err) => {
                ctx.error(io_code(&err, ErrorCode::CannotRename), src.display().to_string())
                    .await
            }
        }
    }

    async fn symlink(&mut self, ctx: &mut WorkerContext, args: &SymlinkArgs) -> WorkerResult<()> {
        let Some(dest) = Self::local_path(ctx, &args.dest).await? else {
            return Ok(());
        };
        if fs::symlink_metadata(&dest).await.is_ok() {
            if !args.overwrite {
                return Self::refuse_existing(ctx, &dest).await.map(|_| ());
            }
            if let Err(err) = fs::remove_file(&dest).await {
                let code = io_code(&err, ErrorCode::CannotDelete);
                return ctx.error(code, dest.display().to_string()).await;
            }
        }
        match fs::symlink(&args.target, &dest).await {
            Ok(()) => ctx.finished().await,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CouldNotWrite);
                ctx.error(code, dest.display().to_string()).await
            }
        }
    }

    async fn copy(&mut self, ctx: &mut WorkerContext, args: &CopyArgs) -> WorkerResult<()> {
        let Some(src) = Self::local_path(ctx, &args.src).await? else {
            return Ok(());
        };
        let Some(dest) = Self::local_path(ctx, &args.dest).await? else {
            return Ok(());
        };

        let meta = match fs::metadata(&src).await {
            Ok(meta) => meta,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CannotOpenForReading);
                return ctx.error(code, src.display().to_string()).await;
            }
        };
        if meta.is_dir() {
            return ctx.error(ErrorCode::IsDirectory, src.display().to_string()).await;
        }
        if !args.overwrite && Self::refuse_existing(ctx, &dest).await? {
            return Ok(());
        }

        ctx.total_size(meta.len()).await?;
        match fs::copy(&src, &dest).await {
            Ok(copied) => ctx.processed_size(copied).await?,
            Err(err) => {
                let code = io_code(&err, ErrorCode::CouldNotWrite);
                return ctx.error(code, dest.display().to_string()).await;
            }
        }
        if let Some(mode) = args.permissions {
            if let Err(err) = fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode)).await {
                return ctx.error(io_code(&err, ErrorCode::CannotChmod), dest.display().to_string()).await;
            }
        }
        ctx.finished().await
    }

    async fn del(&mut self, ctx: &mut WorkerContext, args: &DelArgs) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, &args.locator).await? else {
            return Ok(());
        };
        let result = if args.is_file {
            fs::remove_file(&path).await
        } else {
            fs::remove_dir(&path).await
        };
        match result {
            Ok(()) => ctx.finished().await,
            Err(err) => {
                let fallback = if args.is_file {
                    ErrorCode::CannotDelete
                } else {
                    ErrorCode::CouldNotRmdir
                };
                ctx.error(io_code(&err, fallback), path.display().to_string()).await
            }
        }
    }

    async fn chmod(&mut self, ctx: &mut WorkerContext, args: &ChmodArgs) -> WorkerResult<()> {
        let Some(path) = Self::local_path(ctx, &args.locator).await? else {
            return Ok(());
        };
        let perms = std::fs::Permissions::from_mode(args.permissions);
        match fs::set_permissions(&path, perms).await {
            Ok(()) => ctx.finished().await,
            Err(err) => {
                ctx.error(io_code(&err, ErrorCode::CannotChmod), path.display().to_string())
                    .await
            }
        }
    }
}
