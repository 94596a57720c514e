//! The trait a protocol implementation plugs into the worker runtime.

use async_trait::async_trait;

use super::context::WorkerContext;
use super::error::WorkerResult;
use crate::protocol::{
    ChmodArgs, ChownArgs, CopyArgs, DelArgs, ErrorCode, HostArgs, Locator, MkdirArgs, MtimeArgs,
    MultiGetItem, PutArgs, RenameArgs, SymlinkArgs,
};

async fn unsupported(ctx: &mut WorkerContext, what: &str) -> WorkerResult<()> {
    let text = format!("{what} is not supported with protocol {}", ctx.protocol());
    ctx.error(ErrorCode::UnsupportedAction, text).await
}

/// Protocol-specific operations.
///
/// Each operation must end with exactly one of [`WorkerContext::finished`] or
/// [`WorkerContext::error`] (or [`WorkerContext::connected`] for
/// `open_connection`). Returning an `Err` reports an internal error for the
/// operation. Every default reports `UnsupportedAction`.
#[async_trait]
pub trait WorkerProtocol: Send {
    /// New target. Not an operation; no terminal signal is expected.
    async fn set_host(&mut self, _ctx: &mut WorkerContext, _host: &HostArgs) -> WorkerResult<()> {
        Ok(())
    }

    async fn open_connection(&mut self, ctx: &mut WorkerContext) -> WorkerResult<()> {
        unsupported(ctx, "opening connections").await
    }

    /// Drop any remote connection. No response is sent.
    async fn close_connection(&mut self, _ctx: &mut WorkerContext) -> WorkerResult<()> {
        Ok(())
    }

    async fn get(&mut self, ctx: &mut WorkerContext, _locator: &Locator) -> WorkerResult<()> {
        unsupported(ctx, "retrieving data").await
    }

    async fn put(&mut self, ctx: &mut WorkerContext, _args: &PutArgs) -> WorkerResult<()> {
        unsupported(ctx, "writing").await
    }

    async fn stat(&mut self, ctx: &mut WorkerContext, _locator: &Locator) -> WorkerResult<()> {
        unsupported(ctx, "accessing files").await
    }

    /// Determine the mime type. Defaults to a `get`, which reports it on the
    /// way.
    async fn mime_type(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        self.get(ctx, locator).await
    }

    async fn list_dir(&mut self, ctx: &mut WorkerContext, _locator: &Locator) -> WorkerResult<()> {
        unsupported(ctx, "listing directories").await
    }

    async fn mkdir(&mut self, ctx: &mut WorkerContext, _args: &MkdirArgs) -> WorkerResult<()> {
        unsupported(ctx, "creating directories").await
    }

    async fn rename(&mut self, ctx: &mut WorkerContext, _args: &RenameArgs) -> WorkerResult<()> {
        unsupported(ctx, "renaming or moving files").await
    }

    async fn symlink(&mut self, ctx: &mut WorkerContext, _args: &SymlinkArgs) -> WorkerResult<()> {
        unsupported(ctx, "creating symlinks").await
    }

    async fn copy(&mut self, ctx: &mut WorkerContext, _args: &CopyArgs) -> WorkerResult<()> {
        unsupported(ctx, "copying files").await
    }

    async fn del(&mut self, ctx: &mut WorkerContext, _args: &DelArgs) -> WorkerResult<()> {
        unsupported(ctx, "deleting files").await
    }

    async fn chmod(&mut self, ctx: &mut WorkerContext, _args: &ChmodArgs) -> WorkerResult<()> {
        unsupported(ctx, "changing permissions").await
    }

    async fn chown(&mut self, ctx: &mut WorkerContext, _args: &ChownArgs) -> WorkerResult<()> {
        unsupported(ctx, "changing ownership").await
    }

    async fn set_modification_time(
        &mut self,
        ctx: &mut WorkerContext,
        _args: &MtimeArgs,
    ) -> WorkerResult<()> {
        unsupported(ctx, "setting modification times").await
    }

    async fn special(&mut self, ctx: &mut WorkerContext, _data: &[u8]) -> WorkerResult<()> {
        unsupported(ctx, "special commands").await
    }

    async fn multi_get(
        &mut self,
        ctx: &mut WorkerContext,
        _items: &[MultiGetItem],
    ) -> WorkerResult<()> {
        unsupported(ctx, "multiple get").await
    }

    /// Source locator for filter protocols. Not an operation.
    async fn set_sub_url(&mut self, ctx: &mut WorkerContext, locator: &Locator) -> WorkerResult<()> {
        tracing::warn!(protocol = %ctx.protocol(), %locator, "sub-urls are not supported");
        Ok(())
    }

    /// Re-read any cached configuration.
    async fn reparse_configuration(&mut self, _ctx: &mut WorkerContext) -> WorkerResult<()> {
        Ok(())
    }
}
