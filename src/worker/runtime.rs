//! The worker's command dispatch loop.

use crate::protocol::{CommandCode, ErrorCode, MessageError, Request};

use super::context::WorkerContext;
use super::error::{WorkerError, WorkerResult};
use super::protocol::WorkerProtocol;

/// Runs a [`WorkerProtocol`] against the commands arriving on a channel.
pub struct WorkerRuntime<P> {
    protocol: P,
    ctx: WorkerContext,
}

impl<P: WorkerProtocol> WorkerRuntime<P> {
    pub fn new(protocol: P, ctx: WorkerContext) -> Self {
        Self { protocol, ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Dispatch commands until the client and pool are both gone, the worker
    /// is detached without a pool, or a stop is requested.
    pub async fn run(mut self) -> WorkerResult<()> {
        tracing::info!(protocol = %self.ctx.protocol(), "worker dispatch loop started");

        loop {
            if self.ctx.stop.is_requested() {
                tracing::info!(protocol = %self.ctx.protocol(), "stop requested");
                break;
            }

            let request = match self.next_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(err) if err.is_fatal() => {
                    tracing::info!(error = %err, "dispatch loop ending");
                    break;
                }
                Err(err) => return Err(err),
            };

            match self.dispatch(request).await {
                Ok(()) => {}
                Err(WorkerError::StopRequested) | Err(WorkerError::Detached) => break,
                Err(err) if err.is_fatal() => {
                    if !self.ctx.return_to_pool().await? {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "command failed");
                }
            }
        }

        if let Err(err) = self.protocol.close_connection(&mut self.ctx).await {
            tracing::debug!(error = %err, "close_connection failed during shutdown");
        }
        self.ctx.conn.close().await;
        tracing::info!(protocol = %self.ctx.protocol(), "worker dispatch loop finished");
        Ok(())
    }

    /// Next command: deferred administrative work first, then the channel.
    /// `None` once there is nothing left to serve.
    async fn next_request(&mut self) -> WorkerResult<Option<Request>> {
        loop {
            if let Some(request) = self.ctx.deferred.pop_front() {
                return Ok(Some(request));
            }

            let stop = self.ctx.stop.clone();
            let frame = tokio::select! {
                frame = self.ctx.conn.receive() => frame?,
                _ = stop.wait() => return Ok(None),
            };

            let Some(frame) = frame else {
                if self.ctx.return_to_pool().await? {
                    self.protocol.close_connection(&mut self.ctx).await?;
                    continue;
                }
                return Ok(None);
            };

            match Request::decode(frame.code, &frame.payload) {
                Ok(request) => return Ok(Some(request)),
                Err(MessageError::UnknownCode(code)) => {
                    tracing::debug!(code, "ignoring unknown command");
                }
                Err(err) => {
                    tracing::error!(error = %err, "malformed command");
                    if let Some(code) = CommandCode::from_u8(frame.code).filter(|c| c.is_operation()) {
                        self.ctx.begin_operation(code);
                        self.ctx.error(ErrorCode::Internal, err.to_string()).await?;
                        self.ctx.end_operation().await?;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> WorkerResult<()> {
        let code = request.code();
        tracing::debug!(protocol = %self.ctx.protocol(), command = %code, "dispatch");

        let Some(request) = self.ctx.handle_admin(request).await? else {
            return Ok(());
        };

        if code.is_operation() {
            return self.run_operation(code, request).await;
        }

        let ctx = &mut self.ctx;
        match request {
            Request::Host(host) => {
                ctx.set_host(host.clone());
                self.protocol.set_host(ctx, &host).await
            }
            Request::Disconnect => {
                ctx.disconnected();
                self.protocol.close_connection(ctx).await
            }
            Request::ReparseConfiguration => self.protocol.reparse_configuration(ctx).await,
            Request::SubUrl(locator) => self.protocol.set_sub_url(ctx, &locator).await,
            Request::None => {
                tracing::warn!("unexpected None command");
                Ok(())
            }
            other => {
                tracing::warn!(command = %other.code(), "command not expected outside an operation");
                Ok(())
            }
        }
    }

    async fn run_operation(&mut self, code: CommandCode, request: Request) -> WorkerResult<()> {
        self.ctx.begin_operation(code);

        let ctx = &mut self.ctx;
        let protocol = &mut self.protocol;
        let outcome = match &request {
            Request::Connect => protocol.open_connection(ctx).await,
            Request::Get(locator) => protocol.get(ctx, locator).await,
            Request::Put(args) => {
                ctx.need_send_can_resume = true;
                protocol.put(ctx, args).await
            }
            Request::Stat(locator) => protocol.stat(ctx, locator).await,
            Request::MimeType(locator) => protocol.mime_type(ctx, locator).await,
            Request::ListDir(locator) => protocol.list_dir(ctx, locator).await,
            Request::Mkdir(args) => protocol.mkdir(ctx, args).await,
            Request::Rename(args) => protocol.rename(ctx, args).await,
            Request::Symlink(args) => protocol.symlink(ctx, args).await,
            Request::Copy(args) => protocol.copy(ctx, args).await,
            Request::Del(args) => protocol.del(ctx, args).await,
            Request::Chmod(args) => protocol.chmod(ctx, args).await,
            Request::Chown(args) => protocol.chown(ctx, args).await,
            Request::SetModificationTime(args) => protocol.set_modification_time(ctx, args).await,
            Request::Special(data) => protocol.special(ctx, data).await,
            Request::MultiGet(items) => protocol.multi_get(ctx, items).await,
            other => {
                tracing::error!(command = %other.code(), "not an operation");
                Ok(())
            }
        };

        match outcome {
            Ok(()) => self.ctx.end_operation().await,
            Err(err) if err.is_fatal() => {
                self.ctx.abort_operation();
                Err(err)
            }
            Err(err) => {
                tracing::error!(protocol = %self.ctx.protocol(), command = %code, error = %err, "operation failed");
                self.ctx.error(ErrorCode::Internal, err.to_string()).await?;
                self.ctx.end_operation().await
            }
        }
    }
}
