//! Per-process worker state and the signals a protocol sends back.
//!
//! A [`WorkerContext`] is handed to every [`WorkerProtocol`](super::WorkerProtocol)
//! call. It owns the channel to the client, enforces the one-terminal-signal
//! rule and answers administrative commands that arrive while an operation
//! waits for the client.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::WorkerSettings;
use crate::connection::{Address, Connection, MAX_PAYLOAD};
use crate::protocol::{
    AuthInfo, CommandCode, Entry, ErrorCode, HostArgs, Locator, MessageBoxButton,
    MessageBoxKind, MessageBoxRequest, MetaData, Reply, Request, WorkerStatusReport,
};

use super::batching::{BatchConfig, ListBatcher};
use super::error::{WorkerError, WorkerResult};
use super::signals::StopFlag;

const DEFAULT_CONNECT_TIMEOUT: u64 = 20;
const DEFAULT_PROXY_CONNECT_TIMEOUT: u64 = 10;
const DEFAULT_RESPONSE_TIMEOUT: u64 = 60;
const DEFAULT_READ_TIMEOUT: u64 = 15;

/// Channel timeout used when the worker moves between endpoints.
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Idle,
    InsideOperation,
    Finished,
    ErrorReported,
}

/// Worker-side state shared by the dispatch loop and protocol callbacks.
pub struct WorkerContext {
    protocol: String,
    pub(super) conn: Connection,
    pub(super) pool: Option<Address>,
    pub(super) connected_to_app: bool,
    pub(super) stop: StopFlag,
    pub(super) deferred: VecDeque<Request>,
    pub(super) need_send_can_resume: bool,
    state: OpState,
    operation: Option<CommandCode>,
    host: HostArgs,
    server_connected: bool,
    incoming: MetaData,
    outgoing: MetaData,
    config: MetaData,
    on_hold: Option<Locator>,
    batcher: ListBatcher,
    processed_interval: Duration,
    last_processed: Option<Instant>,
    processed_size: u64,
}

impl WorkerContext {
    pub fn new(protocol: impl Into<String>, conn: Connection, settings: &WorkerSettings) -> Self {
        Self {
            protocol: protocol.into(),
            conn,
            pool: None,
            connected_to_app: true,
            stop: StopFlag::new(),
            deferred: VecDeque::new(),
            need_send_can_resume: false,
            state: OpState::Idle,
            operation: None,
            host: HostArgs::default(),
            server_connected: false,
            incoming: MetaData::new(),
            outgoing: MetaData::new(),
            config: MetaData::new(),
            on_hold: None,
            batcher: ListBatcher::new(BatchConfig {
                initial: settings.list_batch_initial,
                slow: Duration::from_millis(settings.list_flush_slow_ms),
                fast: Duration::from_millis(settings.list_flush_fast_ms),
            }),
            processed_interval: Duration::from_millis(settings.processed_size_interval_ms),
            last_processed: None,
            processed_size: 0,
        }
    }

    /// Endpoint to return to when the client goes away or asks for a hold.
    pub fn with_pool(mut self, pool: Address) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    /// Target set by the last `Host` command.
    pub fn host(&self) -> &HostArgs {
        &self.host
    }

    pub fn on_hold(&self) -> Option<&Locator> {
        self.on_hold.as_ref()
    }

    pub fn processed(&self) -> u64 {
        self.processed_size
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Look up a key in the job's metadata, then in the protocol config.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.incoming
            .get(key)
            .or_else(|| self.config.get(key))
            .map(String::as_str)
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.incoming.contains_key(key) || self.config.contains_key(key)
    }

    pub fn incoming_metadata(&self) -> &MetaData {
        &self.incoming
    }

    pub fn config(&self) -> &MetaData {
        &self.config
    }

    /// Queue a key for the client; sent with the next data, mime type or
    /// finish.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outgoing.insert(key.into(), value.into());
    }

    pub async fn send_metadata(&mut self) -> WorkerResult<()> {
        let map = std::mem::take(&mut self.outgoing);
        self.send_reply(Reply::MetaData(map)).await
    }

    fn timeout_from_metadata(&self, key: &str, default: u64) -> Duration {
        let secs = self
            .metadata(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.timeout_from_metadata("ConnectTimeout", DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn proxy_connect_timeout(&self) -> Duration {
        self.timeout_from_metadata("ProxyConnectTimeout", DEFAULT_PROXY_CONNECT_TIMEOUT)
    }

    pub fn response_timeout(&self) -> Duration {
        self.timeout_from_metadata("ResponseTimeout", DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn read_timeout(&self) -> Duration {
        self.timeout_from_metadata("ReadTimeout", DEFAULT_READ_TIMEOUT)
    }

    // ------------------------------------------------------------------
    // Terminal signals
    // ------------------------------------------------------------------

    async fn send_reply(&mut self, reply: Reply) -> WorkerResult<()> {
        let payload = reply.encode()?;
        self.conn.send(reply.code(), payload).await?;
        Ok(())
    }

    fn accept_terminal(&self, signal: &str) -> bool {
        if self.state == OpState::InsideOperation {
            return true;
        }
        tracing::error!(
            protocol = %self.protocol,
            operation = ?self.operation,
            state = ?self.state,
            "{signal}() called with no open operation; not sent"
        );
        false
    }

    /// Report success of the current operation.
    pub async fn finished(&mut self) -> WorkerResult<()> {
        if !self.accept_terminal("finished") {
            return Ok(());
        }
        self.flush_list().await?;
        self.incoming.clear();
        if !self.outgoing.is_empty() {
            self.send_metadata().await?;
        }
        self.state = OpState::Finished;
        self.send_reply(Reply::Finished).await?;
        self.batcher.reset();
        Ok(())
    }

    /// Report failure of the current operation.
    pub async fn error(&mut self, code: ErrorCode, text: impl Into<String>) -> WorkerResult<()> {
        if !self.accept_terminal("error") {
            return Ok(());
        }
        self.incoming.clear();
        self.outgoing.clear();
        self.state = OpState::ErrorReported;
        self.send_reply(Reply::Error {
            code,
            text: text.into(),
        })
        .await
    }

    /// Report an established connection. Ends a `Connect` operation.
    pub async fn connected(&mut self) -> WorkerResult<()> {
        if self.operation == Some(CommandCode::Connect) {
            if !self.accept_terminal("connected") {
                return Ok(());
            }
            self.state = OpState::Finished;
        }
        self.server_connected = true;
        self.send_reply(Reply::Connected).await
    }

    /// Mark the remote side as disconnected, for status reports.
    pub fn disconnected(&mut self) {
        self.server_connected = false;
    }

    pub(super) fn begin_operation(&mut self, code: CommandCode) {
        self.state = OpState::InsideOperation;
        self.operation = Some(code);
        self.last_processed = None;
        self.processed_size = 0;
    }

    /// Close the operation, converting a missing terminal signal into an
    /// internal error.
    pub(super) async fn end_operation(&mut self) -> WorkerResult<()> {
        let operation = self.operation.take();
        if self.state == OpState::InsideOperation {
            tracing::error!(
                protocol = %self.protocol,
                operation = ?operation,
                "operation returned without finished() or error()"
            );
            self.incoming.clear();
            self.outgoing.clear();
            let name = operation.map(|op| format!("{op:?}")).unwrap_or_default();
            self.send_reply(Reply::Error {
                code: ErrorCode::Internal,
                text: format!("{name} on {} ended without a result", self.protocol),
            })
            .await?;
        }
        self.reset_operation();
        Ok(())
    }

    /// Drop operation state without signalling; the channel is gone.
    pub(super) fn abort_operation(&mut self) {
        self.operation = None;
        self.reset_operation();
    }

    fn reset_operation(&mut self) {
        self.state = OpState::Idle;
        self.need_send_can_resume = false;
        self.incoming.clear();
        self.batcher.reset();
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Send data to the client, split into frame-sized chunks. An empty
    /// slice marks the end of the stream.
    pub async fn data(&mut self, bytes: &[u8]) -> WorkerResult<()> {
        if !self.outgoing.is_empty() {
            self.send_metadata().await?;
        }
        if bytes.is_empty() {
            return self.send_reply(Reply::Data(Vec::new())).await;
        }
        for chunk in bytes.chunks(MAX_PAYLOAD) {
            self.send_reply(Reply::Data(chunk.to_vec())).await?;
        }
        Ok(())
    }

    /// Ask the client for the next chunk of data.
    pub async fn data_req(&mut self) -> WorkerResult<()> {
        if self.need_send_can_resume {
            self.can_resume(0).await?;
        }
        self.send_reply(Reply::DataReq).await
    }

    /// Wait for a data chunk. Empty means the client has no more.
    pub async fn read_data(&mut self) -> WorkerResult<Vec<u8>> {
        match self.wait_for_answer(&[CommandCode::Data]).await? {
            Request::Data(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    pub async fn stat_entry(&mut self, entry: Entry) -> WorkerResult<()> {
        self.send_reply(Reply::StatEntry(entry)).await
    }

    /// Buffer one listing entry; batches are sent as they fill.
    pub async fn list_entry(&mut self, entry: Entry) -> WorkerResult<()> {
        if let Some(batch) = self.batcher.push(entry) {
            self.send_reply(Reply::ListEntries(batch)).await?;
        }
        Ok(())
    }

    /// Send everything buffered by [`list_entry`](Self::list_entry).
    pub async fn flush_list(&mut self) -> WorkerResult<()> {
        if self.batcher.pending() > 0 {
            let batch = self.batcher.flush();
            self.send_reply(Reply::ListEntries(batch)).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Progress and info
    // ------------------------------------------------------------------

    pub async fn total_size(&mut self, bytes: u64) -> WorkerResult<()> {
        self.send_reply(Reply::TotalSize(bytes)).await
    }

    /// Report progress, at most once per processed-size interval.
    pub async fn processed_size(&mut self, bytes: u64) -> WorkerResult<()> {
        self.processed_size = bytes;
        let now = Instant::now();
        let due = self
            .last_processed
            .map_or(true, |last| now.duration_since(last) >= self.processed_interval);
        if due {
            self.last_processed = Some(now);
            self.send_reply(Reply::ProcessedSize(bytes)).await?;
        }
        Ok(())
    }

    pub async fn speed(&mut self, bytes_per_second: u64) -> WorkerResult<()> {
        self.send_reply(Reply::Speed(bytes_per_second)).await
    }

    pub async fn position(&mut self, offset: u64) -> WorkerResult<()> {
        self.send_reply(Reply::Position(offset)).await
    }

    pub async fn redirection(&mut self, locator: Locator) -> WorkerResult<()> {
        self.send_reply(Reply::Redirection(locator)).await
    }

    pub async fn renamed(&mut self, locator: Locator) -> WorkerResult<()> {
        self.send_reply(Reply::Renamed(locator)).await
    }

    pub async fn warning(&mut self, text: impl Into<String>) -> WorkerResult<()> {
        self.send_reply(Reply::Warning(text.into())).await
    }

    pub async fn info_message(&mut self, text: impl Into<String>) -> WorkerResult<()> {
        self.send_reply(Reply::InfoMessage(text.into())).await
    }

    pub async fn getting_file(&mut self, name: impl Into<String>) -> WorkerResult<()> {
        self.send_reply(Reply::GettingFile(name.into())).await
    }

    /// Mark the data that follows as an error page.
    pub async fn error_page(&mut self) -> WorkerResult<()> {
        self.send_reply(Reply::ErrorPage).await
    }

    pub async fn need_sub_url_data(&mut self) -> WorkerResult<()> {
        self.send_reply(Reply::NeedSubUrlData).await
    }

    // ------------------------------------------------------------------
    // Requests that wait for the client
    // ------------------------------------------------------------------

    /// Report the mime type and wait until the client says to continue.
    pub async fn mime_type(&mut self, mime: impl Into<String>) -> WorkerResult<()> {
        if !self.outgoing.is_empty() {
            let map = self.outgoing.clone();
            self.send_reply(Reply::MetaData(map)).await?;
        }
        self.send_reply(Reply::MimeType(mime.into())).await?;
        self.wait_for_answer(&[CommandCode::None]).await?;
        self.outgoing.clear();
        Ok(())
    }

    /// Offer to resume at `offset`. A zero offset needs no answer.
    pub async fn can_resume(&mut self, offset: u64) -> WorkerResult<bool> {
        self.need_send_can_resume = false;
        self.send_reply(Reply::Resume(offset)).await?;
        if offset == 0 {
            return Ok(true);
        }
        let answer = self
            .wait_for_answer(&[CommandCode::ResumeAnswer, CommandCode::None])
            .await?;
        Ok(matches!(answer, Request::ResumeAnswer))
    }

    /// Tell the client that this protocol can resume uploads.
    pub async fn announce_resume(&mut self) -> WorkerResult<()> {
        self.send_reply(Reply::CanResume).await
    }

    pub async fn message_box(
        &mut self,
        kind: MessageBoxKind,
        text: impl Into<String>,
        caption: impl Into<String>,
    ) -> WorkerResult<MessageBoxButton> {
        self.send_reply(Reply::MessageBox(MessageBoxRequest {
            kind,
            text: text.into(),
            caption: caption.into(),
        }))
        .await?;
        match self.wait_for_answer(&[CommandCode::MessageBoxAnswer]).await? {
            Request::MessageBoxAnswer(button) => Ok(button),
            _ => Ok(MessageBoxButton::Cancel),
        }
    }

    /// Ask the client for credentials. `None` if declined.
    pub async fn open_password_dialog(&mut self, info: AuthInfo) -> WorkerResult<Option<AuthInfo>> {
        tracing::debug!(user = %info.user, "requesting credentials");
        self.send_reply(Reply::NeedPassword(info)).await?;
        match self
            .wait_for_answer(&[CommandCode::UserPass, CommandCode::None])
            .await?
        {
            Request::UserPass(auth) => Ok(Some(auth)),
            _ => Ok(None),
        }
    }

    pub async fn request_network(&mut self, host: impl Into<String>) -> WorkerResult<bool> {
        self.send_reply(Reply::NetRequest(host.into())).await?;
        match self.wait_for_answer(&[CommandCode::NetworkStatus]).await? {
            Request::NetworkStatus(available) => Ok(available),
            _ => Ok(false),
        }
    }

    pub async fn drop_network(&mut self, host: impl Into<String>) -> WorkerResult<()> {
        self.send_reply(Reply::NetDrop(host.into())).await
    }

    /// Block until one of `expected` arrives.
    ///
    /// Administrative commands received meanwhile are applied; those that need
    /// the protocol implementation run after the current operation. Anything
    /// else is logged and dropped.
    pub async fn wait_for_answer(&mut self, expected: &[CommandCode]) -> WorkerResult<Request> {
        loop {
            let stop = self.stop.clone();
            let frame = tokio::select! {
                frame = self.conn.receive() => frame?,
                _ = stop.wait() => return Err(WorkerError::StopRequested),
            };
            let Some(frame) = frame else {
                tracing::debug!(protocol = %self.protocol, "channel closed while waiting for an answer");
                return Err(WorkerError::ConnectionLost);
            };

            let request = match Request::decode(frame.code, &frame.payload) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, "undecodable command while waiting for an answer");
                    continue;
                }
            };
            let code = request.code();
            if expected.contains(&code) {
                return Ok(request);
            }
            if code == CommandCode::Host && expected.contains(&CommandCode::None) {
                // A mime type pause ignores retargeting.
                continue;
            }
            if code.is_administrative() {
                if let Some(deferred) = self.handle_admin(request).await? {
                    self.deferred.push_back(deferred);
                }
                continue;
            }
            tracing::warn!(
                protocol = %self.protocol,
                command = %code,
                ?expected,
                "unexpected command while waiting for an answer"
            );
        }
    }

    // ------------------------------------------------------------------
    // Administrative commands
    // ------------------------------------------------------------------

    /// Apply an administrative command that needs no protocol callback.
    /// Anything else is handed back to the caller.
    pub(super) async fn handle_admin(&mut self, request: Request) -> WorkerResult<Option<Request>> {
        match request {
            Request::MetaData(map) => {
                self.incoming = map;
                Ok(None)
            }
            Request::Config(map) => {
                tracing::debug!(protocol = %self.protocol, keys = map.len(), "config received");
                self.config = map;
                Ok(None)
            }
            Request::WorkerStatus => {
                self.send_worker_status().await?;
                Ok(None)
            }
            Request::WorkerConnect(address) => {
                self.reparent(&address).await?;
                Ok(None)
            }
            Request::WorkerHold(locator) => {
                self.hold(locator).await?;
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    pub fn status_report(&self) -> WorkerStatusReport {
        WorkerStatusReport {
            pid: std::process::id(),
            protocol: self.protocol.clone(),
            host: self.host.host.clone(),
            connected: self.server_connected,
            on_hold: self.on_hold.clone(),
        }
    }

    async fn send_worker_status(&mut self) -> WorkerResult<()> {
        let report = self.status_report();
        self.send_reply(Reply::WorkerStatus(report)).await
    }

    /// Acknowledge and move to a new client endpoint.
    async fn reparent(&mut self, address: &str) -> WorkerResult<()> {
        let address: Address = address.parse().map_err(WorkerError::Channel)?;
        self.send_reply(Reply::WorkerAck).await?;
        self.conn.close().await;
        tracing::info!(protocol = %self.protocol, %address, "reparenting to new client");
        self.conn = Connection::connect(&address, RECONNECT_TIMEOUT).await?;
        self.on_hold = None;
        self.connected_to_app = true;
        Ok(())
    }

    /// Detach from the client and wait on the pool endpoint. The remote
    /// connection is kept open.
    async fn hold(&mut self, locator: Locator) -> WorkerResult<()> {
        tracing::info!(protocol = %self.protocol, %locator, "put on hold");
        self.on_hold = Some(locator);
        self.conn.close().await;
        self.connected_to_app = false;
        let Some(pool) = self.pool.clone() else {
            return Err(WorkerError::Detached);
        };
        self.conn = Connection::connect(&pool, RECONNECT_TIMEOUT).await?;
        Ok(())
    }

    /// Reconnect to the pool endpoint after losing the client.
    pub(super) async fn return_to_pool(&mut self) -> WorkerResult<bool> {
        let Some(pool) = self.pool.clone().filter(|_| self.connected_to_app) else {
            return Ok(false);
        };
        tracing::info!(protocol = %self.protocol, %pool, "client gone, returning to pool");
        self.conn.close().await;
        self.connected_to_app = false;
        self.conn = Connection::connect(&pool, RECONNECT_TIMEOUT).await?;
        Ok(true)
    }

    pub(super) fn set_host(&mut self, host: HostArgs) {
        self.host = host;
    }
}
