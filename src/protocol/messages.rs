//! Typed frame payloads.
//!
//! Every frame carries one of these messages. Structured payloads are UTF-8
//! JSON, data chunks are raw bytes and signal-only frames are empty. The
//! [`Request`] enum covers client -> worker frames, [`Reply`] covers both the
//! Info and Result classes sent back by the worker.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::codes::{CommandCode, InfoCode, ResultCode};
use super::error_code::ErrorCode;
use super::locator::Locator;

/// Key/value metadata exchanged alongside jobs.
pub type MetaData = BTreeMap<String, String>;

/// Errors while encoding or decoding a payload.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("unknown frame code 0x{0:02x}")]
    UnknownCode(u8),

    #[error("malformed payload for {code}: {source}")]
    Decode {
        code: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

fn decode<T: DeserializeOwned>(code: impl ToString, payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(|source| MessageError::Decode {
        code: code.to_string(),
        source,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(value)?)
}

// ============================================================================
// Entries
// ============================================================================

/// Kind of a filesystem-like entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One stat or listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    /// Seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: MetaData,
}

impl Entry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            mtime: None,
            permissions: None,
            link_dest: None,
            mime_type: None,
            extra: MetaData::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

// ============================================================================
// Request arguments
// ============================================================================

/// Target host for subsequent operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostArgs {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutArgs {
    pub locator: Locator,
    #[serde(default)]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirArgs {
    pub locator: Locator,
    #[serde(default)]
    pub permissions: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameArgs {
    pub src: Locator,
    pub dest: Locator,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkArgs {
    pub target: String,
    pub dest: Locator,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyArgs {
    pub src: Locator,
    pub dest: Locator,
    #[serde(default)]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelArgs {
    pub locator: Locator,
    pub is_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChmodArgs {
    pub locator: Locator,
    pub permissions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownArgs {
    pub locator: Locator,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtimeArgs {
    pub locator: Locator,
    /// Seconds since the epoch.
    pub mtime: i64,
}

/// One element of a batched fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiGetItem {
    pub id: u64,
    pub locator: Locator,
    #[serde(default)]
    pub metadata: MetaData,
}

/// Credentials, either requested by the worker or supplied by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub keep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBoxKind {
    QuestionYesNo,
    WarningYesNo,
    WarningContinueCancel,
    WarningYesNoCancel,
    Information,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBoxButton {
    Ok,
    Yes,
    No,
    Cancel,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBoxRequest {
    pub kind: MessageBoxKind,
    pub text: String,
    #[serde(default)]
    pub caption: String,
}

/// Status reported in answer to `WorkerStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub pid: u32,
    pub protocol: String,
    pub host: String,
    pub connected: bool,
    #[serde(default)]
    pub on_hold: Option<Locator>,
}

#[derive(Serialize, Deserialize)]
struct LocatorArgs {
    locator: Locator,
}

#[derive(Serialize, Deserialize)]
struct AddressArgs {
    address: String,
}

#[derive(Serialize, Deserialize)]
struct NetworkArgs {
    host: String,
}

#[derive(Serialize, Deserialize)]
struct NetworkStatusArgs {
    available: bool,
}

#[derive(Serialize, Deserialize)]
struct AnswerArgs {
    button: MessageBoxButton,
}

#[derive(Serialize, Deserialize)]
struct ErrorArgs {
    code: ErrorCode,
    text: String,
}

#[derive(Serialize, Deserialize)]
struct SizeArgs {
    value: u64,
}

#[derive(Serialize, Deserialize)]
struct TextArgs {
    text: String,
}

// ============================================================================
// Client -> worker
// ============================================================================

/// A command frame sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Host(HostArgs),
    Connect,
    Disconnect,
    WorkerStatus,
    /// Reparent to a new client endpoint.
    WorkerConnect(String),
    /// Detach and wait on the pool endpoint, remembering the held locator.
    WorkerHold(Locator),
    None,
    Data(Vec<u8>),
    Get(Locator),
    Put(PutArgs),
    Stat(Locator),
    MimeType(Locator),
    ListDir(Locator),
    Mkdir(MkdirArgs),
    Rename(RenameArgs),
    Copy(CopyArgs),
    Del(DelArgs),
    Chmod(ChmodArgs),
    Special(Vec<u8>),
    SetModificationTime(MtimeArgs),
    ReparseConfiguration,
    MetaData(MetaData),
    Symlink(SymlinkArgs),
    SubUrl(Locator),
    MessageBoxAnswer(MessageBoxButton),
    ResumeAnswer,
    Config(MetaData),
    MultiGet(Vec<MultiGetItem>),
    Chown(ChownArgs),
    UserPass(AuthInfo),
    NetworkStatus(bool),
}

impl Request {
    pub fn code(&self) -> CommandCode {
        match self {
            Request::Host(_) => CommandCode::Host,
            Request::Connect => CommandCode::Connect,
            Request::Disconnect => CommandCode::Disconnect,
            Request::WorkerStatus => CommandCode::WorkerStatus,
            Request::WorkerConnect(_) => CommandCode::WorkerConnect,
            Request::WorkerHold(_) => CommandCode::WorkerHold,
            Request::None => CommandCode::None,
            Request::Data(_) => CommandCode::Data,
            Request::Get(_) => CommandCode::Get,
            Request::Put(_) => CommandCode::Put,
            Request::Stat(_) => CommandCode::Stat,
            Request::MimeType(_) => CommandCode::MimeType,
            Request::ListDir(_) => CommandCode::ListDir,
            Request::Mkdir(_) => CommandCode::Mkdir,
            Request::Rename(_) => CommandCode::Rename,
            Request::Copy(_) => CommandCode::Copy,
            Request::Del(_) => CommandCode::Del,
            Request::Chmod(_) => CommandCode::Chmod,
            Request::Special(_) => CommandCode::Special,
            Request::SetModificationTime(_) => CommandCode::SetModificationTime,
            Request::ReparseConfiguration => CommandCode::ReparseConfiguration,
            Request::MetaData(_) => CommandCode::MetaData,
            Request::Symlink(_) => CommandCode::Symlink,
            Request::SubUrl(_) => CommandCode::SubUrl,
            Request::MessageBoxAnswer(_) => CommandCode::MessageBoxAnswer,
            Request::ResumeAnswer => CommandCode::ResumeAnswer,
            Request::Config(_) => CommandCode::Config,
            Request::MultiGet(_) => CommandCode::MultiGet,
            Request::Chown(_) => CommandCode::Chown,
            Request::UserPass(_) => CommandCode::UserPass,
            Request::NetworkStatus(_) => CommandCode::NetworkStatus,
        }
    }

    /// Encode the payload bytes for this request.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let locator = |l: &Locator| encode(&LocatorArgs { locator: l.clone() });
        match self {
            Request::Connect
            | Request::Disconnect
            | Request::WorkerStatus
            | Request::None
            | Request::ReparseConfiguration
            | Request::ResumeAnswer => Ok(Vec::new()),
            Request::Data(bytes) | Request::Special(bytes) => Ok(bytes.clone()),
            Request::Host(args) => encode(args),
            Request::WorkerConnect(address) => encode(&AddressArgs {
                address: address.clone(),
            }),
            Request::WorkerHold(l)
            | Request::Get(l)
            | Request::Stat(l)
            | Request::MimeType(l)
            | Request::ListDir(l)
            | Request::SubUrl(l) => locator(l),
            Request::Put(args) => encode(args),
            Request::Mkdir(args) => encode(args),
            Request::Rename(args) => encode(args),
            Request::Copy(args) => encode(args),
            Request::Del(args) => encode(args),
            Request::Chmod(args) => encode(args),
            Request::SetModificationTime(args) => encode(args),
            Request::MetaData(map) | Request::Config(map) => encode(map),
            Request::Symlink(args) => encode(args),
            Request::MessageBoxAnswer(button) => encode(&AnswerArgs { button: *button }),
            Request::MultiGet(items) => encode(items),
            Request::Chown(args) => encode(args),
            Request::UserPass(auth) => encode(auth),
            Request::NetworkStatus(available) => encode(&NetworkStatusArgs {
                available: *available,
            }),
        }
    }

    /// Decode a command frame.
    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, MessageError> {
        let code = CommandCode::from_u8(code).ok_or(MessageError::UnknownCode(code))?;
        let locator = || decode::<LocatorArgs>(code, payload).map(|a| a.locator);
        Ok(match code {
            CommandCode::Host => Request::Host(decode(code, payload)?),
            CommandCode::Connect => Request::Connect,
            CommandCode::Disconnect => Request::Disconnect,
            CommandCode::WorkerStatus => Request::WorkerStatus,
            CommandCode::WorkerConnect => {
                Request::WorkerConnect(decode::<AddressArgs>(code, payload)?.address)
            }
            CommandCode::WorkerHold => Request::WorkerHold(locator()?),
            CommandCode::None => Request::None,
            CommandCode::Data => Request::Data(payload.to_vec()),
            CommandCode::Get => Request::Get(locator()?),
            CommandCode::Put => Request::Put(decode(code, payload)?),
            CommandCode::Stat => Request::Stat(locator()?),
            CommandCode::MimeType => Request::MimeType(locator()?),
            CommandCode::ListDir => Request::ListDir(locator()?),
            CommandCode::Mkdir => Request::Mkdir(decode(code, payload)?),
            CommandCode::Rename => Request::Rename(decode(code, payload)?),
            CommandCode::Copy => Request::Copy(decode(code, payload)?),
            CommandCode::Del => Request::Del(decode(code, payload)?),
            CommandCode::Chmod => Request::Chmod(decode(code, payload)?),
            CommandCode::Special => Request::Special(payload.to_vec()),
            CommandCode::SetModificationTime => {
                Request::SetModificationTime(decode(code, payload)?)
            }
            CommandCode::ReparseConfiguration => Request::ReparseConfiguration,
            CommandCode::MetaData => Request::MetaData(decode(code, payload)?),
            CommandCode::Symlink => Request::Symlink(decode(code, payload)?),
            CommandCode::SubUrl => Request::SubUrl(locator()?),
            CommandCode::MessageBoxAnswer => {
                Request::MessageBoxAnswer(decode::<AnswerArgs>(code, payload)?.button)
            }
            CommandCode::ResumeAnswer => Request::ResumeAnswer,
            CommandCode::Config => Request::Config(decode(code, payload)?),
            CommandCode::MultiGet => Request::MultiGet(decode(code, payload)?),
            CommandCode::Chown => Request::Chown(decode(code, payload)?),
            CommandCode::UserPass => Request::UserPass(decode(code, payload)?),
            CommandCode::NetworkStatus => {
                Request::NetworkStatus(decode::<NetworkStatusArgs>(code, payload)?.available)
            }
        })
    }
}

// ============================================================================
// Worker -> client
// ============================================================================

/// An Info or Result frame sent by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    // Info
    TotalSize(u64),
    ProcessedSize(u64),
    Speed(u64),
    Redirection(Locator),
    MimeType(String),
    ErrorPage,
    Warning(String),
    GettingFile(String),
    NeedPassword(AuthInfo),
    InfoMessage(String),
    MetaData(MetaData),
    MessageBox(MessageBoxRequest),
    Position(u64),

    // Result
    /// Data chunk; empty marks end of stream.
    Data(Vec<u8>),
    DataReq,
    Error { code: ErrorCode, text: String },
    Connected,
    Finished,
    StatEntry(Entry),
    ListEntries(Vec<Entry>),
    Renamed(Locator),
    Resume(u64),
    WorkerStatus(WorkerStatusReport),
    WorkerAck,
    NetRequest(String),
    NetDrop(String),
    NeedSubUrlData,
    CanResume,
}

impl Reply {
    /// Raw wire code of this reply.
    pub fn code(&self) -> u8 {
        match self {
            Reply::TotalSize(_) => InfoCode::TotalSize.as_u8(),
            Reply::ProcessedSize(_) => InfoCode::ProcessedSize.as_u8(),
            Reply::Speed(_) => InfoCode::Speed.as_u8(),
            Reply::Redirection(_) => InfoCode::Redirection.as_u8(),
            Reply::MimeType(_) => InfoCode::MimeType.as_u8(),
            Reply::ErrorPage => InfoCode::ErrorPage.as_u8(),
            Reply::Warning(_) => InfoCode::Warning.as_u8(),
            Reply::GettingFile(_) => InfoCode::GettingFile.as_u8(),
            Reply::NeedPassword(_) => InfoCode::NeedPassword.as_u8(),
            Reply::InfoMessage(_) => InfoCode::InfoMessage.as_u8(),
            Reply::MetaData(_) => InfoCode::MetaData.as_u8(),
            Reply::MessageBox(_) => InfoCode::MessageBox.as_u8(),
            Reply::Position(_) => InfoCode::Position.as_u8(),
            Reply::Data(_) => ResultCode::Data.as_u8(),
            Reply::DataReq => ResultCode::DataReq.as_u8(),
            Reply::Error { .. } => ResultCode::Error.as_u8(),
            Reply::Connected => ResultCode::Connected.as_u8(),
            Reply::Finished => ResultCode::Finished.as_u8(),
            Reply::StatEntry(_) => ResultCode::StatEntry.as_u8(),
            Reply::ListEntries(_) => ResultCode::ListEntries.as_u8(),
            Reply::Renamed(_) => ResultCode::Renamed.as_u8(),
            Reply::Resume(_) => ResultCode::Resume.as_u8(),
            Reply::WorkerStatus(_) => ResultCode::WorkerStatus.as_u8(),
            Reply::WorkerAck => ResultCode::WorkerAck.as_u8(),
            Reply::NetRequest(_) => ResultCode::NetRequest.as_u8(),
            Reply::NetDrop(_) => ResultCode::NetDrop.as_u8(),
            Reply::NeedSubUrlData => ResultCode::NeedSubUrlData.as_u8(),
            Reply::CanResume => ResultCode::CanResume.as_u8(),
        }
    }

    /// `Finished` or `Error`: ends the current operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Finished | Reply::Error { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let size = |value: u64| encode(&SizeArgs { value });
        let text = |text: &String| encode(&TextArgs { text: text.clone() });
        match self {
            Reply::TotalSize(v) | Reply::ProcessedSize(v) | Reply::Speed(v) | Reply::Position(v) => {
                size(*v)
            }
            Reply::Resume(offset) => size(*offset),
            Reply::Redirection(l) | Reply::Renamed(l) => encode(&LocatorArgs { locator: l.clone() }),
            Reply::MimeType(t)
            | Reply::Warning(t)
            | Reply::GettingFile(t)
            | Reply::InfoMessage(t) => text(t),
            Reply::ErrorPage
            | Reply::DataReq
            | Reply::Connected
            | Reply::Finished
            | Reply::WorkerAck
            | Reply::NeedSubUrlData
            | Reply::CanResume => Ok(Vec::new()),
            Reply::NeedPassword(auth) => encode(auth),
            Reply::MetaData(map) => encode(map),
            Reply::MessageBox(request) => encode(request),
            Reply::Data(bytes) => Ok(bytes.clone()),
            Reply::Error { code, text } => encode(&ErrorArgs {
                code: *code,
                text: text.clone(),
            }),
            Reply::StatEntry(entry) => encode(entry),
            Reply::ListEntries(entries) => encode(entries),
            Reply::WorkerStatus(report) => encode(report),
            Reply::NetRequest(host) | Reply::NetDrop(host) => {
                encode(&NetworkArgs { host: host.clone() })
            }
        }
    }

    pub fn decode(code: u8, payload: &[u8]) -> Result<Self, MessageError> {
        if let Some(info) = InfoCode::from_u8(code) {
            let size = || decode::<SizeArgs>(info, payload).map(|a| a.value);
            let text = || decode::<TextArgs>(info, payload).map(|a| a.text);
            return Ok(match info {
                InfoCode::TotalSize => Reply::TotalSize(size()?),
                InfoCode::ProcessedSize => Reply::ProcessedSize(size()?),
                InfoCode::Speed => Reply::Speed(size()?),
                InfoCode::Position => Reply::Position(size()?),
                InfoCode::Redirection => {
                    Reply::Redirection(decode::<LocatorArgs>(info, payload)?.locator)
                }
                InfoCode::MimeType => Reply::MimeType(text()?),
                InfoCode::ErrorPage => Reply::ErrorPage,
                InfoCode::Warning => Reply::Warning(text()?),
                InfoCode::GettingFile => Reply::GettingFile(text()?),
                InfoCode::NeedPassword => Reply::NeedPassword(decode(info, payload)?),
                InfoCode::InfoMessage => Reply::InfoMessage(text()?),
                InfoCode::MetaData => Reply::MetaData(decode(info, payload)?),
                InfoCode::MessageBox => Reply::MessageBox(decode(info, payload)?),
            });
        }

        let result = ResultCode::from_u8(code).ok_or(MessageError::UnknownCode(code))?;
        Ok(match result {
            ResultCode::Data => Reply::Data(payload.to_vec()),
            ResultCode::DataReq => Reply::DataReq,
            ResultCode::Error => {
                let args: ErrorArgs = decode(result, payload)?;
                Reply::Error {
                    code: args.code,
                    text: args.text,
                }
            }
            ResultCode::Connected => Reply::Connected,
            ResultCode::Finished => Reply::Finished,
            ResultCode::StatEntry => Reply::StatEntry(decode(result, payload)?),
            ResultCode::ListEntries => Reply::ListEntries(decode(result, payload)?),
            ResultCode::Renamed => Reply::Renamed(decode::<LocatorArgs>(result, payload)?.locator),
            ResultCode::Resume => Reply::Resume(decode::<SizeArgs>(result, payload)?.value),
            ResultCode::WorkerStatus => Reply::WorkerStatus(decode(result, payload)?),
            ResultCode::WorkerAck => Reply::WorkerAck,
            ResultCode::NetRequest => Reply::NetRequest(decode::<NetworkArgs>(result, payload)?.host),
            ResultCode::NetDrop => Reply::NetDrop(decode::<NetworkArgs>(result, payload)?.host),
            ResultCode::NeedSubUrlData => Reply::NeedSubUrlData,
            ResultCode::CanResume => Reply::CanResume,
        })
    }
}
