//! Frame command codes.
//!
//! Codes are partitioned by numeric range so that a frame's class can be
//! determined from the code alone:
//!
//! ```text
//! 0x0a ..= 0x2f   Info     worker -> client, non-terminal
//! 0x30 ..= 0x63   Command  client -> worker
//! 0x64 ..= 0x8f   Result   worker -> client, terminal or semi-terminal
//! ```

use std::fmt;

/// First code of the Info range.
pub const INFO_MIN: u8 = 0x0a;
/// Last code of the Info range.
pub const INFO_MAX: u8 = 0x2f;
/// First code of the Command range.
pub const COMMAND_MIN: u8 = 0x30;
/// Last code of the Command range.
pub const COMMAND_MAX: u8 = 0x63;
/// First code of the Result range.
pub const RESULT_MIN: u8 = 0x64;
/// Last code of the Result range.
pub const RESULT_MAX: u8 = 0x8f;

/// Class of a frame, derived from its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeClass {
    Command,
    Info,
    Result,
    Unknown,
}

impl CodeClass {
    /// Classify a raw code.
    pub fn of(code: u8) -> Self {
        match code {
            INFO_MIN..=INFO_MAX => CodeClass::Info,
            COMMAND_MIN..=COMMAND_MAX => CodeClass::Command,
            RESULT_MIN..=RESULT_MAX => CodeClass::Result,
            _ => CodeClass::Unknown,
        }
    }
}

macro_rules! wire_codes {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Every code of this class.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Look up a code by its wire value.
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Wire value of this code.
            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}(0x{:02x})", self, *self as u8)
            }
        }
    };
}

wire_codes! {
    /// Client -> worker directives.
    CommandCode {
        /// Reconfigure the worker's target host.
        Host = 0x30,
        Connect = 0x31,
        Disconnect = 0x32,
        /// Ask the worker to report its status.
        WorkerStatus = 0x33,
        /// Reparent the worker to a new client endpoint.
        WorkerConnect = 0x34,
        /// Detach the worker and put it on hold.
        WorkerHold = 0x35,
        /// Generic continue / decline answer.
        None = 0x41,
        /// Data chunk sent to the worker in answer to a data request.
        Data = 0x42,
        Get = 0x43,
        Put = 0x44,
        Stat = 0x45,
        MimeType = 0x46,
        ListDir = 0x47,
        Mkdir = 0x48,
        Rename = 0x49,
        Copy = 0x4a,
        Del = 0x4b,
        Chmod = 0x4c,
        Special = 0x4d,
        SetModificationTime = 0x4e,
        ReparseConfiguration = 0x4f,
        MetaData = 0x50,
        Symlink = 0x51,
        SubUrl = 0x52,
        MessageBoxAnswer = 0x53,
        ResumeAnswer = 0x54,
        Config = 0x55,
        MultiGet = 0x56,
        Chown = 0x57,
        UserPass = 0x58,
        NetworkStatus = 0x59,
    }
}

impl CommandCode {
    /// Commands that may be processed while an operation is waiting for a
    /// reply from the client.
    pub fn is_administrative(self) -> bool {
        matches!(
            self,
            CommandCode::Host
                | CommandCode::Config
                | CommandCode::MetaData
                | CommandCode::WorkerStatus
                | CommandCode::WorkerConnect
                | CommandCode::WorkerHold
                | CommandCode::MultiGet
                | CommandCode::SubUrl
                | CommandCode::ReparseConfiguration
        )
    }

    /// Commands that start a protocol operation and therefore require exactly
    /// one terminal signal from the worker.
    pub fn is_operation(self) -> bool {
        matches!(
            self,
            CommandCode::Connect
                | CommandCode::Get
                | CommandCode::Put
                | CommandCode::Stat
                | CommandCode::MimeType
                | CommandCode::ListDir
                | CommandCode::Mkdir
                | CommandCode::Rename
                | CommandCode::Copy
                | CommandCode::Del
                | CommandCode::Chmod
                | CommandCode::Chown
                | CommandCode::SetModificationTime
                | CommandCode::Special
                | CommandCode::Symlink
                | CommandCode::MultiGet
        )
    }
}

wire_codes! {
    /// Worker -> client out-of-band progress and metadata.
    InfoCode {
        TotalSize = 0x0a,
        ProcessedSize = 0x0b,
        Speed = 0x0c,
        Redirection = 0x14,
        MimeType = 0x15,
        ErrorPage = 0x16,
        Warning = 0x17,
        GettingFile = 0x18,
        NeedPassword = 0x19,
        InfoMessage = 0x1a,
        MetaData = 0x1b,
        MessageBox = 0x1d,
        Position = 0x1e,
    }
}

wire_codes! {
    /// Worker -> client outcomes.
    ResultCode {
        /// Data chunk; an empty chunk marks the end of the stream.
        Data = 0x64,
        DataReq = 0x65,
        Error = 0x66,
        Connected = 0x67,
        Finished = 0x68,
        StatEntry = 0x69,
        ListEntries = 0x6a,
        Renamed = 0x6b,
        /// Resume offer carrying an offset.
        Resume = 0x6c,
        WorkerStatus = 0x6d,
        WorkerAck = 0x6e,
        NetRequest = 0x6f,
        NetDrop = 0x70,
        NeedSubUrlData = 0x71,
        CanResume = 0x72,
    }
}
