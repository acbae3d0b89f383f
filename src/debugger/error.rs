use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debuggee already run")]
    AlreadyRun,
    #[error("program is not being started")]
    NotStarted,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // --------------------------------- configuration errors --------------------------------------
    #[error("invalid launch/attach configuration: {0}")]
    Configuration(String),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("missing required argument '{0}'")]
    MissingArgument(&'static str),

    // --------------------------------- transport errors ------------------------------------------
    #[error("transport: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    ConnectionClosed,

    // --------------------------------- debuggee IPC errors ---------------------------------------
    #[error("ipc: {0}")]
    Ipc(String),
    #[error("bad IPC frame: {0}")]
    IpcFrame(String),
    #[error("command {0} timed out")]
    Timeout(u64),
    #[error("debugger shutdown")]
    Shutdown,

    // --------------------------------- debugger entity not found ---------------------------------
    #[error("frame {0} not found (stale after resume?)")]
    FrameNotFound(i64),
    #[error("invalid variable reference: {0}")]
    VariableRefNotFound(i64),
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("no exception info available for thread {0}")]
    NoExceptionInfo(i64),
    #[error("source not found: {0}")]
    SourceNotFound(String),

    // --------------------------------- evaluation errors -----------------------------------------
    #[error("{0}")]
    Eval(String),
    #[error("cannot assign to {0}")]
    BadAssignTarget(String),

    // --------------------------------- debuggee process errors -----------------------------------
    #[error("debuggee: {0}")]
    Debuggee(String),

    // --------------------------------- probe injection errors ------------------------------------
    #[error("bytecode validation rejected: {0}")]
    Validation(String),

    // --------------------------------- script front end errors -----------------------------------
    #[error("script parse error at line {line}: {message}")]
    ScriptParse { line: u32, message: String },
}

impl Error {
    /// Return a hint to the session - continue serving requests after this
    /// error or tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(_) | Error::ConnectionClosed => true,
            Error::Ipc(_) | Error::IpcFrame(_) => true,
            _ => false,
        }
    }
}

/// Transforms `Result` into `Option` and logs the error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                ::log::warn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(Error::Transport("broken pipe".into()).is_fatal());
        assert!(Error::Ipc("lost child".into()).is_fatal());
        assert!(!Error::FrameNotFound(3).is_fatal());
        assert!(!Error::Timeout(7).is_fatal());
        assert!(!Error::Eval("nope".into()).is_fatal());
    }
}
