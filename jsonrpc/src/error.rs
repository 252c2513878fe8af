//! json-rpc error enum which contains all different errors which can happen
//! when encoding requests and parsing replies from a json-rpc server.

use std::{convert::From, fmt, io};

use nix::errno::Errno;

#[derive(Debug, PartialEq)]
pub enum RpcCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    NotFound,
    AlreadyExists,
}

impl RpcCode {
    /// Map a numeric json-rpc error code to its well-known meaning. Errno
    /// style codes used by storage daemons are folded in as well.
    pub fn from_code(val: i32) -> Self {
        match val {
            -32700 => RpcCode::ParseError,
            -32600 => RpcCode::InvalidRequest,
            -32601 => RpcCode::MethodNotFound,
            -32602 => RpcCode::InvalidParams,
            -32603 => RpcCode::InternalError,
            val => {
                if val == -(Errno::ENOENT as i32) {
                    RpcCode::NotFound
                } else if val == -(Errno::EEXIST as i32) {
                    RpcCode::AlreadyExists
                } else {
                    tracing::error!("Unknown json-rpc error code {}", val);
                    RpcCode::InternalError
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum Error {
    InvalidVersion,
    InvalidReplyId,
    /// The reply was not a json object or array of objects.
    InvalidReply,
    /// Encoded request would exceed the maximum send buffer size.
    RequestTooLarge,
    /// The reply contains more json values than the decoder allows.
    ReplyTooLarge,
    /// Request builder used out of order (e.g. end_batch without begin).
    InvalidState(&'static str),
    IoError(io::Error),
    ParseError(serde_json::Error),
    RpcError { code: RpcCode, msg: String },
    GenericError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidVersion => write!(f, "Invalid json-rpc version"),
            Error::InvalidReplyId => write!(f, "Invalid ID of json-rpc reply"),
            Error::InvalidReply => write!(f, "Malformed json-rpc reply"),
            Error::RequestTooLarge => {
                write!(f, "Encoded json-rpc request is too large")
            }
            Error::ReplyTooLarge => {
                write!(f, "Json-rpc reply exceeds the decoder limits")
            }
            Error::InvalidState(what) => {
                write!(f, "Invalid encoder state: {}", what)
            }
            Error::IoError(err) => write!(f, "IO error: {}", err),
            Error::ParseError(err) => write!(f, "Invalid json reply: {}", err),
            Error::RpcError {
                code,
                msg,
            } => write!(f, "Json-rpc error {:?}: {}", code, msg),
            Error::GenericError(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn cause(&self) -> Option<&dyn std::error::Error> {
        None
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::GenericError(err.to_owned())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::GenericError(err)
    }
}
