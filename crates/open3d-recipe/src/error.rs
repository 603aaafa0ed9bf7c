use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid option '{option}': {reason}")]
    Configuration { option: String, reason: String },

    #[error("patch '{patch}' failed on {}: {reason}", .path.display())]
    Patch {
        patch: String,
        path: PathBuf,
        reason: String,
    },

    // An external tool exited unsuccessfully. `output` holds the tail of
    // what it printed.
    #[error("{phase} phase failed: {status}")]
    Build {
        phase: String,
        status: String,
        code: Option<i32>,
        output: Vec<String>,
    },

    #[error("cannot publish package info from {}: {reason}", .path.display())]
    Publish { path: PathBuf, reason: String },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn patch(
        patch: impl Into<String>,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Patch {
            patch: patch.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Publish {
            path: path.into(),
            reason: reason.into(),
        }
    }

}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
