//! Error type shared by every stage of a mastering job.

use std::fmt;

/// Which input track an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Vocal,
    Beat,
    /// A buffer handed directly to a single stage.
    Input,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Track::Vocal => "vocal",
            Track::Beat => "beat",
            Track::Input => "input",
        };
        f.write_str(name)
    }
}

/// Pipeline stage, used for error context and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Stage {
    Input,
    Measure,
    Gain,
    DuckCurve,
    Mix,
    Limit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Measure => "loudness measurement",
            Stage::Gain => "gain",
            Stage::DuckCurve => "duck curve",
            Stage::Mix => "mix",
            Stage::Limit => "limiter",
        };
        f.write_str(name)
    }
}

/// Errors reported per job. Nothing outside the job is touched before one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MasterError {
    #[error("{track} buffer is empty")]
    EmptyInput { track: Track },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("non-finite sample at {stage}: channel {channel}, frame {frame}")]
    NonFiniteSample {
        stage: Stage,
        channel: usize,
        frame: usize,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("job deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to spawn job thread: {0}")]
    Spawn(String),
}

impl MasterError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MasterError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;
