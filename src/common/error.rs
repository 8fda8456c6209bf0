use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("idle queue wait exceeded")]
    PoolTimeout,

    #[error("no idle worker and no free port")]
    PoolExhausted,

    #[error("engine spawn failed: {0}")]
    EngineSpawnFailed(String),

    #[error("engine reconfigure failed: {0}")]
    EngineReconfigFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short kind tag used when folding an error into a result record.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::PoolTimeout => "pool-timeout",
            Error::PoolExhausted => "pool-exhausted",
            Error::EngineSpawnFailed(_) => "engine-spawn-failed",
            Error::EngineReconfigFailed(_) => "engine-reconfig-failed",
            Error::Timeout(_) => "timeout",
            Error::UnsupportedProtocol(_) => "unsupported-protocol",
            Error::Other(_) => "other",
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
