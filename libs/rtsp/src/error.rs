use thiserror::Error;

/// Fatal failures surfaced to the caller. Write failures are logged at the
/// call site and show up here as the read error that follows them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read from server: {0}")]
    Read(#[from] std::io::Error),

    #[error("no session token, issue SETUP before PLAY")]
    NoSession,

    #[error("interleaved framing desynchronised after skipping {skipped} bytes")]
    Desync { skipped: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
