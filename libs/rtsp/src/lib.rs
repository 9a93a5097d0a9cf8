pub mod client;
pub mod error;
pub mod interleaved;
pub mod response;

pub use client::{RtspSession, SessionState};
pub use error::{Error, Result};
pub use interleaved::InterleavedReader;
pub use response::Response;
