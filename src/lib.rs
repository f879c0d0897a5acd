//! Fetch Tidal tracks through the lucida.to conversion relay.
//!
//! One invocation handles one track. The service opens a conversion job for
//! the URL and the job is polled until it finishes; the audio payload is then
//! streamed to `<Artist> - <Title>.<ext>` in the chosen directory. Every
//! pipeline step is mirrored as a JSON line on stdout so the run can be
//! driven by other tooling.

pub mod api;
pub mod download;
pub mod error;
pub mod events;

pub use download::{PollPolicy, RunOptions, RunReport, run};
pub use error::{Result, RipError};
