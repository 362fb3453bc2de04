//! Interactive CLI plumbing: the channel seam, the bounded read primitive,
//! vendor token tables and the IOS automaton built on top of them.

pub mod ios;
pub mod read;
pub mod tokens;

use crate::error::TransportError;
use async_trait::async_trait;

pub use ios::{CliMode, IosCli, IosSettings, RouteCheck};
pub use read::{read_until, Capture, ReadEnd, ReadWindow};
pub use tokens::{ping_verdict, Pattern, Scan, TokenTable};

/// A bidirectional byte stream to an interactive shell.
///
/// `recv` must be cancel-safe: the read primitive drops it on timeout.
#[async_trait]
pub trait CliChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Next chunk of output, `None` once the remote side closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&mut self);

    /// Host label for logs and errors.
    fn peer(&self) -> &str;
}
