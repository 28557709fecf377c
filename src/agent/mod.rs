//! External agent process boundary: spawning, line streaming, and
//! stream-json decoding.

pub mod driver;
pub mod stream;

pub use driver::{AgentDriver, AgentProcess};
pub use stream::StreamParser;
