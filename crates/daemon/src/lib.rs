/// VeilNet daemon library
///
/// Runs the connection manager of a VeilNet node on a tokio runtime and
/// exposes the directory probe used by the command line.

pub mod node;

pub use node::{DirectoryNode, ProbeReport};
