//! Process-wide logging setup shared by the workspace binaries.

mod subscriber;

pub use subscriber::{init, init_with_level};
