pub mod adapter;
pub mod envelope;
pub mod error;
pub mod grouper;
pub mod probe;
pub mod redact;
pub mod runner;
pub mod types;
mod util;

pub use adapter::*;
pub use envelope::*;
pub use error::*;
pub use grouper::*;
pub use probe::*;
pub use redact::*;
pub use runner::*;
pub use types::*;
pub use util::render_command_preview;
