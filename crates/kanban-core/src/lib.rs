pub mod config;
pub mod conversation;
pub mod events;
pub mod state;
pub mod types;
pub mod validation;

pub use config::*;
pub use conversation::*;
pub use events::*;
pub use state::*;
pub use types::*;
pub use validation::*;
