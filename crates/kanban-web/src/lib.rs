pub mod attempts;
pub mod error;
pub mod model;
pub mod registry;
pub mod routes;
pub mod server;
pub mod sink;
pub mod state;

pub use attempts::*;
pub use error::*;
pub use model::*;
pub use registry::AttemptRegistry;
pub use routes::*;
pub use server::*;
pub use sink::*;
pub use state::*;
