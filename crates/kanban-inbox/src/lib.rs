pub mod classify;
pub mod error;
pub mod model;
pub mod pass;
pub mod source;

pub use classify::*;
pub use error::*;
pub use model::*;
pub use pass::*;
pub use source::*;
