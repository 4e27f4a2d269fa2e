pub mod error;
pub mod records;
mod source;
pub mod store;

pub use error::*;
pub use records::*;
pub use store::*;
