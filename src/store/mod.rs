mod error;
mod in_memory;
mod store;
mod store_state;

pub use error::*;
pub use in_memory::*;
pub use store::*;
pub use store_state::*;
