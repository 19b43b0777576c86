mod ids;
mod messages;
mod task;

pub use ids::*;
pub use messages::*;
pub use task::*;
