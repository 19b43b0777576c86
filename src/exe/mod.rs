mod batch;
mod dispatcher;
mod handlers;
mod janitor;
mod pool;
mod queue_processor;

pub use batch::*;
pub use dispatcher::*;
pub use handlers::*;
pub use janitor::*;
pub use pool::*;
pub use queue_processor::*;
