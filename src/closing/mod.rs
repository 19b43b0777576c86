mod model;
mod tracker;

pub use model::*;
pub use tracker::*;
