mod client;
mod client_handler;
mod listener;

pub use client::*;
pub use client_handler::*;
pub use listener::*;
