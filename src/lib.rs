pub mod api;
pub mod audit;
pub mod clients;
pub mod clock;
pub mod closing;
pub mod contaflix;
pub mod context;
pub mod exe;
pub mod io;
pub mod messaging;
pub mod notifications;
pub mod options;
pub mod payments;
pub mod period;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod signal_listener;
pub mod store;
pub mod tcp;
