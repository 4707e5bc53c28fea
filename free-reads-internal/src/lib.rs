pub mod config; // gateway config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, metrics)
pub mod quota; // free-view quota engine and its backends
mod testing;
