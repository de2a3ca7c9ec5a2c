// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod ids;
pub mod model;
pub mod notify;
pub mod retention;
pub mod shutdown;
pub mod state;
pub mod store;
