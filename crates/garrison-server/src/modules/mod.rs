//! Modules bundled with the server.

mod api;

pub use api::ApiModule;
