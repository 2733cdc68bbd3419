//! The certward library.
//!
//! This crate contains all the moving parts of certward, a certificate
//! validation helper for intercepting TLS proxies. The application itself,
//! via `main.rs`, is only a very tiny frontend.

pub use self::config::Config;
pub use self::error::{ExitError, Failed};
pub use self::operation::Operation;

pub mod cert;
pub mod config;
pub mod crl;
pub mod engine;
pub mod error;
pub mod http;
pub mod ocsp;
pub mod operation;
pub mod proto;
pub mod server;
pub mod store;
pub mod utils;
pub mod validate;
