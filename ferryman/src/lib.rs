#[macro_use]
extern crate tracing;

pub mod bandwidth;
pub mod cdn;
pub mod cipher_stream;
pub mod config;
pub mod contention;
pub mod crypto;
pub mod dialer;
pub mod error;
pub mod install;
pub mod juicity;
pub mod log;
pub mod metadata;
pub mod msg;
pub mod outbound;
pub mod passage;
pub mod pool;
pub mod registrar;
pub mod relay;
pub mod replay;
pub mod service;
pub mod ss;
pub mod store;
pub mod task;
pub mod tls;
pub mod update;
pub mod vmess;

pub use error::ProxyError;
