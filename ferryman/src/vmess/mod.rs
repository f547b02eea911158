//! VMess/AEAD front-end (TCP and TLS+gRPC transports).

pub mod aead;
pub mod codec;
pub mod grpc;
mod outbound;
mod server;

pub use outbound::{VmessOutbound, VmessTransport};
pub use server::{VmessPassage, VmessServer};
