//! Agent Directory Daemon Library
//!
//! # Modules
//!
//! - [`config`]: clap configuration
//! - [`publication`]: database-backed publication pipeline
//! - [`grpc`]: Store and Routing gRPC services
//! - [`server`]: daemon bootstrap
//! - [`proto`]: generated protobuf types

pub mod config;
pub mod grpc;
pub mod publication;
pub mod server;

#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("dir.v1");
}
