pub mod config;
pub mod grpc_server;
