use anyhow::Context as _;
use tracing::info;

use grpctest_proto::echo::v1::echo_service_server::EchoServiceServer;

use grpctest_echo::config::EchoConfig;
use grpctest_echo::grpc_server::EchoGrpcServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = EchoConfig::from_env()?;

    info!("echo gRPC server listening on {}", config.grpc_addr);
    tonic::transport::Server::builder()
        .add_service(EchoServiceServer::new(EchoGrpcServer))
        .serve(config.grpc_addr)
        .await
        .context("gRPC server error")?;

    Ok(())
}
