use tonic::{Request, Response, Status};

use grpctest_proto::echo::v1::{EchoRequest, EchoResponse, echo_service_server::EchoService};

/// `echo.v1.EchoService`: replies with the request's message unchanged.
#[derive(Clone, Default)]
pub struct EchoGrpcServer;

#[tonic::async_trait]
impl EchoService for EchoGrpcServer {
    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        let message = request.into_inner().message;
        tracing::debug!(len = message.len(), "echo");
        Ok(Response::new(EchoResponse { message }))
    }
}
