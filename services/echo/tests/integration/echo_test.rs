use grpctest::TestServer;
use grpctest_proto::echo::v1::EchoRequest;
use grpctest_proto::echo::v1::echo_service_client::EchoServiceClient;
use grpctest_proto::echo::v1::echo_service_server::EchoServiceServer;

use grpctest_echo::grpc_server::EchoGrpcServer;

fn started_server() -> TestServer {
    let server = TestServer::new();
    server.add_service(EchoServiceServer::new(EchoGrpcServer));
    server.start();
    server
}

#[tokio::test]
async fn should_echo_message_unchanged() {
    let server = started_server();
    let _guard = server.close_on_cleanup();

    let conn = server.client_conn().await.unwrap();
    let mut client = EchoServiceClient::new(conn.channel());

    let want = "Hello, world";
    let resp = client
        .echo(EchoRequest {
            message: want.to_owned(),
        })
        .await
        .unwrap();

    assert_eq!(resp.into_inner().message, want);
}

#[tokio::test]
async fn should_echo_empty_message() {
    let server = started_server();
    let _guard = server.close_on_cleanup();

    let conn = server.client_conn().await.unwrap();
    let mut client = EchoServiceClient::new(conn.channel());

    let resp = client
        .echo(EchoRequest {
            message: String::new(),
        })
        .await
        .unwrap();

    assert_eq!(resp.into_inner().message, "");
}

#[tokio::test]
async fn should_fail_after_server_close() {
    let server = started_server();

    let conn = server.client_conn().await.unwrap();
    let mut client = EchoServiceClient::new(conn.channel());
    server.close().await;

    let result = client
        .echo(EchoRequest {
            message: "Hello, world".to_owned(),
        })
        .await;

    assert!(result.is_err(), "expected RPC to fail after close");
}
