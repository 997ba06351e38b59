//! Generated protobuf and tonic code for the test fixtures.

pub mod echo {
    pub mod v1 {
        tonic::include_proto!("echo.v1");
    }
}
