use std::net::SocketAddr;

const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:50051";

/// Echo service configuration loaded from environment variables.
#[derive(Debug)]
pub struct EchoConfig {
    /// Address the gRPC server binds (default `0.0.0.0:50051`). Env var: `ECHO_GRPC_ADDR`.
    pub grpc_addr: SocketAddr,
}

impl EchoConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let raw = lookup("ECHO_GRPC_ADDR").unwrap_or_else(|| DEFAULT_GRPC_ADDR.to_owned());
        let grpc_addr = raw
            .parse()
            .with_context(|| format!("invalid ECHO_GRPC_ADDR: {raw}"))?;
        Ok(Self { grpc_addr })
    }
}
