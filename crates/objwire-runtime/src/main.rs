#![warn(missing_docs)]
//! objwire echo server and client

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use objwire_runtime::{
    Communicator, Dispatcher, FixedEndpoints, Identity, IncomingRequest, OperationMode, OutgoingResponse,
    RuntimeConfig, TcpAcceptor, TcpConnector,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

struct Echo;

#[async_trait]
impl Dispatcher for Echo {
    async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
        match request.operation.as_str() {
            "echo" => OutgoingResponse::ok(request.params),
            "ice_ping" => OutgoingResponse::ok(Vec::<u8>::new()),
            _ => OutgoingResponse::operation_not_exist(),
        }
    }
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    match std::env::var_os("OBJWIRE_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            tracing::info!("Loading config from {}", path.display());
            RuntimeConfig::from_file(&path)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: objwire-echo serve <addr> | objwire-echo call <addr> <message>");
        std::process::exit(1);
    }
    let communicator = Communicator::new(load_config()?)?;

    match args[1].as_str() {
        "serve" => {
            let acceptor = TcpAcceptor::bind(&args[2]).await?;
            tracing::info!("objwire echo server listening on {}", acceptor.bound_addr()?);
            let adapter = communicator.create_object_adapter("echo", Arc::new(Echo));
            adapter.serve(Arc::new(acceptor));
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
        }
        "call" => {
            let message = args.get(3).cloned().unwrap_or_default();
            let proxy = communicator.create_proxy(
                Identity::new("echo"),
                Arc::new(FixedEndpoints::new(vec![Arc::new(TcpConnector::new(args[2].clone()))])),
            );
            let reply = proxy
                .invoke("echo", OperationMode::Idempotent, message.as_bytes(), None)
                .await?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        other => anyhow::bail!("unknown command: {}", other),
    }

    communicator.destroy().await;
    Ok(())
}
