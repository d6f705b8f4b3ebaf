//! pylon-server: MTProto server with a demo `echo` function.
//!
//! # Run
//! ```text
//! cargo run -p pylon-server -- pylon.toml
//! PYLON_CONFIG=pylon.toml cargo run -p pylon-server
//! ```
//!
//! Without a config file the server listens on `0.0.0.0:8443` with a
//! freshly generated RSA key, whose PEM is printed at startup.

use std::sync::Arc;

use pylon_server::{HandlerError, RpcError, RpcRegistry, Server, ServerConfig, handler_fn, keys};
use pylon_tl::{Object, Schema, Value};
use tokio::net::TcpListener;

/// The user schema served by the demo.
const DEMO_TL: &str = "
echoed text:string = Echoed;
sum total:long = Sum;

---functions---

echo text:string = Echoed;
add numbers:Vector<long> = Sum;
";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("pylon_server=info,pylon_mtproto=info"))
        .init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

fn demo_registry() -> RpcRegistry {
    RpcRegistry::new()
        .with(
            "echo",
            handler_fn(|_ctx, call| async move {
                let text = call.str("text").ok_or_else(|| RpcError::bad_request("TEXT_EMPTY"))?;
                Ok::<Value, HandlerError>(Object::new("echoed").with("text", text).into())
            }),
        )
        .with(
            "add",
            handler_fn(|_ctx, call| async move {
                let numbers = call.vector("numbers").unwrap_or_default();
                let total = numbers
                    .iter()
                    .filter_map(|n| n.as_long())
                    .try_fold(0i64, i64::checked_add)
                    .ok_or_else(|| HandlerError::from(RpcError::bad_request("SUM_OVERFLOW")))?;
                Ok::<Value, HandlerError>(Object::new("sum").with("total", total).into())
            }),
        )
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("PYLON_CONFIG").ok());
    let config = match &path {
        Some(path) => {
            tracing::info!("[pylon] loading {path}");
            ServerConfig::from_toml_file(path)?
        }
        None => ServerConfig::default(),
    };

    let generated = config.rsa_keys.is_empty();
    let ring = keys::ensure_key(config.rsa_key_ring()?)?;
    let schema = Arc::new(Schema::from_tl(DEMO_TL)?);
    let server = Server::from_config(&config, ring, Some(schema), demo_registry())?;

    if generated {
        for pem in server.public_keys()? {
            println!("{}", String::from_utf8_lossy(&pem));
        }
    }

    let mut listeners = Vec::with_capacity(config.listen.len());
    for addr in &config.listen {
        listeners.push(TcpListener::bind(addr).await?);
    }

    let token = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    server.run(listeners).await?;
    Ok(())
}
