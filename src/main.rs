//! muxrpc echo server and client.
//!
//! `muxrpc-echo serve` runs a demo server with two rpcs:
//! - Echo: unary, returns its input
//! - Sum: streaming, adds up `{value}` messages and replies with `{sum}`
//!
//! `muxrpc-echo call <text>` invokes Echo against a running server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use muxrpc::{
    streaming, unary, CancellationToken, Config, Conn, Description, Error, Method, MethodToken,
    Server, Stream,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(name = "muxrpc-echo", about = "muxrpc demo server and client")]
struct Cli {
    /// JSON config file.
    #[arg(long, env = "MUXRPC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve Echo and Sum until interrupted.
    Serve {
        /// Listen address, overrides the config.
        #[arg(long)]
        addr: Option<String>,
    },
    /// Invoke Echo once and print the reply.
    Call {
        /// Server address, overrides the config.
        #[arg(long)]
        addr: Option<String>,
        text: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Text {
    data: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Value {
    value: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sum {
    sum: i64,
}

#[derive(Debug, Default)]
struct Demo;

async fn echo(_: Arc<Demo>, input: Text) -> muxrpc::Result<Text> {
    Ok(input)
}

async fn sum(_: Arc<Demo>, stream: Stream) -> muxrpc::Result<()> {
    let mut total = 0_i64;
    let mut next = Value::default();
    loop {
        match stream.msg_recv(&mut next).await {
            Ok(()) => total = total.saturating_add(next.value),
            Err(Error::EndOfStream) => break,
            Err(err) => return Err(err),
        }
    }
    stream.msg_send(&Sum { sum: total }).await
}

struct DemoDescription;

impl Description<Demo> for DemoDescription {
    fn num_methods(&self) -> usize {
        2
    }

    fn method(&self, n: usize) -> Option<Method<Demo>> {
        match n {
            0 => Some(Method::new("Echo", MethodToken("demo::echo"), unary(echo))),
            1 => Some(Method::new("Sum", MethodToken("demo::sum"), streaming(sum))),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env();

    muxrpc::observability::init_tracing_with(&config.observability);

    match cli.command {
        Command::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.listen_addr.clone());
            let mut server = Server::with_config(&config);
            server.register(Arc::new(Demo), &DemoDescription)?;

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("muxrpc echo server listening on {}", listener.local_addr()?);

            let ctx = CancellationToken::new();
            tokio::spawn({
                let ctx = ctx.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        ctx.cancel();
                    }
                }
            });
            server.serve(&ctx, listener).await?;
        }
        Command::Call { addr, text } => {
            let addr = addr.unwrap_or_else(|| config.server.listen_addr.clone());
            let transport = tokio::net::TcpStream::connect(&addr).await?;
            let conn = Conn::with_config(transport, config.conn.clone())?;
            let mut out = Text::default();
            conn.invoke(&CancellationToken::new(), "Echo", &Text { data: text }, &mut out)
                .await?;
            println!("{}", out.data);
            conn.close().await?;
        }
    }
    Ok(())
}
