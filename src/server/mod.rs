//! Server loop: accept connections, dispatch inbound streams to handlers.
//!
//! Each accepted transport gets its own `Conn` and task. Each inbound stream
//! runs its handler on its own task, so a slow handler never stalls the other
//! streams of the connection.

pub mod dispatch;
pub mod listener;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::conn::{Conn, Transport};
use crate::stream::Stream;
use crate::types::{Config, ConnConfig, Error, Result};

pub use dispatch::{
    streaming, unary, Description, DispatchTable, Handler, HandlerFuture, Method, MethodToken,
};
pub use listener::Listener;

/// RPC server.
#[derive(Debug, Clone)]
pub struct Server {
    table: Arc<DispatchTable>,
    conn_config: ConnConfig,
    max_connections: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            table: Arc::new(DispatchTable::new()),
            conn_config: config.conn.clone(),
            max_connections: config.server.max_connections,
        }
    }

    /// Register the methods of `desc` against the service instance `srv`.
    ///
    /// Must be called before serving; duplicate rpc names or method tokens
    /// fail with an internal error and register nothing.
    pub fn register<S>(&mut self, srv: Arc<S>, desc: &dyn Description<S>) -> Result<()>
    where
        S: Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.table).register(srv, desc)
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Accept connections from `listener` until `ctx` is canceled.
    ///
    /// Returns `Ok(())` on cancellation without waiting for in-flight
    /// handlers; their connections are closed and their streams canceled.
    /// A listener error is logged and returned, and closes the connections
    /// accepted so far the same way.
    pub async fn serve<L: Listener>(&self, ctx: &CancellationToken, listener: L) -> Result<()> {
        self.conn_config.validate()?;
        // Canceled on every way out of this function.
        let serving = ctx.child_token();
        let _stop_connections = serving.clone().drop_guard();
        let conn_semaphore = Arc::new(Semaphore::new(self.max_connections));
        tracing::info!(
            rpcs = self.table.len(),
            max_connections = self.max_connections,
            "server accepting connections"
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::info!("server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (transport, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::error!(error = %err, "accept failed, stopping server");
                            return Err(err.into());
                        }
                    };

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.max_connections,
                            );
                            drop(transport);
                            continue;
                        }
                    };

                    tracing::debug!(
                        "connection from {} (active={})",
                        peer,
                        self.max_connections - conn_semaphore.available_permits(),
                    );
                    let table = self.table.clone();
                    let config = self.conn_config.clone();
                    let ctx = serving.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(table, config, ctx, transport).await {
                            tracing::warn!("connection from {} ended: {}", peer, err);
                        }
                        drop(permit);
                    });
                }
            }
        }
        Ok(())
    }

    /// Serve a single already established transport until the peer goes
    /// away or `ctx` is canceled.
    pub async fn serve_conn<T: Transport>(&self, ctx: &CancellationToken, transport: T) -> Result<()> {
        handle_connection(self.table.clone(), self.conn_config.clone(), ctx.clone(), transport).await
    }
}

async fn handle_connection<T: Transport>(
    table: Arc<DispatchTable>,
    config: ConnConfig,
    ctx: CancellationToken,
    transport: T,
) -> Result<()> {
    let (conn, mut incoming) = Conn::accept(transport, config)?;
    tracing::debug!(conn = %conn.id(), "serving connection");

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            next = incoming.recv() => {
                let Some(stream) = next else {
                    break;
                };
                let span = tracing::debug_span!("rpc", conn = %conn.id(), stream = %stream.id(), rpc = stream.rpc());
                tokio::spawn(dispatch(table.clone(), stream).instrument(span));
            }
        }
    }

    let cause = conn.cause();
    conn.close().await?;
    match cause {
        Some(err) if !err.is_canceled() => Err(err),
        _ => {
            tracing::debug!(conn = %conn.id(), "connection closed");
            Ok(())
        }
    }
}

/// Run the handler for one inbound stream and write its outcome back.
async fn dispatch(table: Arc<DispatchTable>, stream: Stream) {
    let Some(entry) = table.lookup(stream.rpc()).cloned() else {
        tracing::warn!(rpc = stream.rpc(), "unknown rpc");
        let err = Error::protocol(format!("unknown rpc: {}", stream.rpc()));
        let _ = stream.send_error(&err);
        return;
    };

    let call = AssertUnwindSafe(async { entry.call(stream.clone()).await });
    match call.catch_unwind().await {
        Ok(Ok(Some(output))) => {
            if let Err(err) = stream.msg_send(&*output).await {
                tracing::debug!(service = entry.service(), error = %err, "response not sent");
            }
            let _ = stream.close();
        }
        Ok(Ok(None)) => {
            let _ = stream.close();
        }
        Ok(Err(err)) => {
            if err.is_canceled() {
                tracing::debug!(service = entry.service(), error = %err, "handler canceled");
            } else {
                tracing::warn!(service = entry.service(), error = %err, "handler failed");
            }
            let _ = stream.send_error(&err);
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(service = entry.service(), panic = %reason, "handler panicked");
            let _ = stream.send_error(&Error::internal(format!("handler panicked: {}", reason)));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorClass;
    use serde::{Deserialize, Serialize};
    use tracing_test::traced_test;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Text {
        data: String,
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_rpc_is_logged_and_reported() {
        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let server = Server::new();
        let ctx = CancellationToken::new();
        let serving = tokio::spawn({
            let server = server.clone();
            let ctx = ctx.clone();
            async move { server.serve_conn(&ctx, server_io).await }
        });

        let conn = Conn::new(client).unwrap();
        let mut out = Text::default();
        let err = conn
            .invoke(&CancellationToken::new(), "Missing", &Text::default(), &mut out)
            .await
            .unwrap_err();
        assert!(err.is(ErrorClass::Protocol));
        assert!(err.to_string().contains("unknown rpc: Missing"));
        assert!(logs_contain("unknown rpc"));

        ctx.cancel();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
