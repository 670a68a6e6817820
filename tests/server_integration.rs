//! Server loop integration tests over real sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use muxrpc::{
    streaming, unary, CancellationToken, Config, Conn, Description, Error, Method, MethodToken,
    Result, Server, ServerConfig, Stream,
};
use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Text {
    data: String,
}

#[derive(Default)]
struct Service {
    started: Notify,
    canceled: Notify,
}

async fn echo(_: Arc<Service>, input: Text) -> Result<Text> {
    Ok(input)
}

async fn hang(svc: Arc<Service>, stream: Stream) -> Result<()> {
    svc.started.notify_one();
    stream.context().cancelled().await;
    svc.canceled.notify_one();
    Err(Error::canceled("server stopping"))
}

struct ServiceDescription;

impl Description<Service> for ServiceDescription {
    fn num_methods(&self) -> usize {
        2
    }

    fn method(&self, n: usize) -> Option<Method<Service>> {
        match n {
            0 => Some(Method::new("Echo", MethodToken("svc::echo"), unary(echo))),
            1 => Some(Method::new("Hang", MethodToken("svc::hang"), streaming(hang))),
            _ => None,
        }
    }
}

fn server(config: &Config) -> (Server, Arc<Service>) {
    let service = Arc::new(Service::default());
    let mut server = Server::with_config(config);
    server.register(service.clone(), &ServiceDescription).unwrap();
    (server, service)
}

/// Helper: serve on an ephemeral TCP port, return (addr, service, ctx, serve task).
async fn start_tcp(
    config: Config,
) -> (
    std::net::SocketAddr,
    Arc<Service>,
    CancellationToken,
    tokio::task::JoinHandle<Result<()>>,
) {
    let (server, service) = server(&config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = CancellationToken::new();
    let handle = tokio::spawn({
        let ctx = ctx.clone();
        async move { server.serve(&ctx, listener).await }
    });
    (addr, service, ctx, handle)
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn call_echo(conn: &Conn, data: &str) -> Result<String> {
    let mut out = Text::default();
    let input = Text {
        data: data.to_string(),
    };
    conn.invoke(&CancellationToken::new(), "Echo", &input, &mut out)
        .await?;
    Ok(out.data)
}

#[tokio::test]
async fn test_tcp_echo() {
    let (addr, _svc, ctx, handle) = start_tcp(Config::default()).await;

    let conn = Conn::new(TcpStream::connect(addr).await.unwrap()).unwrap();
    assert_eq!(within(call_echo(&conn, "hi")).await.unwrap(), "hi");

    // A second connection is served independently.
    let other = Conn::new(TcpStream::connect(addr).await.unwrap()).unwrap();
    assert_eq!(within(call_echo(&other, "there")).await.unwrap(), "there");
    assert_ne!(conn.id(), other.id());

    ctx.cancel();
    within(handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_returns_promptly_and_cancels_handlers() {
    let (addr, svc, ctx, handle) = start_tcp(Config::default()).await;

    let conn = Conn::new(TcpStream::connect(addr).await.unwrap()).unwrap();
    let stream = within(conn.new_stream(&CancellationToken::new(), "Hang"))
        .await
        .unwrap();
    within(svc.started.notified()).await;

    ctx.cancel();
    within(handle).await.unwrap().unwrap();
    within(svc.canceled.notified()).await;

    // The client sees its stream end once the server drops the connection.
    let mut out = Text::default();
    let err = within(stream.msg_recv(&mut out)).await.unwrap_err();
    assert!(err.is_canceled(), "unexpected error: {err}");
    within(conn.closed()).await;
}

#[tokio::test]
async fn test_connections_beyond_limit_are_rejected() {
    let config = Config {
        server: ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        },
        ..Config::default()
    };
    let (addr, _svc, ctx, _handle) = start_tcp(config).await;

    let first = Conn::new(TcpStream::connect(addr).await.unwrap()).unwrap();
    assert_eq!(within(call_echo(&first, "one")).await.unwrap(), "one");

    let second = Conn::new(TcpStream::connect(addr).await.unwrap()).unwrap();
    within(second.closed()).await;
    assert!(within(call_echo(&second, "two")).await.is_err());

    // The first connection is unaffected.
    assert_eq!(within(call_echo(&first, "still")).await.unwrap(), "still");
    ctx.cancel();
}

#[tokio::test]
async fn test_listener_error_is_returned() {
    struct Broken;

    #[async_trait::async_trait]
    impl muxrpc::Listener for Broken {
        type Io = TcpStream;

        async fn accept(&self) -> std::io::Result<(TcpStream, String)> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "listener gone"))
        }
    }

    let (server, _svc) = server(&Config::default());
    let err = within(server.serve(&CancellationToken::new(), Broken))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("listener gone"));
}

/// Hands out whatever the test feeds it, in order.
struct Scripted {
    next: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<std::io::Result<DuplexStream>>>,
}

#[async_trait::async_trait]
impl muxrpc::Listener for Scripted {
    type Io = DuplexStream;

    async fn accept(&self) -> std::io::Result<(DuplexStream, String)> {
        match self.next.lock().await.recv().await {
            Some(accepted) => accepted.map(|io| (io, "scripted".to_string())),
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "script ended")),
        }
    }
}

#[tokio::test]
async fn test_listener_error_closes_accepted_connections() {
    let (feed, next) = tokio::sync::mpsc::channel(4);
    let listener = Scripted {
        next: tokio::sync::Mutex::new(next),
    };
    let (server, _svc) = server(&Config::default());
    let handle = tokio::spawn(async move {
        server.serve(&CancellationToken::new(), listener).await
    });

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    feed.send(Ok(server_io)).await.unwrap();
    let conn = Conn::new(client_io).unwrap();
    assert_eq!(within(call_echo(&conn, "before")).await.unwrap(), "before");

    let broken = std::io::Error::new(std::io::ErrorKind::Other, "listener gone");
    feed.send(Err(broken)).await.unwrap();
    let err = within(handle).await.unwrap().unwrap_err();
    assert!(err.to_string().contains("listener gone"));

    // The connection accepted before the failure goes down with the server.
    within(conn.closed()).await;
    assert!(within(call_echo(&conn, "after")).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_echo() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("muxrpc.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    let (server, _svc) = server(&Config::default());
    let ctx = CancellationToken::new();
    let handle = tokio::spawn({
        let ctx = ctx.clone();
        async move { server.serve(&ctx, listener).await }
    });

    let transport = tokio::net::UnixStream::connect(&path).await.unwrap();
    let conn = Conn::new(transport).unwrap();
    assert_eq!(within(call_echo(&conn, "over unix")).await.unwrap(), "over unix");

    within(conn.close()).await.unwrap();
    ctx.cancel();
    within(handle).await.unwrap().unwrap();
}
