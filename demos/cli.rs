use std::net::SocketAddr;

use clap::Parser;
use n0_error::{Result, anyerr};
use tokio::net::TcpListener;
use vhost_relay::{EndpointConfig, HttpMessage, ProxyServer, RouteEntry};

#[derive(Parser)]
enum Cli {
    /// Spawn a local HTTP origin server.
    Origin {
        #[clap(short, long, default_value_t = 0)]
        port: u16,
    },
    /// Spawn the proxy with host=addr routes (use `*` for the wildcard).
    Proxy {
        #[clap(short, long, default_value_t = 0)]
        port: u16,
        /// Routes as `hostname=host:port`, repeatable.
        #[clap(short, long = "route")]
        routes: Vec<String>,
        /// Tag proxied requests with an `x-proxied-by` header.
        #[clap(long)]
        tag_requests: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Origin { port } => cmd_origin(port).await,
        Cli::Proxy {
            port,
            routes,
            tag_requests,
        } => cmd_proxy(port, routes, tag_requests).await,
    }
}

async fn cmd_origin(port: u16) -> Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let addr = listener.local_addr()?;
    println!("origin listening on {addr}");
    tokio::select! {
        res = origin_server(listener) => res,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}

async fn cmd_proxy(port: u16, routes: Vec<String>, tag_requests: bool) -> Result<()> {
    let mut entries = Vec::new();
    for route in routes {
        let (hostname, addr) = route
            .split_once('=')
            .ok_or_else(|| anyerr!("route must look like hostname=host:port, got {route:?}"))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| anyerr!("invalid backend address {addr:?}: {err}"))?;
        entries.push(RouteEntry {
            hostnames: vec![hostname.to_string()],
            endpoint: EndpointConfig::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
        });
    }
    let server = ProxyServer::new(entries).map_err(|err| anyerr!(err))?;
    if tag_requests {
        server.add_request_interceptor(|msg: &mut HttpMessage| {
            msg.headers.append(
                http::HeaderName::from_static("x-proxied-by"),
                http::HeaderValue::from_static("vhost-relay"),
            );
        });
    }
    server.start();

    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let addr = listener.local_addr()?;
    println!("proxy listening on {addr} ({} routes)", server.routes().len());
    tokio::select! {
        res = server.serve(listener) => res,
        _ = tokio::signal::ctrl_c() => {
            server.shutdown();
            Ok(())
        }
    }
}

async fn origin_server(listener: TcpListener) -> Result<()> {
    use std::convert::Infallible;

    use http_body_util::Full;
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                let body = format!("hello from {addr}: {} {}", req.method(), req.uri().path());
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
            });
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });
    }
}
