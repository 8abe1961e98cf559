use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::{HeaderName, HeaderValue};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    Callbacks, EndpointConfig, HttpMessage, ProxyServer, RouteEntry, Side, Status,
    parse::parse_head,
};

// -- Test helpers --

/// Idle window after which the capture backend considers a request drained.
const READ_IDLE: Duration = Duration::from_millis(200);

/// How long any single test read may take before the test is considered hung.
const REPLY_DEADLINE: Duration = Duration::from_secs(3);

fn tcp_route(hostnames: &[&str], addr: SocketAddr) -> RouteEntry {
    RouteEntry {
        hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
        endpoint: EndpointConfig::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
        },
    }
}

/// Spawns a started proxy serving the given routes.
async fn spawn_proxy(
    entries: Vec<RouteEntry>,
) -> Result<(SocketAddr, ProxyServer, AbortOnDropHandle<Result<()>>)> {
    let server = ProxyServer::new(entries).map_err(|err| anyerr!(err))?;
    server.start();
    let listener = TcpListener::bind("localhost:0").await?;
    let proxy_addr = listener.local_addr()?;
    debug!(%proxy_addr, "spawned proxy");
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };
    Ok((proxy_addr, server, AbortOnDropHandle::new(task)))
}

/// What a test origin puts in its response body.
#[derive(Clone, Copy)]
enum OriginReply {
    /// `{label} {METHOD} {PATH}`, so tests can tell origins and routes apart.
    RequestLine,
    /// `{label} {METHOD} {PATH}: {BODY}`, proving the body made it through.
    WithBody,
}

/// Spawns a hyper-backed origin server that answers every request with a
/// description of what it saw. Serving real HTTP (content-length framing,
/// keep-alive) keeps the proxy honest about interop, unlike the raw-TCP
/// backends below.
async fn spawn_origin(
    label: &'static str,
    reply: OriginReply,
) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    use hyper::{server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;

    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    debug!(%label, %addr, "spawned origin server");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req| origin_reply(label, reply, req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

async fn origin_reply(
    label: &'static str,
    reply: OriginReply,
    req: hyper::Request<hyper::body::Incoming>,
) -> std::result::Result<hyper::Response<http_body_util::Full<bytes::Bytes>>, std::convert::Infallible>
{
    use http_body_util::BodyExt;

    let mut line = format!("{label} {} {}", req.method(), req.uri().path());
    if matches!(reply, OriginReply::WithBody) {
        let body = req
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        line.push_str(": ");
        line.push_str(&String::from_utf8_lossy(&body));
    }
    Ok(hyper::Response::new(http_body_util::Full::new(
        bytes::Bytes::from(line),
    )))
}

/// Spawns a backend that records every byte it receives and answers each
/// connection with a fixed response once the request head is complete.
async fn spawn_capture_backend(
    response: &'static [u8],
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                // Drain briefly so body bytes pipelined behind the head are
                // captured too, even when they arrive as separate chunks.
                while let Ok(Ok(n)) = stream.read(&mut buf).timeout(READ_IDLE).await {
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&buf[..n]);
                }
                tx.send(seen).ok();
                stream.write_all(response).await.ok();
            });
        }
    });
    Ok((addr, rx, AbortOnDropHandle::new(task)))
}

/// Spawns a backend that accepts connections and never writes, keeping them
/// open until the peer goes away.
async fn spawn_black_hole_backend() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("localhost:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Reads a whole HTTP response off `stream` and splits it into status code
/// and body bytes.
async fn read_http_response(stream: &mut (impl AsyncRead + Unpin)) -> Result<(u16, Vec<u8>)> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).timeout(REPLY_DEADLINE).await.anyerr()??;
    let (head_len, response) = parse_head(Side::Response, &raw)
        .map_err(|err| anyerr!(err))?
        .context("incomplete HTTP response")?;
    let status = response.status().context("not a response")?;
    Ok((status.as_u16(), raw[head_len..].to_vec()))
}

/// Polls `check` until it returns true or the deadline passes.
async fn wait_until(check: impl Fn() -> bool) -> Result<()> {
    async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    .timeout(REPLY_DEADLINE)
    .await
    .std_context("condition not reached in time")
}

// -- Tests --

/// A routed host's bytes reach the configured backend and flow back.
#[tokio::test]
#[traced_test]
async fn test_plain_route() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, body) = read_http_response(&mut stream).await?;
    assert_eq!(status, 200);
    assert_eq!(body, b"origin GET /x");
    Ok(())
}

/// Hosts without a specific route fall back to the wildcard entry.
#[tokio::test]
#[traced_test]
async fn test_wildcard_fallback() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("fallback", OriginReply::RequestLine).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["*"], origin_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET /path HTTP/1.1\r\nHost: unknown.example\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, body) = read_http_response(&mut stream).await?;
    assert_eq!(status, 200);
    assert_eq!(body, b"fallback GET /path");
    Ok(())
}

/// An unrouted host with no wildcard is answered with a bare 404 and closed.
#[tokio::test]
#[traced_test]
async fn test_unknown_host_no_wildcard() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: b.example\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 404 Not Found\r\n\r\n");
    Ok(())
}

/// A passive proxy answers 503 without reading a request or dialing anyone.
#[tokio::test]
#[traced_test]
async fn test_inactive_server() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;
    server.stop();
    assert_eq!(server.status(), Status::Passive);

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
    Ok(())
}

/// A malformed first request is answered with a bare 400.
#[tokio::test]
#[traced_test]
async fn test_invalid_first_request() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"NOT VALID HTTP\r\n\r\n").await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 400 Bad Request\r\n\r\n");
    Ok(())
}

/// An unreachable backend is answered with a bare 503.
#[tokio::test]
#[traced_test]
async fn test_backend_unreachable() -> Result {
    // Port 1 is essentially never listening.
    let dead: SocketAddr = "127.0.0.1:1".parse().std_context("addr")?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["down.example"], dead)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: down.example\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
    Ok(())
}

/// A registered 503 callback takes over the client socket on dial failure.
#[tokio::test]
#[traced_test]
async fn test_dial_failure_callback_owns_the_socket() -> Result {
    let dead: SocketAddr = "127.0.0.1:1".parse().std_context("addr")?;
    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["down.example"], dead)]).await?;

    let (host_tx, mut host_rx) = mpsc::unbounded_channel::<String>();
    let mut callbacks = Callbacks::new();
    callbacks.insert(
        503,
        Arc::new(move |mut client: TcpStream, host: &str| {
            host_tx.send(host.to_string()).ok();
            tokio::spawn(async move {
                client.write_all(b"custom error page").await.ok();
            });
        }),
    );
    server.set_callbacks(callbacks);
    assert!(server.callbacks().contains_key(&503));

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: down.example\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"custom error page");
    assert_eq!(host_rx.recv().await.as_deref(), Some("down.example"));
    Ok(())
}

/// A request interceptor's injected header reaches the backend after the
/// original headers.
#[tokio::test]
#[traced_test]
async fn test_request_header_injection() -> Result {
    let (backend_addr, mut seen_rx, _backend_task) =
        spawn_capture_backend(b"HTTP/1.1 204 No Content\r\n\r\n").await?;
    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], backend_addr)]).await?;
    server.add_request_interceptor(|msg: &mut HttpMessage| {
        msg.headers.append(
            HeaderName::from_static("x-proxy"),
            HeaderValue::from_static("1"),
        );
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, _) = read_http_response(&mut stream).await?;
    assert_eq!(status, 204);

    let seen = seen_rx.recv().await.context("backend saw no request")?;
    let text = String::from_utf8(seen).anyerr()?;
    let host_at = text.find("host: a.example").context("host header missing")?;
    let injected_at = text.find("x-proxy: 1").context("injected header missing")?;
    assert!(host_at < injected_at, "injected header must come last");
    Ok(())
}

/// A response interceptor's header reaches the client.
#[tokio::test]
#[traced_test]
async fn test_response_interception() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["*"], origin_addr)]).await?;
    server.add_response_interceptor(|msg: &mut HttpMessage| {
        msg.headers.append(
            HeaderName::from_static("x-served-by"),
            HeaderValue::from_static("vhost-relay"),
        );
    });

    let client = reqwest::Client::new();
    let res = client
        .get(format!("http://{proxy_addr}/path"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.headers().get("x-served-by").map(|v| v.as_bytes()),
        Some(b"vhost-relay".as_slice())
    );
    assert_eq!(res.text().await.anyerr()?, "origin GET /path");
    Ok(())
}

/// A custom route resolver replaces host-header lookup entirely.
#[tokio::test]
#[traced_test]
async fn test_custom_route_resolver() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("picked", OriginReply::RequestLine).await?;
    // No routes at all; the resolver is the only way anywhere.
    let (proxy_addr, server, _proxy_task) = spawn_proxy(vec![]).await?;
    let endpoint = crate::Endpoint::Tcp {
        host: origin_addr.ip().to_string(),
        port: origin_addr.port(),
    };
    server.set_route_resolver(move |msg: &HttpMessage| {
        msg.headers.get("x-pick").is_some().then(|| endpoint.clone())
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET /r HTTP/1.1\r\nHost: x\r\nX-Pick: 1\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, body) = read_http_response(&mut stream).await?;
    assert_eq!(status, 200);
    assert_eq!(body, b"picked GET /r");

    // Requests the resolver declines get the 404 path.
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 404 Not Found\r\n\r\n");
    Ok(())
}

/// After a 101 response the connection is an opaque tunnel in both
/// directions and interceptors see nothing further.
#[tokio::test]
#[traced_test]
async fn test_protocol_upgrade_tunnel() -> Result {
    let upgrade_head =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    let listener = TcpListener::bind("localhost:0").await?;
    let backend_addr = listener.local_addr()?;
    let _backend_task = AbortOnDropHandle::new(tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 1024];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let Ok(n) = stream.read(&mut buf).await else {
                return;
            };
            seen.extend_from_slice(&buf[..n]);
        }
        stream.write_all(upgrade_head).await.ok();
        stream.write_all(b"\x81\x05first").await.ok();
        // Echo whatever arrives after the upgrade.
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }));

    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["ws.example"], backend_addr)]).await?;
    let (count_tx, mut count_rx) = mpsc::unbounded_channel::<u16>();
    server.add_response_interceptor(move |msg: &mut HttpMessage| {
        if let Some(status) = msg.status() {
            count_tx.send(status.as_u16()).ok();
        }
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: ws.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await?;

    // The 101 head arrives first, then the backend's initial frame.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        stream
            .read_exact(&mut byte)
            .timeout(REPLY_DEADLINE)
            .await
            .anyerr()??;
        head.push(byte[0]);
    }
    let (_, response) = parse_head(Side::Response, &head)
        .map_err(|err| anyerr!(err))?
        .context("incomplete 101 head")?;
    assert_eq!(response.status().map(|s| s.as_u16()), Some(101));

    let mut frame = [0u8; 7];
    stream
        .read_exact(&mut frame)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(&frame, b"\x81\x05first");

    // Bytes that are not HTTP at all tunnel through unmodified, both ways.
    let junk = b"\x00raw bytes, certainly not HTTP\r\n\r\n";
    stream.write_all(junk).await?;
    let mut echoed = vec![0u8; junk.len()];
    stream
        .read_exact(&mut echoed)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(echoed, junk);

    // The interceptor saw exactly one response head: the 101 itself.
    assert_eq!(count_rx.recv().await, Some(101));
    assert!(count_rx.try_recv().is_err());
    Ok(())
}

/// Bulk disconnect closes exactly the indicated host's clients and the
/// tracker ends up consistent.
#[tokio::test]
#[traced_test]
async fn test_bulk_disconnect() -> Result {
    let (hole_a, _task_a) = spawn_black_hole_backend().await?;
    let (hole_b, _task_b) = spawn_black_hole_backend().await?;
    let (proxy_addr, server, _proxy_task) = spawn_proxy(vec![
        tcp_route(&["a.example"], hole_a),
        tcp_route(&["b.example"], hole_b),
    ])
    .await?;

    let mut a1 = TcpStream::connect(proxy_addr).await?;
    a1.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n").await?;
    let mut a2 = TcpStream::connect(proxy_addr).await?;
    a2.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n").await?;
    let mut b = TcpStream::connect(proxy_addr).await?;
    b.write_all(b"GET / HTTP/1.1\r\nHost: b.example\r\n\r\n").await?;

    let tracker = server.tracker();
    wait_until(|| tracker.len() == 3).await?;
    assert_eq!(tracker.count_for_host("a.example"), 2);

    assert_eq!(server.disconnect_clients("a.example"), 2);
    wait_until(|| tracker.len() == 1).await?;
    assert_eq!(tracker.count_for_host("a.example"), 0);
    assert_eq!(tracker.count_for_host("b.example"), 1);

    // The a.example clients are gone...
    let mut buf = Vec::new();
    a1.read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    a2.read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;

    // ...and everything closes on disconnect_all.
    assert_eq!(server.disconnect_all_clients(), 1);
    wait_until(|| tracker.is_empty()).await?;
    Ok(())
}

/// Reconfiguration swaps the route table atomically for new connections.
#[tokio::test]
#[traced_test]
async fn test_reconfigure_swaps_routes() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("one", OriginReply::RequestLine).await?;
    let (proxy_addr, server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, _) = read_http_response(&mut stream).await?;
    assert_eq!(status, 200);

    server
        .set_config(vec![tcp_route(&["b.example"], origin_addr)])
        .map_err(|err| anyerr!(err))?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
        .await?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(REPLY_DEADLINE)
        .await
        .anyerr()??;
    assert_eq!(buf, b"HTTP/1.1 404 Not Found\r\n\r\n");
    Ok(())
}

/// POST bodies stream through the proxy unmodified.
#[tokio::test]
#[traced_test]
async fn test_post_body_passthrough() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::WithBody).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["*"], origin_addr)]).await?;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("http://{proxy_addr}/upload"))
        .body("hello request body")
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.text().await.anyerr()?,
        "origin POST /upload: hello request body"
    );

    // 256KB body, large enough to span many relay chunks.
    let body = "x".repeat(256 * 1024);
    let res = client
        .post(format!("http://{proxy_addr}/large"))
        .body(body.clone())
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.text().await.anyerr()?, format!("origin POST /large: {body}"));
    Ok(())
}

/// Body bytes already pipelined into the first packet reach the backend.
#[tokio::test]
#[traced_test]
async fn test_first_packet_pipelined_body() -> Result {
    let (backend_addr, mut seen_rx, _backend_task) =
        spawn_capture_backend(b"HTTP/1.1 204 No Content\r\n\r\n").await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], backend_addr)]).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    // Head and body in one write, one packet.
    stream
        .write_all(
            b"POST /u HTTP/1.1\r\nHost: a.example\r\nContent-Length: 9\r\nConnection: close\r\n\r\npipelined",
        )
        .await?;
    let (status, _) = read_http_response(&mut stream).await?;
    assert_eq!(status, 204);

    let seen = seen_rx.recv().await.context("backend saw no request")?;
    let text = String::from_utf8(seen).anyerr()?;
    assert!(text.ends_with("\r\n\r\npipelined"), "backend got: {text:?}");
    Ok(())
}

/// Several clients proxy concurrently without crosstalk.
#[tokio::test]
#[traced_test]
async fn test_concurrent_connections() -> Result {
    let (origin_addr, _origin_task) = spawn_origin("origin", OriginReply::RequestLine).await?;
    let (proxy_addr, _server, _proxy_task) =
        spawn_proxy(vec![tcp_route(&["a.example"], origin_addr)]).await?;

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(proxy_addr).await?;
            let request = format!(
                "GET /req/{i} HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await?;
            read_http_response(&mut stream).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let (status, body) = handle.await.anyerr()??;
        assert_eq!(status, 200);
        assert_eq!(body, format!("origin GET /req/{i}").as_bytes());
    }
    Ok(())
}

/// An IPC route dials the local socket path instead of TCP.
#[cfg(unix)]
#[tokio::test]
#[traced_test]
async fn test_ipc_backend() -> Result {
    let path = std::env::temp_dir().join(format!("vhost-relay-test-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path).anyerr()?;
    let _backend_task = AbortOnDropHandle::new(tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 1024];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let Ok(n) = stream.read(&mut buf).await else {
                return;
            };
            seen.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nipc")
            .await
            .ok();
    }));

    let entries = vec![RouteEntry {
        hostnames: vec!["ipc.example".to_string()],
        endpoint: EndpointConfig::Ipc(path.to_string_lossy().into_owned()),
    }];
    let (proxy_addr, _server, _proxy_task) = spawn_proxy(entries).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: ipc.example\r\nConnection: close\r\n\r\n")
        .await?;
    let (status, body) = read_http_response(&mut stream).await?;
    assert_eq!(status, 200);
    assert_eq!(body, b"ipc");
    let _ = std::fs::remove_file(&path);
    Ok(())
}
