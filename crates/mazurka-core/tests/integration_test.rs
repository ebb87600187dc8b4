use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::OnceLock;
use std::time::Duration;

use mazurka_core::error::Result;
use mazurka_core::{Config, Params, Request, Response, Route, Server};

fn test_server() -> SocketAddr {
    static ADDR: OnceLock<SocketAddr> = OnceLock::new();
    *ADDR.get_or_init(|| {
        let server = Server::create(Config::default());

        server
            .add_route(Route::new("/hello").unwrap().get(
                |_: &mut Request, _: &Params| -> Result<Response> {
                    Ok(Response::text("Hello, World!"))
                },
            ))
            .unwrap();

        server
            .add_route(Route::new("/echo/:msg").unwrap().get(
                |_: &mut Request, params: &Params| -> Result<Response> {
                    let msg = params.get("msg").unwrap_or("missing");
                    Ok(Response::ok(format!("Echo: {msg}")))
                },
            ))
            .unwrap();

        server
            .add_route(Route::new("/stream").unwrap().get(
                |_: &mut Request, _: &Params| -> Result<Response> {
                    Ok(Response::stream(|| {
                        vec![b"chunk1".to_vec(), b"chunk2".to_vec()].into_iter()
                    }))
                },
            ))
            .unwrap();

        server
            .add_route(Route::new("/upload").unwrap().post(
                |req: &mut Request, _: &Params| -> Result<Response> {
                    let body = req.body_mut().bytes()?;
                    Ok(Response::ok(format!("Received {} bytes", body.len())))
                },
            ))
            .unwrap();

        server
            .add_route(Route::new("/files/*path").unwrap().get(
                |_: &mut Request, params: &Params| -> Result<Response> {
                    Ok(Response::ok(format!(
                        "path={}",
                        params.get("path").unwrap_or("?")
                    )))
                },
            ))
            .unwrap();

        server
            .before("/guarded/*rest", |req: &mut Request, _: &Params| {
                if req.headers().get("Authorization").is_none() {
                    return Ok(Some(Response::new(401)));
                }
                Ok(None)
            })
            .unwrap();

        server
            .add_route(Route::new("/guarded/data").unwrap().get(
                |_: &mut Request, _: &Params| -> Result<Response> { Ok(Response::ok("secret")) },
            ))
            .unwrap();

        server
            .after("/*all", |_: &Params, r: Response| {
                Ok(r.with_header("X-Engine", "mazurka"))
            })
            .unwrap();

        server.start_in_background("127.0.0.1:0").unwrap()
    })
}

fn send(request: &[u8]) -> String {
    let mut stream = TcpStream::connect(test_server()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

#[test]
fn simple_get() {
    let res = send(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Length: 13\r\n"));
    assert!(res.contains("X-Engine: mazurka\r\n"));
    assert!(res.ends_with("Hello, World!"));
}

#[test]
fn path_parameter_echo() {
    let res = send(b"GET /echo/integration_test HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Echo: integration_test"));
}

#[test]
fn percent_decoded_parameter() {
    let res = send(b"GET /echo/a%20b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Echo: a b"));
}

#[test]
fn catch_all_parameter() {
    let res = send(b"GET /files/js/app.js HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.contains("path=js/app.js"));
}

#[test]
fn chunked_response() {
    let res = send(b"GET /stream HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.contains("Transfer-Encoding: chunked\r\n"));
    assert!(res.contains("6\r\nchunk1\r\n"));
    assert!(res.contains("6\r\nchunk2\r\n"));
    assert!(res.contains("0\r\n\r\n"));
}

#[test]
fn fixed_length_request_body() {
    let res = send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello",
    );
    assert!(res.contains("Received 5 bytes"));
}

#[test]
fn chunked_request_body() {
    let res = send(
        b"POST /upload HTTP/1.1\r\nHost: x\r\nConnection: close\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert!(res.contains("Received 5 bytes"));
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let mut stream = TcpStream::connect(test_server()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut buf = [0u8; 1024];
    let mut first = String::new();
    while !first.contains("Hello, World!") {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "server closed a keep-alive connection");
        first.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

    stream
        .write_all(b"GET /echo/again HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut second = String::new();
    stream.read_to_string(&mut second).unwrap();
    assert!(second.contains("Echo: again"));
}

#[test]
fn pipelined_requests_in_one_write() {
    let mut stream = TcpStream::connect(test_server()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\nGET /echo/two HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let mut all = String::new();
    stream.read_to_string(&mut all).unwrap();
    assert!(all.contains("Hello, World!"));
    assert!(all.contains("Echo: two"));
    let first = all.find("HTTP/1.1 200 OK").unwrap();
    let second = all.rfind("HTTP/1.1 200 OK").unwrap();
    assert!(second > first, "two responses expected");
}

#[test]
fn before_action_guards_routes() {
    let res = send(b"GET /guarded/data HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 401 Unauthorized\r\n"));

    let res = send(
        b"GET /guarded/data HTTP/1.1\r\nHost: x\r\nAuthorization: token\r\nConnection: close\r\n\r\n",
    );
    assert!(res.ends_with("secret"));
}

#[test]
fn http_1_0_connection_closes_after_response() {
    let res = send(b"GET /hello HTTP/1.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(res.contains("Connection: close\r\n"));
}

#[test]
fn unknown_route_is_404() {
    let res = send(b"GET /no-such HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn trace_with_body_is_rejected() {
    let res = send(b"TRACE / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\n\r\nx");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn unsupported_version_is_505() {
    let res = send(b"GET /hello HTTP/2\r\nHost: x\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
}

#[test]
fn expect_100_continue_deferred_until_body_access() {
    let mut stream = TcpStream::connect(test_server()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    // the handler's first body read triggers the interim response
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(b"ok").unwrap();
    let mut all = String::new();
    stream.read_to_string(&mut all).unwrap();
    assert!(all.starts_with("HTTP/1.1 100 Continue\r\n\r\n"));
    assert!(all.contains("Received 2 bytes"));
}
