//! End-to-end tests running the real server and client against each other
//! over loopback sockets.

use platinum::http::{
    Client, Method, Reply, Request, Responder, Result, Server, ServerHandle, Service, Servlet,
    Status, TlsConfig,
};
use platinum::net::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replies with the request body reversed
struct ReverseService;

struct ReverseResponder {
    body: Vec<u8>,
}

impl Responder for ReverseResponder {
    fn on_body(&mut self, data: &[u8]) -> Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn on_complete(&mut self, _request: &Request, reply: &mut Reply) -> Result<()> {
        let reversed: Vec<u8> = self.body.iter().rev().copied().collect();
        reply.set_status(Status::OK);
        reply.write_body(&reversed);
        reply.set_finished(true);
        Ok(())
    }
}

impl Service for ReverseService {
    fn create_responder(&self) -> Box<dyn Responder> {
        Box::new(ReverseResponder { body: Vec::new() })
    }
}

/// Replies "hello" and closes the connection
struct OneShotService;

struct OneShotResponder;

impl Responder for OneShotResponder {
    fn on_complete(&mut self, _request: &Request, reply: &mut Reply) -> Result<()> {
        reply.set_status(Status::OK);
        reply.header_mut().set("Connection", "close");
        reply.write_body(b"hello");
        reply.set_finished(true);
        Ok(())
    }
}

impl Service for OneShotService {
    fn create_responder(&self) -> Box<dyn Responder> {
        Box::new(OneShotResponder)
    }
}

fn start_server(servlets: Vec<Servlet>) -> (SocketAddr, ServerHandle) {
    init_logging();
    let mut server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.set_timeout(Some(TIMEOUT));
    for servlet in servlets {
        server.add_servlet(servlet);
    }
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    thread::spawn(move || server.run().unwrap());
    (addr, handle)
}

#[test]
fn test_get_keep_alive_connection_stays_open() {
    let (addr, handle) = start_server(vec![Servlet::new("/", Arc::new(ReverseService))]);

    let mut client = Client::new(Endpoint::from(addr));
    client.set_timeout(Some(TIMEOUT));
    client.request_mut().set_method(Method::Get);
    client.request_mut().set_url("/foo");
    client.send(true).unwrap();
    let reply = client.receive().unwrap();

    assert_eq!(reply.status().code(), 200);
    assert!(client.is_connected());

    handle.stop();
}

#[test]
fn test_connection_close_reply_closes() {
    let (addr, handle) = start_server(vec![Servlet::new("/", Arc::new(OneShotService))]);

    let mut client = Client::new(Endpoint::from(addr));
    client.set_timeout(Some(TIMEOUT));
    client.request_mut().set_method(Method::Get);
    let reply = client.receive().unwrap();

    assert_eq!(reply.body(), b"hello");
    assert!(!client.is_connected());

    handle.stop();
}

#[test]
fn test_streamed_body_round_trip() {
    let (addr, handle) = start_server(vec![Servlet::new("/", Arc::new(ReverseService))]);

    let mut client = Client::new(Endpoint::from(addr));
    client.set_timeout(Some(TIMEOUT));
    client.request_mut().set_method(Method::Post);
    client.request_mut().set_url("/reverse");

    // Stream the body in fragments; the wire framing turns chunked.
    client.request_mut().write_body(b"abc");
    client.send(false).unwrap();
    client.request_mut().write_body(b"def");
    client.send(false).unwrap();
    client.request_mut().write_body(b"ghi");
    client.send(true).unwrap();

    let reply = client.receive().unwrap();
    assert_eq!(reply.body(), b"ihgfedcba");

    handle.stop();
}

#[test]
fn test_pipelined_requests_one_connection() {
    let (addr, handle) = start_server(vec![Servlet::new("/", Arc::new(ReverseService))]);

    let mut client = Client::new(Endpoint::from(addr));
    client.set_timeout(Some(TIMEOUT));

    for body in [&b"one"[..], b"two", b"three"] {
        client.request_mut().set_method(Method::Post);
        client.request_mut().set_url("/r");
        client.request_mut().write_body(body);
        client.send(true).unwrap();
    }
    assert_eq!(client.request_count(), 3);

    let mut replies = Vec::new();
    for _ in 0..3 {
        let reply = client.receive().unwrap();
        replies.push(reply.body().to_vec());
    }
    assert_eq!(replies, [b"eno".to_vec(), b"owt".to_vec(), b"eerht".to_vec()]);
    assert_eq!(client.request_count(), 0);

    handle.stop();
}

#[test]
fn test_many_clients_sequential_exchanges() {
    let (addr, handle) = start_server(vec![Servlet::new("/", Arc::new(ReverseService))]);

    let mut threads = Vec::new();
    for _ in 0..4 {
        threads.push(thread::spawn(move || {
            let mut client = Client::new(Endpoint::from(addr));
            client.set_timeout(Some(TIMEOUT));
            for round in 0..3 {
                let body = format!("round-{}", round);
                client.request_mut().set_method(Method::Post);
                client.request_mut().set_url("/r");
                client.request_mut().write_body(body.as_bytes());
                let reply = client.receive().unwrap();
                let expected: Vec<u8> = body.bytes().rev().collect();
                assert_eq!(reply.body(), &expected[..]);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    handle.stop();
}

mod tls {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};

    fn self_signed_pem() -> Vec<u8> {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(7).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let mut pem = cert.to_pem().unwrap();
        pem.extend_from_slice(&key.private_key_to_pem_pkcs8().unwrap());
        pem
    }

    #[test]
    fn test_tls_exchange() {
        init_logging();
        let pem = self_signed_pem();
        let server_config = TlsConfig::server()
            .unwrap()
            .cert_pem(&pem)
            .unwrap()
            .build();

        let mut server =
            Server::bind_tls("127.0.0.1:0".parse().unwrap(), server_config).unwrap();
        server.set_timeout(Some(TIMEOUT));
        server.add_servlet(Servlet::new("/", Arc::new(ReverseService)));
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        thread::spawn(move || server.run().unwrap());

        let client_config = TlsConfig::client().unwrap().servername("localhost").build();
        let mut client = Client::new_tls(Endpoint::from(addr), client_config);
        client.set_timeout(Some(TIMEOUT));
        client.request_mut().set_method(Method::Post);
        client.request_mut().set_url("/r");
        client.request_mut().write_body(b"secret");
        let reply = client.receive().unwrap();
        assert_eq!(reply.body(), b"terces");
        assert!(client.is_connected());

        handle.stop();
    }
}
