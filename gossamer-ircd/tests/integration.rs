//! End-to-end tests against an in-process server.
//!
//! Each test starts a real dispatch loop over the in-memory directory and
//! talks to it through duplex pipes or loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::{self, crypto::ring, RootCertStore};
use tokio_rustls::TlsConnector;

use gossamer_ircd::config::{ListenSpec, ServerConfig};
use gossamer_ircd::directory::Transport;
use gossamer_ircd::ircd::{Ircd, IrcdHandle};
use gossamer_ircd::link::LinkListener;
use gossamer_ircd::listener::{ClientListener, Incoming};
use gossamer_ircd::tls::{self, TlsMaterial};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

fn config() -> ServerConfig {
    ServerConfig {
        network: "TestNet".into(),
        server: "irc.test".into(),
        server_desc: "integration".into(),
        default_subnet: "main".into(),
        ..ServerConfig::default()
    }
}

struct Server {
    handle: IrcdHandle,
    task: JoinHandle<()>,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn start(config: &ServerConfig, tls: Option<&TlsMaterial>) -> Server {
    let ircd = Ircd::new(config, tls).unwrap();
    let handle = ircd.handle();
    let task = tokio::spawn(ircd.run());
    Server { handle, task }
}

struct TestClient {
    lines: Lines<BufReader<ReadHalf<Box<dyn Transport>>>>,
    writer: WriteHalf<Box<dyn Transport>>,
}

impl TestClient {
    fn over(transport: Box<dyn Transport>) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn connect(server: &Server) -> Self {
        let (client, served) = tokio::io::duplex(64 * 1024);
        server
            .handle
            .incoming
            .send(Incoming {
                transport: Box::new(served),
                host: "127.0.0.1".into(),
            })
            .await
            .unwrap();
        Self::over(Box::new(client))
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn line(&mut self) -> String {
        timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("server closed the connection")
    }

    /// Nothing further arrives within a short window.
    async fn assert_quiet(&mut self) {
        if let Ok(line) = timeout(QUIET, self.lines.next_line()).await {
            panic!("unexpected output: {line:?}");
        }
    }

    async fn closed(&mut self) -> bool {
        matches!(timeout(TIMEOUT, self.lines.next_line()).await, Ok(Ok(None)) | Ok(Err(_)))
    }

    async fn register(&mut self, nick: &str) {
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {nick} 0 * :{nick} test")).await;
        for numeric in ["001", "002", "003", "004"] {
            let line = self.line().await;
            assert!(
                line.starts_with(&format!(":irc.test {numeric} {nick} ")),
                "expected {numeric}, got {line}"
            );
        }
    }
}

async fn registered(server: &Server, nick: &str) -> TestClient {
    let mut client = TestClient::connect(server).await;
    client.register(nick).await;
    client
}

#[tokio::test]
async fn registration_sends_the_burst_in_order() {
    let server = start(&config(), None);
    let mut alice = TestClient::connect(&server).await;
    alice.send("NICK alice").await;
    alice.send("USER alice 0 * :Alice Liddell").await;

    assert_eq!(
        alice.line().await,
        ":irc.test 001 alice :Welcome to the TestNet Internet Relay Chat network alice!alice@127.0.0.1"
    );
    assert_eq!(
        alice.line().await,
        ":irc.test 002 alice :Your host is irc.test, running version gossamer-dev"
    );
    assert!(alice
        .line()
        .await
        .starts_with(":irc.test 003 alice :This server was created "));
    assert!(alice
        .line()
        .await
        .starts_with(":irc.test 004 alice irc.test gossamer-dev "));
    alice.assert_quiet().await;
}

#[tokio::test]
async fn nick_collision_keeps_the_client_pending() {
    let server = start(&config(), None);
    let _alice = registered(&server, "alice").await;

    let mut second = TestClient::connect(&server).await;
    second.send("NICK Alice").await;
    assert_eq!(second.line().await, ":irc.test 433 Alice :Nickname is already in use");
    second.assert_quiet().await;

    second.send("JOIN #main:lobby").await;
    assert_eq!(second.line().await, ":irc.test 451 * :You have not registered");

    second.register("bob").await;
    second.assert_quiet().await;
}

#[tokio::test]
async fn malformed_nicknames_never_reach_other_clients() {
    let server = start(&config(), None);
    let mut bob = registered(&server, "bob").await;

    let mut evil = TestClient::connect(&server).await;
    evil.send("NICK :a b").await;
    assert_eq!(evil.line().await, ":irc.test 432 * a b :Erroneous nickname");
    evil.send("NICK main:bob").await;
    assert_eq!(evil.line().await, ":irc.test 432 * main:bob :Erroneous nickname");
    evil.send("USER e 0 * :Evil").await;
    evil.assert_quiet().await;

    evil.send("PRIVMSG bob :hi").await;
    assert_eq!(evil.line().await, ":irc.test 451 * :You have not registered");
    bob.assert_quiet().await;

    evil.register("eve").await;
    evil.send("PRIVMSG bob :hi").await;
    assert_eq!(bob.line().await, ":eve!e@127.0.0.1 PRIVMSG bob :hi");
}

#[tokio::test]
async fn join_and_channel_message_fan_out() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;
    let mut bob = registered(&server, "bob").await;

    bob.send("JOIN #lobby").await;
    assert_eq!(
        bob.line().await,
        ":bob!bob@127.0.0.1 PART #lobby :Joining you to #main:lobby instead."
    );
    assert_eq!(bob.line().await, ":bob!bob@127.0.0.1 JOIN #main:lobby");
    assert_eq!(bob.line().await, ":irc.test 332 bob #main:lobby :");
    assert!(bob.line().await.starts_with(":irc.test 333 bob #main:lobby irc.test "));
    assert_eq!(bob.line().await, ":irc.test 353 bob = #main:lobby :@bob");
    assert_eq!(bob.line().await, ":irc.test 366 bob #main:lobby :End of /NAMES list");

    alice.send("JOIN #lobby").await;
    assert_eq!(
        alice.line().await,
        ":alice!alice@127.0.0.1 PART #lobby :Joining you to #main:lobby instead."
    );
    assert_eq!(alice.line().await, ":alice!alice@127.0.0.1 JOIN #main:lobby");
    assert_eq!(alice.line().await, ":irc.test 332 alice #main:lobby :");
    assert!(alice.line().await.starts_with(":irc.test 333 alice #main:lobby "));
    assert_eq!(alice.line().await, ":irc.test 353 alice = #main:lobby :alice @bob");
    assert_eq!(alice.line().await, ":irc.test 366 alice #main:lobby :End of /NAMES list");
    assert_eq!(bob.line().await, ":alice!alice@127.0.0.1 JOIN #main:lobby");

    alice.send("PRIVMSG #main:lobby :hi there").await;
    assert_eq!(
        bob.line().await,
        ":alice!alice@127.0.0.1 PRIVMSG #main:lobby :hi there"
    );
    alice.assert_quiet().await;

    // Channel routing only accepts fully qualified names.
    alice.send("PRIVMSG #lobby :hi").await;
    assert_eq!(alice.line().await, ":irc.test 403 alice #lobby :No such channel");
    bob.assert_quiet().await;
}

#[tokio::test]
async fn private_messages_route_by_nick() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;
    let mut bob = registered(&server, "bob").await;

    alice.send("PRIVMSG BOB :hello bob").await;
    assert_eq!(bob.line().await, ":alice!alice@127.0.0.1 PRIVMSG bob :hello bob");

    alice.send("PRIVMSG main:bob :qualified").await;
    assert_eq!(bob.line().await, ":alice!alice@127.0.0.1 PRIVMSG bob :qualified");

    alice.send("PRIVMSG nobody :hello?").await;
    assert_eq!(alice.line().await, ":irc.test 401 alice nobody :No such nick/channel");
    alice.assert_quiet().await;
}

#[tokio::test]
async fn mode_changes_reach_every_member() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;
    let mut bob = registered(&server, "bob").await;

    alice.send("JOIN #main:ops").await;
    for _ in 0..5 {
        alice.line().await;
    }
    bob.send("JOIN #main:ops").await;
    for _ in 0..5 {
        bob.line().await;
    }
    assert_eq!(alice.line().await, ":bob!bob@127.0.0.1 JOIN #main:ops");

    bob.send("MODE #main:ops +n").await;
    assert_eq!(bob.line().await, ":irc.test 482 bob #main:ops :You're not channel operator");

    alice.send("MODE #main:ops +nt+v bob").await;
    let expected = ":alice!alice@127.0.0.1 MODE #main:ops +ntv bob";
    assert_eq!(alice.line().await, expected);
    assert_eq!(bob.line().await, expected);

    alice.send("MODE #main:ops").await;
    assert_eq!(alice.line().await, ":irc.test 324 alice #main:ops +nt");
    alice.send("MODE alice").await;
    assert_eq!(alice.line().await, ":irc.test 221 alice +");
}

#[tokio::test]
async fn protocol_errors_get_numeric_replies() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;

    alice.send("PRIVMSG bob").await;
    assert_eq!(alice.line().await, ":irc.test 461 alice PRIVMSG :Not enough parameters");

    alice.send("JOIN lobby").await;
    assert_eq!(alice.line().await, ":irc.test 476 alice lobby :Bad Channel Mask");

    alice.send("JOIN #nowhere:lobby").await;
    assert_eq!(alice.line().await, ":irc.test 403 alice #nowhere:lobby :No such channel");

    alice.send("CONNECT hub.test 127.0.0.1 99999").await;
    assert_eq!(alice.line().await, ":irc.test NOTICE alice :Bad port: 99999");

    alice.send("CONNECT hub.test 127.0.0.1 7000").await;
    assert_eq!(
        alice.line().await,
        ":irc.test NOTICE alice :Cannot link to hub.test: TLS is not configured"
    );

    alice.send("WALLOPS :hello").await;
    assert_eq!(alice.line().await, ":irc.test 421 alice WALLOPS :Unknown command");

    alice.send("PING :token").await;
    assert_eq!(alice.line().await, ":irc.test PONG irc.test :token");

    alice.send("VERSION").await;
    assert_eq!(
        alice.line().await,
        ":irc.test 005 alice CASEMAPPING=ascii CHANMODES=,,,imnpst CHANTYPES=# NETWORK=TestNet PREFIX=(qaohv)~&@%+ :are supported by this server"
    );
}

#[tokio::test]
async fn overlong_lines_are_truncated_without_desync() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;
    let mut bob = registered(&server, "bob").await;

    let long = "x".repeat(2000);
    alice.send(&format!("PRIVMSG bob :{long}")).await;
    alice.send("PING after").await;

    let delivered = bob.line().await;
    let prefix = ":alice!alice@127.0.0.1 PRIVMSG bob :";
    assert!(delivered.starts_with(prefix));
    assert_eq!(delivered.len() - prefix.len(), 512 - "PRIVMSG bob :".len());
    assert_eq!(alice.line().await, ":irc.test PONG irc.test :after");
}

#[tokio::test]
async fn quitting_releases_the_nickname() {
    let server = start(&config(), None);
    let mut alice = registered(&server, "alice").await;
    alice.send("QUIT :bye").await;
    assert!(alice.closed().await);

    let _again = registered(&server, "alice").await;
}

#[tokio::test]
async fn quitting_before_registration_closes_the_connection() {
    let server = start(&config(), None);
    let mut pending = TestClient::connect(&server).await;
    pending.send("NICK alice").await;
    pending.send("QUIT :changed my mind").await;
    assert!(pending.closed().await);

    let _alice = registered(&server, "alice").await;
}

#[tokio::test]
async fn dropped_connections_release_the_nickname() {
    let server = start(&config(), None);
    let alice = registered(&server, "alice").await;
    drop(alice);

    // The server notices the EOF asynchronously.
    let mut attempt = TestClient::connect(&server).await;
    for _ in 0..50 {
        attempt.send("NICK alice").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(Ok(Some(line))) = timeout(QUIET, attempt.lines.next_line()).await {
            assert!(line.contains(" 433 "), "unexpected {line}");
            continue;
        }
        attempt.send("USER alice 0 * :Alice").await;
        assert!(attempt.line().await.starts_with(":irc.test 001 alice "));
        return;
    }
    panic!("nickname was never released");
}

struct TestPki {
    ca_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Integration CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
        }
    }

    fn material(&self, name: &str) -> TlsMaterial {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        TlsMaterial::from_pem(
            self.ca_pem.as_bytes(),
            cert.pem().as_bytes(),
            key.serialize_pem().as_bytes(),
        )
        .unwrap()
    }

    fn anonymous_connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

#[tokio::test]
async fn connect_dials_a_verified_link() {
    let pki = TestPki::new();
    let ours = pki.material("irc.test");
    let hub = pki.material("hub.test");

    let (links_tx, mut links_rx) = mpsc::channel(4);
    let spec: ListenSpec = "127.0.0.1:0".parse().unwrap();
    let hub_listener = LinkListener::bind(&spec, hub.link_acceptor().unwrap(), links_tx)
        .await
        .unwrap();

    let server = start(&config(), Some(&ours));
    let mut alice = registered(&server, "alice").await;
    alice
        .send(&format!(
            "CONNECT hub.test 127.0.0.1 {}",
            hub_listener.local_addr().port()
        ))
        .await;

    let link = timeout(TIMEOUT, links_rx.recv()).await.unwrap().unwrap();
    assert_eq!(link.server, "irc.test");
    alice.assert_quiet().await;
}

#[tokio::test]
async fn accepted_links_reach_the_server() {
    let pki = TestPki::new();
    let ours = pki.material("irc.test");
    let leaf = pki.material("leaf.test");

    let server = start(&config(), Some(&ours));
    let spec: ListenSpec = "127.0.0.1:0".parse().unwrap();
    let listener = LinkListener::bind(&spec, ours.link_acceptor().unwrap(), server.handle.links.clone())
        .await
        .unwrap();

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let mut link = leaf
        .connector()
        .unwrap()
        .connect(tls::server_name("irc.test").unwrap(), stream)
        .await
        .unwrap();
    let (_, session) = link.get_ref();
    assert_eq!(
        tls::peer_common_name(session.peer_certificates()).as_deref(),
        Some("irc.test")
    );

    // The engine keeps the link open once it has been handed over.
    link.write_all(b"SERVER leaf.test\r\n").await.unwrap();
    link.flush().await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(QUIET, tokio::io::AsyncReadExt::read(&mut link, &mut buf)).await;
    assert!(read.is_err(), "link was closed: {read:?}");
}

async fn dial_link(
    addr: std::net::SocketAddr,
    connector: &TlsConnector,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(tls::server_name("irc.test").unwrap(), stream)
        .await
        .unwrap()
}

/// Whether the server keeps `link` open rather than dropping it.
async fn link_kept(link: &mut tokio_rustls::client::TlsStream<TcpStream>) -> bool {
    let mut buf = [0u8; 1];
    timeout(QUIET, tokio::io::AsyncReadExt::read(link, &mut buf))
        .await
        .is_err()
}

#[tokio::test]
async fn servers_can_relink_after_a_split() {
    let pki = TestPki::new();
    let ours = pki.material("irc.test");
    let leaf = pki.material("leaf.test");

    let server = start(&config(), Some(&ours));
    let spec: ListenSpec = "127.0.0.1:0".parse().unwrap();
    let listener = LinkListener::bind(&spec, ours.link_acceptor().unwrap(), server.handle.links.clone())
        .await
        .unwrap();
    let connector = leaf.connector().unwrap();

    let mut first = dial_link(listener.local_addr(), &connector).await;
    assert!(link_kept(&mut first).await);
    let mut duplicate = dial_link(listener.local_addr(), &connector).await;
    assert!(!link_kept(&mut duplicate).await, "a live link must not be duplicated");

    drop(first);
    // The split is noticed asynchronously.
    for _ in 0..20 {
        let mut again = dial_link(listener.local_addr(), &connector).await;
        if link_kept(&mut again).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("relink was refused after the first link closed");
}

#[tokio::test]
async fn tls_client_listener_registers_clients() {
    let pki = TestPki::new();
    let ours = pki.material("irc.test");
    let server = start(&config(), Some(&ours));

    let spec: ListenSpec = "127.0.0.1:*0".parse().unwrap();
    let listener = ClientListener::bind(
        &spec,
        Some(ours.client_acceptor().unwrap()),
        server.handle.incoming.clone(),
    )
    .await
    .unwrap();

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    let secured = pki
        .anonymous_connector()
        .connect(tls::server_name("irc.test").unwrap(), stream)
        .await
        .unwrap();
    let mut client = TestClient::over(Box::new(secured));
    client.register("tlsuser").await;
}
