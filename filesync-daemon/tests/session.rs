//! Server sessions driven over in-memory duplex streams.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use filesync_core::codec::{self, Envelope, Message};
use filesync_core::config::{ClientConfig, ErrorBudget, ServerConfig, UserRecord};
use filesync_core::hasher::hash_bytes;
use filesync_core::protocol::{
    AppVersion, Auth, FileEnd, FileMeta, FilePart, GetFile, Hello, Intent, Limits, StartSync,
    SyncEvent,
};
use filesync_core::{ErrorCode, MemoryCatalog, ObjectKind, RetryPolicy, SyncAction, Versioning};
use filesync_daemon::framing::FrameReader;
use filesync_daemon::server::server_context;
use filesync_daemon::{establish, hash_password, serve, ConnectionRegistry, Messenger, ServerContext};
use filesync_engine::{Engine, Tenancy};

const SALT: &str = "pepper";
const UID: u64 = 7;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Server {
    tmp: TempDir,
    ctx: Arc<ServerContext>,
}

impl Server {
    fn user_root(&self) -> std::path::PathBuf {
        self.tmp.path().join("root").join(UID.to_string())
    }
}

fn server_with(adjust: impl FnOnce(&mut ServerConfig)) -> Server {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join(UID.to_string())).expect("user root");
    let mut config = ServerConfig {
        root: root.clone(),
        staging: tmp.path().join("staging"),
        catalog: tmp.path().join("catalog.json"),
        password_salt: SALT.to_string(),
        users: vec![UserRecord {
            id: UID,
            login: "alice".to_string(),
            password_hash: hash_password(SALT, "secret"),
            restrict_ip: None,
        }],
        ..ServerConfig::default()
    };
    adjust(&mut config);
    fs::create_dir_all(&config.staging).expect("staging");

    let engine = Engine::new(&root, Arc::new(MemoryCatalog::new()))
        .with_tenancy(Tenancy::PerUser)
        .with_retry(RetryPolicy {
            attempts: 1,
            backoff_ms: 0,
        });
    engine.initialize().expect("initialize");

    let registry = Arc::new(ConnectionRegistry::new(
        config.limits.max_clients,
        config.limits.max_connections_per_user,
    ));
    let ctx = server_context(&config, Versioning::current(), Arc::new(engine), registry);
    Server {
        tmp,
        ctx: Arc::new(ctx),
    }
}

fn server() -> Server {
    server_with(|_| {})
}

/// Raw protocol peer on the other end of a duplex stream.
struct Peer {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    token: String,
}

impl Peer {
    async fn send(&mut self, message: Message) {
        let line = codec::encode(&Envelope::new(self.token.clone(), message)).expect("encode");
        self.send_raw(&line).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("newline");
    }

    async fn recv(&mut self) -> Message {
        let line = tokio::time::timeout(REPLY_TIMEOUT, self.frames.next_frame())
            .await
            .expect("reply in time")
            .expect("readable frame")
            .expect("stream open");
        codec::decode(&line).expect("decodable reply").message
    }

    async fn expect_closed(&mut self) {
        let next = tokio::time::timeout(REPLY_TIMEOUT, self.frames.next_frame())
            .await
            .expect("close in time")
            .expect("clean close");
        assert_eq!(next, None);
    }

    async fn expect_error(&mut self, code: ErrorCode) {
        match self.recv().await {
            Message::Error(payload) => assert_eq!(payload.code, code),
            other => panic!("expected {code:?}, got {other:?}"),
        }
    }
}

fn peer_addr() -> SocketAddr {
    "127.0.0.1:50000".parse().expect("addr")
}

fn connect(server: &Server) -> (Peer, JoinHandle<()>, broadcast::Sender<()>) {
    let (ours, theirs) = tokio::io::duplex(1 << 20);
    let (their_reader, their_writer) = tokio::io::split(theirs);
    let (shutdown, _) = broadcast::channel(4);
    let handle = tokio::spawn(serve(
        server.ctx.clone(),
        peer_addr(),
        their_reader,
        their_writer,
        shutdown.subscribe(),
    ));
    let (reader, writer) = tokio::io::split(ours);
    let peer = Peer {
        frames: FrameReader::new(reader, 4 << 20),
        writer,
        token: String::new(),
    };
    (peer, handle, shutdown)
}

fn hello(intent: Intent, app_version: AppVersion) -> Message {
    Message::Hello(Hello {
        intent,
        party_name: "laptop".to_string(),
        app_version,
        protocol_version: Versioning::current().protocol,
        owner_contacts: String::new(),
        limits: Limits::default(),
    })
}

fn auth(password: &str) -> Message {
    Message::Auth(Auth {
        login: "alice".to_string(),
        password: password.to_string(),
        device_name: "laptop".to_string(),
        session_key: None,
    })
}

/// Hello, Auth and StartSync; leaves the peer holding its token.
async fn start_sync(peer: &mut Peer) {
    peer.send(hello(Intent::Client, Versioning::current().app)).await;
    assert!(matches!(peer.recv().await, Message::Handshake(_)));
    peer.send(auth("secret")).await;
    let Message::Token(token) = peer.recv().await else {
        panic!("expected token");
    };
    peer.token = token.token.clone();
    peer.send(Message::StartSync(StartSync { token: token.token })).await;
    assert!(matches!(peer.recv().await, Message::Ok(_)));
}

// ---------------------------------------------------------------------------
// Handshake and authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_handshake_reaches_sync() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(hello(Intent::Client, Versioning::current().app)).await;
    let Message::Handshake(handshake) = peer.recv().await else {
        panic!("expected handshake");
    };
    assert_eq!(handshake.party_name, "filesync-server");
    assert_eq!(handshake.protocol_version, Versioning::current().protocol);

    peer.send(auth("secret")).await;
    let Message::Token(token) = peer.recv().await else {
        panic!("expected token");
    };
    assert_eq!(token.token.len(), 64);
    assert!(!token.session_key.is_empty());

    peer.send(Message::StartSync(StartSync { token: token.token })).await;
    assert!(matches!(peer.recv().await, Message::Ok(_)));
}

#[tokio::test]
async fn wrong_password_is_denied_and_session_stays_open() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(hello(Intent::Client, Versioning::current().app)).await;
    peer.recv().await;
    peer.send(auth("guess")).await;
    peer.expect_error(ErrorCode::AccessDenied).await;

    peer.send(auth("secret")).await;
    assert!(matches!(peer.recv().await, Message::Token(_)));
}

#[tokio::test]
async fn major_version_mismatch_closes_the_session() {
    let server = server();
    let (mut peer, session, _shutdown) = connect(&server);

    let mut app = Versioning::current().app;
    app.major += 1;
    peer.send(hello(Intent::Client, app)).await;
    peer.expect_error(ErrorCode::IncompatibleAppVersion).await;
    peer.expect_closed().await;
    session.await.expect("session task");
}

#[tokio::test]
async fn mirror_intent_is_rejected() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(hello(Intent::Mirror, Versioning::current().app)).await;
    peer.expect_error(ErrorCode::IntentionRejected).await;
    peer.expect_closed().await;
}

#[tokio::test]
async fn auth_before_hello_is_an_unexpected_message() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(auth("secret")).await;
    peer.expect_error(ErrorCode::UnknownMessageType).await;
}

#[tokio::test]
async fn start_sync_with_wrong_token_is_denied() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(hello(Intent::Client, Versioning::current().app)).await;
    peer.recv().await;
    peer.send(auth("secret")).await;
    peer.recv().await;
    peer.send(Message::StartSync(StartSync {
        token: "forged".to_string(),
    }))
    .await;
    peer.expect_error(ErrorCode::AccessDenied).await;
}

#[tokio::test]
async fn restricted_user_cannot_log_in_from_elsewhere() {
    let server = server_with(|config| {
        config.users[0].restrict_ip = Some("10.0.0.1".parse().expect("ip"));
    });
    let (mut peer, _session, _shutdown) = connect(&server);

    peer.send(hello(Intent::Client, Versioning::current().app)).await;
    peer.recv().await;
    peer.send(auth("secret")).await;
    peer.expect_error(ErrorCode::AccessDenied).await;
}

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn silent_peer_times_out_before_hello() {
    let server = server_with(|config| config.handshake_timeout_secs = 1);
    let (mut peer, session, _shutdown) = connect(&server);

    assert!(matches!(peer.recv().await, Message::ConnectionEnd));
    session.await.expect("session task");
}

// ---------------------------------------------------------------------------
// Limits and error budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_frames_exhaust_the_client_budget() {
    let server = server_with(|config| {
        config.error_budget = ErrorBudget {
            client: 2,
            server: 10,
        };
    });
    let (mut peer, session, _shutdown) = connect(&server);

    for _ in 0..3 {
        peer.send_raw("this is not json").await;
        peer.expect_error(ErrorCode::BrokenMessage).await;
    }
    peer.expect_error(ErrorCode::TooManyClientErrors).await;
    peer.expect_closed().await;
    session.await.expect("session task");
}

#[tokio::test]
async fn server_connection_limit_refuses_extra_clients() {
    let server = server_with(|config| config.limits.max_clients = 1);
    let (mut first, _first_session, _first_shutdown) = connect(&server);
    first.send(hello(Intent::Client, Versioning::current().app)).await;
    first.recv().await;

    let (mut second, _second_session, _second_shutdown) = connect(&server);
    second.expect_error(ErrorCode::TooManyClients).await;
    second.expect_closed().await;
}

#[tokio::test]
async fn shutdown_sends_connection_end() {
    let server = server();
    let (mut peer, session, shutdown) = connect(&server);
    start_sync(&mut peer).await;

    shutdown.send(()).expect("live session");
    assert!(matches!(peer.recv().await, Message::ConnectionEnd));
    session.await.expect("session task");
}

#[tokio::test]
async fn end_sync_returns_to_authenticated() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    peer.send(Message::EndSync).await;
    assert!(matches!(peer.recv().await, Message::Ok(_)));

    peer.send(Message::StartSync(StartSync {
        token: peer.token.clone(),
    }))
    .await;
    assert!(matches!(peer.recv().await, Message::Ok(_)));
}

// ---------------------------------------------------------------------------
// Sync and transfers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requested_file_arrives_in_exact_chunks() {
    let server = server();
    let content: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    fs::create_dir_all(server.user_root().join("docs")).expect("mkdir");
    fs::write(server.user_root().join("docs/report.bin"), &content).expect("write");

    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;
    peer.send(Message::GetFile(GetFile {
        name: "report.bin".to_string(),
        path: "%ROOT_DIR%,docs".to_string(),
        hash: String::new(),
        updated_at: Utc::now(),
    }))
    .await;

    let Message::SendFile(meta) = peer.recv().await else {
        panic!("expected SendFile");
    };
    assert_eq!(meta.size, 40_000);
    assert_eq!(meta.hash, hash_bytes(&content));
    assert_eq!(meta.ext, "bin");

    let mut sizes = Vec::new();
    let mut received = Vec::new();
    loop {
        match peer.recv().await {
            Message::FilePart(part) => {
                sizes.push(part.data.len());
                received.extend_from_slice(&part.data);
            }
            Message::FileEnd(end) => {
                assert_eq!(end.name, "report.bin");
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(sizes, vec![15_360, 15_360, 9_280]);
    assert_eq!(received, content);
}

#[tokio::test]
async fn missing_file_request_is_answered_with_error_and_end() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    peer.send(Message::GetFile(GetFile {
        name: "ghost.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: String::new(),
        updated_at: Utc::now(),
    }))
    .await;
    assert!(matches!(peer.recv().await, Message::Error(_)));
    assert!(matches!(peer.recv().await, Message::FileEnd(_)));
}

#[tokio::test]
async fn created_file_is_fetched_and_placed_in_user_subtree() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    let content = b"hello from the laptop";
    let hash = hash_bytes(content);
    let at = Utc::now();
    peer.send(Message::SyncEvent(SyncEvent {
        action: SyncAction::Created,
        object_kind: ObjectKind::File,
        name: "note.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: hash.clone(),
        new_updated_at: at,
    }))
    .await;

    let Message::GetFile(request) = peer.recv().await else {
        panic!("expected GetFile");
    };
    assert!(request.same_object("note.txt", "%ROOT_DIR%"));

    peer.send(Message::SendFile(FileMeta {
        name: "note.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash,
        size: content.len() as u64,
        updated_at: at,
        ext: "txt".to_string(),
    }))
    .await;
    peer.send(Message::FilePart(FilePart {
        data: content.to_vec(),
    }))
    .await;
    peer.send(Message::FileEnd(FileEnd {
        name: "note.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
    }))
    .await;

    let placed = server.user_root().join("note.txt");
    wait_for(&placed).await;
    assert_eq!(fs::read(&placed).expect("read"), content);
    assert!(!server.tmp.path().join("root/note.txt").exists());
}

#[tokio::test]
async fn unsolicited_send_file_is_rejected() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    peer.send(Message::SendFile(FileMeta {
        name: "x.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: hash_bytes(b"x"),
        size: 1,
        updated_at: Utc::now(),
        ext: "txt".to_string(),
    }))
    .await;
    peer.expect_error(ErrorCode::BrokenMessage).await;
}

#[tokio::test]
async fn sync_message_with_stale_token_is_denied() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    peer.token = "stale".to_string();
    peer.send(Message::GetFile(GetFile {
        name: "a.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: String::new(),
        updated_at: Utc::now(),
    }))
    .await;
    peer.expect_error(ErrorCode::AccessDenied).await;
}

#[tokio::test]
async fn sync_outlives_token_validity() {
    let server = server_with(|config| config.token_validity_secs = 1);
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    peer.send(Message::SyncEvent(SyncEvent {
        action: SyncAction::Created,
        object_kind: ObjectKind::Folder,
        name: "later".to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: String::new(),
        new_updated_at: Utc::now(),
    }))
    .await;
    wait_for(&server.user_root().join("later")).await;

    // A new sync still needs a token that has not expired.
    peer.send(Message::EndSync).await;
    assert!(matches!(peer.recv().await, Message::Ok(_)));
    peer.send(Message::StartSync(StartSync {
        token: peer.token.clone(),
    }))
    .await;
    peer.expect_error(ErrorCode::AccessDenied).await;
}

fn created_file(name: &str, content: &[u8]) -> Message {
    Message::SyncEvent(SyncEvent {
        action: SyncAction::Created,
        object_kind: ObjectKind::File,
        name: name.to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: hash_bytes(content),
        new_updated_at: Utc::now(),
    })
}

async fn send_whole_file(peer: &mut Peer, name: &str, content: &[u8]) {
    peer.send(Message::SendFile(FileMeta {
        name: name.to_string(),
        path: "%ROOT_DIR%".to_string(),
        hash: hash_bytes(content),
        size: content.len() as u64,
        updated_at: Utc::now(),
        ext: String::new(),
    }))
    .await;
    peer.send(Message::FilePart(FilePart {
        data: content.to_vec(),
    }))
    .await;
    peer.send(Message::FileEnd(FileEnd {
        name: name.to_string(),
        path: "%ROOT_DIR%".to_string(),
    }))
    .await;
}

#[tokio::test]
async fn refused_file_is_drained_and_the_queued_fetch_follows() {
    let server = server_with(|config| config.limits.max_file_size = 4);
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    let big = b"0123456789";
    let small = b"abc";
    peer.send(created_file("big.bin", big)).await;
    let Message::GetFile(first) = peer.recv().await else {
        panic!("expected GetFile");
    };
    assert_eq!(first.name, "big.bin");
    peer.send(created_file("small.txt", small)).await;

    // The responder streams the whole file even though it is refused.
    send_whole_file(&mut peer, "big.bin", big).await;
    peer.expect_error(ErrorCode::BrokenMessage).await;
    let Message::GetFile(next) = peer.recv().await else {
        panic!("expected the queued GetFile");
    };
    assert_eq!(next.name, "small.txt");

    send_whole_file(&mut peer, "small.txt", small).await;
    let placed = server.user_root().join("small.txt");
    wait_for(&placed).await;
    assert_eq!(fs::read(&placed).expect("read"), small);
    assert!(!server.user_root().join("big.bin").exists());
}

#[tokio::test]
async fn unavailable_file_releases_the_queued_fetch() {
    let server = server();
    let (mut peer, _session, _shutdown) = connect(&server);
    start_sync(&mut peer).await;

    peer.send(created_file("gone.txt", b"gone")).await;
    assert!(matches!(peer.recv().await, Message::GetFile(_)));
    peer.send(created_file("kept.txt", b"kept")).await;

    peer.send(Message::error(ErrorCode::Internal, "")).await;
    peer.send(Message::FileEnd(FileEnd {
        name: "gone.txt".to_string(),
        path: "%ROOT_DIR%".to_string(),
    }))
    .await;
    let Message::GetFile(next) = peer.recv().await else {
        panic!("expected the queued GetFile");
    };
    assert_eq!(next.name, "kept.txt");
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}

// ---------------------------------------------------------------------------
// Client against server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_establishes_against_server() {
    let server = server();
    let (ours, theirs) = tokio::io::duplex(1 << 20);
    let (their_reader, their_writer) = tokio::io::split(theirs);
    let (shutdown, _) = broadcast::channel(4);
    let _session = tokio::spawn(serve(
        server.ctx.clone(),
        peer_addr(),
        their_reader,
        their_writer,
        shutdown.subscribe(),
    ));

    let (reader, writer) = tokio::io::split(ours);
    let (messenger, _writer_task) = Messenger::spawn(writer);
    let mut frames = FrameReader::new(reader, 1 << 20);
    let config = ClientConfig {
        login: "alice".to_string(),
        password: "secret".to_string(),
        ..ClientConfig::default()
    };

    let established = establish(&mut frames, &messenger, &config, Versioning::current(), None)
        .await
        .expect("establish");
    assert_eq!(established.server.party_name, "filesync-server");
    assert_eq!(messenger.token(), established.token);
    assert!(!established.session_key.is_empty());
}

#[tokio::test]
async fn client_sees_rejection_as_sync_breaking() {
    let server = server();
    let (ours, theirs) = tokio::io::duplex(1 << 20);
    let (their_reader, their_writer) = tokio::io::split(theirs);
    let (shutdown, _) = broadcast::channel(4);
    let _session = tokio::spawn(serve(
        server.ctx.clone(),
        peer_addr(),
        their_reader,
        their_writer,
        shutdown.subscribe(),
    ));

    let (reader, writer) = tokio::io::split(ours);
    let (messenger, _writer_task) = Messenger::spawn(writer);
    let mut frames = FrameReader::new(reader, 1 << 20);
    let config = ClientConfig {
        login: "alice".to_string(),
        password: "wrong".to_string(),
        ..ClientConfig::default()
    };

    let err = establish(&mut frames, &messenger, &config, Versioning::current(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AccessDenied);
    assert!(err.code().is_sync_breaking());
}
