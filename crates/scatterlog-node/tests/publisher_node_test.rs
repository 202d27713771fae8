//! Publisher-only nodes on real loopback sockets.
//!
//! Multicast itself is not exercised here (CI hosts rarely route it); the
//! key listener is plain unicast and is driven with hand-built requests.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use scatterlog_core::SystemEnv;
use scatterlog_crypto::{CredentialScheme, RequestContext, SharedSecret, XChaCha20Poly1305Suite};
use scatterlog_node::{
    ConfigError, Multicaster, NodeConfig, NodeEvent, PublisherConfig, SecurityKind, StartError,
    UdpTransport,
};
use scatterlog_proto::{
    Epoch, Facility, KeyExchange, KeyGrant, KeyReply, KeyReplyStatus, KeyRequest, Message,
    Severity, SourceIdentity,
};
use tokio::{net::UdpSocket, sync::broadcast};

const SECRET: &[u8] = b"loopback test shared secret";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn credentials(secret: &[u8]) -> Arc<SharedSecret> {
    Arc::new(SharedSecret::new(secret.to_vec()).expect("secret long enough"))
}

fn config() -> NodeConfig {
    NodeConfig::new(SocketAddr::from((Ipv4Addr::new(239, 255, 77, 1), 7400))).with_publisher(
        PublisherConfig::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .with_advertise(Ipv4Addr::LOCALHOST.into()),
    )
}

async fn start(config: NodeConfig) -> Result<Multicaster, StartError> {
    init_tracing();
    let transport = UdpTransport::from_config(&config);
    Multicaster::start(
        config,
        SystemEnv,
        transport,
        credentials(SECRET),
        Arc::new(XChaCha20Poly1305Suite),
    )
    .await
}

async fn ask(source: SourceIdentity, epoch: Epoch, nonce: u64, scheme: &SharedSecret) -> KeyReply {
    let bytes = source.canonical_bytes();
    let context = RequestContext { source: &bytes, epoch, nonce };
    let request = KeyExchange::Request(KeyRequest {
        source,
        epoch,
        nonce,
        credential: scheme.sign_request(&context).expect("sign"),
    });

    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
    socket.send_to(&request.encode().expect("encode"), source.endpoint).await.expect("send");

    let mut buf = [0u8; 2048];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("listener answered")
        .expect("recv");
    assert_eq!(from, source.endpoint);

    match KeyExchange::decode(&buf[..len]).expect("decode") {
        KeyExchange::Reply(reply) => reply,
        other => panic!("expected reply, got {other:?}"),
    }
}

fn open(reply: &KeyReply, source: SourceIdentity, epoch: Epoch, scheme: &SharedSecret) -> KeyGrant {
    let KeyReplyStatus::Granted(sealed) = &reply.status else {
        panic!("expected grant, got {:?}", reply.status);
    };
    let bytes = source.canonical_bytes();
    let context = RequestContext { source: &bytes, epoch, nonce: reply.nonce };
    let plaintext = scheme.open_grant(&context, &sealed.0).expect("grant opens");
    KeyGrant::from_cbor(&plaintext).expect("grant decodes")
}

async fn next_matching(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut matches: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived")
}

#[tokio::test]
async fn listener_grants_first_epoch() {
    let node = start(config()).await.unwrap();
    let source = node.identity().unwrap();
    assert_eq!(source.endpoint.ip(), Ipv4Addr::LOCALHOST);
    assert_ne!(source.endpoint.port(), 0);

    let scheme = credentials(SECRET);
    let reply = ask(source, 1, 0xA1, &scheme).await;
    assert_eq!(reply.nonce, 0xA1);
    assert_eq!(open(&reply, source, 1, &scheme).epoch, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn listener_answers_unknown_epoch() {
    let node = start(config()).await.unwrap();
    let source = node.identity().unwrap();

    let reply = ask(source, 9, 3, &credentials(SECRET)).await;
    assert_eq!(reply.status, KeyReplyStatus::UnknownEpoch);

    node.shutdown().await;
}

#[tokio::test]
async fn bad_credential_is_refused_and_reported() {
    let node = start(config()).await.unwrap();
    let source = node.identity().unwrap();
    let mut events = node.events();

    let reply = ask(source, 1, 4, &credentials(b"not the configured secret")).await;
    assert_eq!(reply.status, KeyReplyStatus::AuthFailed);

    let event = next_matching(&mut events, |e| matches!(e, NodeEvent::SecurityEvent { .. })).await;
    match event {
        NodeEvent::SecurityEvent {
            kind: SecurityKind::RequestCredentialRejected { key },
            peer,
        } => {
            assert_eq!(key.epoch, 1);
            assert!(peer.is_some());
        },
        other => panic!("unexpected {other:?}"),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn manual_rotation_serves_the_new_epoch() {
    let node = start(config()).await.unwrap();
    let source = node.identity().unwrap();
    let mut events = node.events();

    node.rotate_key().await.unwrap();
    let event = next_matching(&mut events, |e| matches!(e, NodeEvent::KeyRotated { .. })).await;
    assert_eq!(event, NodeEvent::KeyRotated { epoch: 2, retired: Vec::new() });

    let scheme = credentials(SECRET);
    let reply = ask(source, 2, 5, &scheme).await;
    let grant = open(&reply, source, 2, &scheme);
    assert_eq!(grant.epoch, 2);

    // The previous epoch is still retained.
    let old = ask(source, 1, 6, &scheme).await;
    assert_ne!(open(&old, source, 1, &scheme).secret, grant.secret);

    node.shutdown().await;
}

#[tokio::test]
async fn publisher_only_node_has_no_subscription() {
    let node = start(config()).await.unwrap();
    assert!(node.subscribe().is_none());
    assert!(node.try_publish(Message::new(Facility::User, Severity::Debug, "queued")).is_ok());
    node.shutdown().await;
}

#[tokio::test]
async fn invalid_config_fails_before_binding() {
    let mut config = config();
    config.group = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7400));

    let result = start(config).await;
    assert!(matches!(result, Err(StartError::Config(ConfigError::NotMulticast(_)))));
}

#[tokio::test]
async fn node_without_roles_does_not_start() {
    let mut config = config();
    config.publisher = None;
    assert!(matches!(start(config).await, Err(StartError::Config(ConfigError::NoRoles))));
}
