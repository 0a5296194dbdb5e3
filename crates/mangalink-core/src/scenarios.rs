//! Host and Client sessions talking over an in-memory connection.

use crate::command::{
    self, Command, CommandEnvelope, ContentType, EpisodeArgs, EpisodeDescriptor, EpisodeReply,
    FetchArgs, MetaPayload, Role,
};
use crate::config::SessionConfig;
use crate::error::ShareError;
use crate::remote::RemoteContentClient;
use crate::service::tests::{manga_fixture, open_service, write_episode};
use crate::service::ContentService;
use crate::session::{ControlSession, ControlState};
use crate::transfer::FILE_CHANNEL_LABEL;
use crate::view::{Library, Shelf};
use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use transport::memory::MemoryConnection;
use transport::{ChannelState, DynChannel, Frame, PeerConnection, CONTROL_CHANNEL_ID};

const MAX_MESSAGE: usize = 16 * 1024;
const PATIENCE: Duration = Duration::from_secs(5);

struct Pair {
    host: ControlSession,
    host_task: JoinHandle<()>,
    service: Arc<ContentService>,
    client: RemoteContentClient,
    client_task: JoinHandle<()>,
    _root: TempDir,
}

async fn connect(root: TempDir, config: SessionConfig) -> Result<Pair> {
    let service = Arc::new(open_service(root.path(), &config).await?);
    let (host_conn, client_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let (host, host_task) = ControlSession::host(Arc::new(host_conn), service.clone(), &config);
    let (client, client_task) = RemoteContentClient::connect(Arc::new(client_conn), &config);
    client.session().wait_ready().await?;
    host.wait_ready().await?;
    Ok(Pair {
        host,
        host_task,
        service,
        client,
        client_task,
        _root: root,
    })
}

/// A Client session whose Host end is driven by hand.
async fn client_with_raw_host(
    config: SessionConfig,
) -> Result<(RemoteContentClient, JoinHandle<()>, MemoryConnection, DynChannel)> {
    let (host_conn, client_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let control = host_conn.open_control_channel(CONTROL_CHANNEL_ID).await?;
    let (client, task) = RemoteContentClient::connect(Arc::new(client_conn), &config);
    client.session().wait_ready().await?;
    Ok((client, task, host_conn, control))
}

async fn next_envelope(channel: &DynChannel) -> Result<CommandEnvelope> {
    match tokio::time::timeout(PATIENCE, channel.recv()).await? {
        Some(Frame::Text(text)) => Ok(command::decode(&text)?),
        other => anyhow::bail!("unexpected frame {other:?}"),
    }
}

async fn send_raw(channel: &DynChannel, cmd: Command, target: Role, args: Value) -> Result<()> {
    let text = command::encode(&CommandEnvelope::with_args(cmd, target, args))?;
    channel.send(Frame::Text(text)).await?;
    Ok(())
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

#[tokio::test]
async fn test_episode_then_fetch() -> Result<()> {
    let root = TempDir::new()?;
    write_episode(
        &root.path().join("ep0"),
        &[("a.jpg", "AAAA"), ("b.jpg", "BBBBBB"), ("c.jpg", "C")],
    )?;
    let pair = connect(root, SessionConfig::default()).await?;

    let ep = pair.client.episode(0).await?;
    assert_eq!(ep, EpisodeDescriptor { name: "ep0".into(), length: 3 });
    assert_eq!(pair.client.fetch_file(1).await?, b"BBBBBB".to_vec());

    Ok(())
}

#[tokio::test]
async fn test_fetch_out_of_range_rejects_and_releases_channel() -> Result<()> {
    let root = TempDir::new()?;
    write_episode(
        &root.path().join("ep0"),
        &[("a.jpg", "A"), ("b.jpg", "B"), ("c.jpg", "C")],
    )?;
    let pair = connect(root, SessionConfig::default()).await?;

    let err = pair.client.fetch_file(5).await.unwrap_err();
    assert!(matches!(err, ShareError::IndexOutOfRange { index: 5, length: 3 }));
    assert_eq!(pair.host.engine().open_channels().await, 0);

    // The connection carries on
    assert_eq!(pair.client.fetch_file(2).await?, b"C".to_vec());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_fetches_stay_separate() -> Result<()> {
    let root = TempDir::new()?;
    let first = pattern(1536 * 1024, 0x11);
    let second = pattern(1536 * 1024 + 77, 0x5a);
    let dir = root.path().join("ep0");
    std::fs::create_dir(&dir)?;
    std::fs::write(dir.join("1.bin"), &first)?;
    std::fs::write(dir.join("2.bin"), &second)?;
    let pair = connect(root, SessionConfig::default()).await?;

    let (a, b) = tokio::join!(pair.client.fetch_in(0, 0), pair.client.fetch_in(0, 1));
    assert_eq!(a?, first);
    assert_eq!(b?, second);

    Ok(())
}

/// The data channel a Fetch just sent on `control` names, as the Host sees it.
async fn accept_fetch(control: &DynChannel, host_conn: &MemoryConnection) -> Result<DynChannel> {
    let request = next_envelope(control).await?;
    assert_eq!(request.cmd, Command::Fetch);
    let args: FetchArgs = request.args()?;
    let channel = tokio::time::timeout(PATIENCE, host_conn.accept_channel())
        .await?
        .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
    assert_eq!(channel.id(), args.channel);
    Ok(channel)
}

#[tokio::test]
async fn test_unanswered_fetch_times_out_and_closes_channel() -> Result<()> {
    let config = SessionConfig::default().with_request_timeout(Duration::from_millis(200));
    let (client, _task, host_conn, control) = client_with_raw_host(config).await?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.fetch_file(0).await }
    });
    let channel = accept_fetch(&control, &host_conn).await?;

    assert!(matches!(pending.await?, Err(ShareError::Timeout)));
    assert_eq!(channel.state(), ChannelState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_channel_closed_early_is_incomplete() -> Result<()> {
    let (client, _task, host_conn, control) = client_with_raw_host(SessionConfig::default()).await?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.fetch_file(0).await }
    });
    let channel = accept_fetch(&control, &host_conn).await?;
    channel
        .send(Frame::Text(r#"{"type":"meta","size":10}"#.into()))
        .await?;
    channel.send(Frame::Binary(vec![1, 2, 3, 4])).await?;
    channel.close();

    assert!(matches!(
        pending.await?,
        Err(ShareError::IncompleteTransfer { expected: Some(10), received: 4 })
    ));

    Ok(())
}

#[tokio::test]
async fn test_host_drops_abandoned_channels() -> Result<()> {
    let root = manga_fixture()?;
    let config = SessionConfig::default();
    let service = Arc::new(open_service(root.path(), &config).await?);
    let (host_conn, peer_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let (host, _task) = ControlSession::host(Arc::new(host_conn), service, &config);

    let control = peer_conn.open_control_channel(CONTROL_CHANNEL_ID).await?;
    control.opened().await?;
    host.wait_ready().await?;
    assert_eq!(next_envelope(&control).await?.cmd, Command::Meta);

    // Opened, then given up on before any request named it
    let gone = peer_conn.open_channel(FILE_CHANNEL_LABEL).await?;
    gone.close();

    // Named by a request whose arguments do not parse
    let malformed = peer_conn.open_channel(FILE_CHANNEL_LABEL).await?;
    send_raw(&control, Command::Fetch, Role::Host, json!({ "channel": malformed.id() })).await?;
    assert_eq!(tokio::time::timeout(PATIENCE, malformed.recv()).await?, None);

    tokio::time::timeout(PATIENCE, async {
        while host.engine().open_channels().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(host.state(), ControlState::Ready);

    Ok(())
}

#[tokio::test]
async fn test_scope_follows_successful_loads() -> Result<()> {
    let pair = connect(manga_fixture()?, SessionConfig::default()).await?;

    assert_eq!(pair.client.load_episode(1).await?, 2);
    assert_eq!(pair.client.current_scope(), 1);
    assert_eq!(pair.service.scope(), 1);
    assert_eq!(pair.client.fetch_file(0).await?, b"two-a".to_vec());

    // A fetch that names no scope uses the Host's shared one
    let mut args = Map::new();
    args.insert("index".into(), Value::from(1));
    let session = pair.client.session();
    let bytes = session
        .engine()
        .request(session, FILE_CHANNEL_LABEL, Command::Fetch, args)
        .await?;
    assert_eq!(bytes, b"two-b".to_vec());

    assert!(matches!(
        pair.client.load_episode(7).await,
        Err(ShareError::ScopeOutOfRange { scope: 7, count: 3 })
    ));
    assert_eq!(pair.client.current_scope(), 1);
    assert_eq!(pair.service.scope(), 1);

    Ok(())
}

#[tokio::test]
async fn test_empty_content() -> Result<()> {
    let pair = connect(manga_fixture()?, SessionConfig::default()).await?;

    assert_eq!(pair.client.load_episode(2).await?, 0);
    assert!(matches!(
        pair.client.fetch_file(0).await,
        Err(ShareError::IndexOutOfRange { index: 0, length: 0 })
    ));
    assert!(pair.client.fetch_abstracts().await?.is_empty());

    let pair = connect(TempDir::new()?, SessionConfig::default()).await?;
    assert_eq!(pair.client.wait_meta().await?.content_type, ContentType::Episode);
    assert_eq!(pair.client.load_episode(0).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_meta_push_and_request() -> Result<()> {
    let pair = connect(manga_fixture()?, SessionConfig::default()).await?;

    let meta = pair.client.wait_meta().await?;
    assert_eq!(meta.content_type, ContentType::Manga);
    assert_eq!(
        meta.episode_names,
        Some(vec!["ep1".to_string(), "ep2".to_string(), "ep3".to_string()])
    );
    let view = pair.client.view().unwrap();
    assert_eq!(view.episode_count(), 3);
    assert_eq!(Some(view), Library::view(pair.service.as_ref()));

    pair.client.load_episode(1).await?;
    pair.client.request_meta().await?;
    tokio::time::timeout(PATIENCE, async {
        while pair.client.meta().map(|m| m.episode) != Some("ep2".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    Ok(())
}

#[tokio::test]
async fn test_abstracts_split_per_file() -> Result<()> {
    let root = TempDir::new()?;
    write_episode(
        &root.path().join("ep0"),
        &[("a.jpg", "AAAA-1"), ("b.jpg", "BBBB-2"), ("c.jpg", "CC")],
    )?;
    let config = SessionConfig::default().with_abstract_prefix_len(4);
    let pair = connect(root, config).await?;

    pair.client.load_episode(0).await?;
    let previews = pair.client.fetch_abstracts().await?;
    assert_eq!(previews, vec![b"AAAA".to_vec(), b"BBBB".to_vec(), b"CC".to_vec()]);

    Ok(())
}

#[tokio::test]
async fn test_library_is_uniform_across_roles() -> Result<()> {
    async fn first_page(library: &dyn Library, scope: u32) -> Result<Vec<u8>, ShareError> {
        let ep = library.list_episode(scope).await?;
        assert!(ep.length > 0);
        library.fetch(scope, 0).await
    }

    let pair = connect(manga_fixture()?, SessionConfig::default()).await?;
    let local = first_page(pair.service.as_ref(), 0).await?;
    let remote = first_page(&pair.client, 0).await?;
    assert_eq!(local, remote);
    assert_eq!(local, b"one-one".to_vec());

    Ok(())
}

#[tokio::test]
async fn test_host_ignores_its_own_echo_and_bad_frames() -> Result<()> {
    let root = manga_fixture()?;
    let config = SessionConfig::default();
    let service = Arc::new(open_service(root.path(), &config).await?);
    let (host_conn, peer_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let (host, _task) = ControlSession::host(Arc::new(host_conn), service.clone(), &config);

    let control = peer_conn.open_control_channel(CONTROL_CHANNEL_ID).await?;
    control.opened().await?;
    host.wait_ready().await?;
    assert_eq!(next_envelope(&control).await?.cmd, Command::Meta);

    // Looks like the Host's own reply coming back
    send_raw(&control, Command::Episode, Role::Client, json!({ "scope": 1 })).await?;
    control.send(Frame::Text("{not json".into())).await?;
    control
        .send(Frame::Text(r#"{"cmd":"rewind","target":0,"args":{}}"#.into()))
        .await?;
    send_raw(&control, Command::Episode, Role::Host, json!({ "index": 0 })).await?;

    let reply = next_envelope(&control).await?;
    assert_eq!(reply.cmd, Command::Episode);
    assert_eq!(reply.target, Role::Client);
    assert_eq!(reply.args::<EpisodeReply>()?.descriptor.name, "ep1");
    assert!(tokio::time::timeout(Duration::from_millis(100), control.recv())
        .await
        .is_err());
    assert_eq!(service.scope(), 0);
    assert_eq!(host.state(), ControlState::Ready);

    Ok(())
}

#[tokio::test]
async fn test_second_episode_request_is_rejected_until_timeout() -> Result<()> {
    let config = SessionConfig::default().with_request_timeout(Duration::from_millis(200));
    let (client, _task, _host_conn, control) = client_with_raw_host(config).await?;

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.load_episode(0).await }
    });
    assert_eq!(next_envelope(&control).await?.cmd, Command::Episode);

    assert!(matches!(
        client.load_episode(1).await,
        Err(ShareError::RequestAlreadyInFlight)
    ));
    assert!(matches!(first.await?, Err(ShareError::Timeout)));

    // The slot is free again once the first caller gave up
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.load_episode(1).await }
    });
    let request = next_envelope(&control).await?;
    assert_eq!(request.args::<EpisodeArgs>()?.scope, 1);
    send_raw(&control, Command::Episode, Role::Client, json!({ "name": "ep", "length": 4 })).await?;
    assert_eq!(second.await??, 4);
    assert_eq!(client.current_scope(), 1);

    Ok(())
}

#[tokio::test]
async fn test_episode_error_reply_rejects() -> Result<()> {
    let (client, _task, _host_conn, control) = client_with_raw_host(SessionConfig::default()).await?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.load_episode(9).await }
    });
    next_envelope(&control).await?;
    let reply = json!({
        "name": "",
        "length": 0,
        "error": { "kind": "scope_out_of_range", "scope": 9, "count": 2 }
    });
    send_raw(&control, Command::Episode, Role::Client, reply).await?;

    assert!(matches!(
        pending.await?,
        Err(ShareError::ScopeOutOfRange { scope: 9, count: 2 })
    ));
    assert_eq!(client.current_scope(), 0);

    Ok(())
}

#[tokio::test]
async fn test_client_stops_when_control_closes() -> Result<()> {
    let (client, task, _host_conn, control) = client_with_raw_host(SessionConfig::default()).await?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.load_episode(0).await }
    });
    next_envelope(&control).await?;
    control.close();

    assert!(matches!(pending.await?, Err(ShareError::ChannelNotReady { .. })));
    tokio::time::timeout(PATIENCE, task).await??;
    assert_eq!(client.session().state(), ControlState::Finished);
    assert!(matches!(
        client.load_episode(0).await,
        Err(ShareError::ChannelNotReady { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn test_send_before_ready_is_dropped() -> Result<()> {
    let (_host_conn, client_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let (client, _task) = RemoteContentClient::connect(Arc::new(client_conn), &SessionConfig::default());

    assert_eq!(client.session().state(), ControlState::Idle);
    assert!(matches!(
        client.load_episode(0).await,
        Err(ShareError::ChannelNotReady { channel: CONTROL_CHANNEL_ID })
    ));
    assert!(matches!(
        client.request_meta().await,
        Err(ShareError::ChannelNotReady { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn test_host_reopens_control_once() -> Result<()> {
    let root = manga_fixture()?;
    let config = SessionConfig::default();
    let service = Arc::new(open_service(root.path(), &config).await?);
    let (host_conn, peer_conn) = MemoryConnection::pair(MAX_MESSAGE);
    let (host, task) = ControlSession::host(Arc::new(host_conn), service, &config);

    let control = peer_conn.open_control_channel(CONTROL_CHANNEL_ID).await?;
    control.opened().await?;
    assert_eq!(next_envelope(&control).await?.cmd, Command::Meta);
    control.close();

    // Renegotiated, and meta is pushed again
    let control = peer_conn.open_control_channel(CONTROL_CHANNEL_ID).await?;
    tokio::time::timeout(PATIENCE, control.opened()).await??;
    assert_eq!(next_envelope(&control).await?.cmd, Command::Meta);
    assert_eq!(host.state(), ControlState::Ready);

    control.close();
    tokio::time::timeout(PATIENCE, task).await??;
    assert_eq!(host.state(), ControlState::Finished);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_both_sides() -> Result<()> {
    let pair = connect(manga_fixture()?, SessionConfig::default()).await?;

    pair.host.shutdown();
    tokio::time::timeout(PATIENCE, pair.host_task).await??;
    tokio::time::timeout(PATIENCE, pair.client_task).await??;
    assert_eq!(pair.host.state(), ControlState::Finished);
    assert_eq!(pair.client.session().state(), ControlState::Finished);

    Ok(())
}

#[tokio::test]
async fn test_meta_on_legacy_channel() -> Result<()> {
    let (client, _task, host_conn, _control) = client_with_raw_host(SessionConfig::default()).await?;

    let meta = MetaPayload {
        manga: "Title".into(),
        episode: "ep1".into(),
        content_type: ContentType::Manga,
        episode_names: Some(vec!["ep1".into()]),
    };
    let channel = host_conn.open_channel("meta").await?;
    channel
        .send(Frame::Text(serde_json::to_string(&meta)?))
        .await?;

    assert_eq!(client.wait_meta().await?, meta);
    assert_eq!(client.view().map(|v| v.title().to_string()), Some("Title".into()));

    Ok(())
}
