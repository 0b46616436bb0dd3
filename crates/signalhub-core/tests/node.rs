//! End-to-end scenarios driving a [`Node`] through its public surface:
//! connect, subscribe, publish, presence, recovery, and control-plane
//! disconnect/unsubscribe, without any wire codec in the loop.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use signalhub_auth::AnonymousCredentialsHook;
use signalhub_core::client::{MessageHandler, ReplySink, RpcHandler};
use signalhub_core::{ChannelBatchConfig, Node, NodeBuilder, NodeConfig};
use signalhub_messages::command::{
    Command, CommandBody, CommandId, DisconnectPush, HistoryRequest, Push, ReplyOutcome, ReplyResult, SubscribeRequest,
};
use signalhub_messages::{Channel, StreamPosition, UserId};

/// Collects every [`signalhub_messages::command::Reply`] a session emits, in
/// order, for inline inspection by a test.
#[derive(Default)]
struct RecordingSink {
    replies: Mutex<VecDeque<signalhub_messages::command::Reply>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pop(&self) -> Option<signalhub_messages::command::Reply> {
        self.replies.lock().pop_front()
    }

    fn pop_push(&self) -> Option<Push> {
        loop {
            match self.pop()? {
                signalhub_messages::command::Reply {
                    outcome: ReplyOutcome::Push(push),
                    ..
                } => return Some(push),
                _ => continue,
            }
        }
    }
}

impl ReplySink for RecordingSink {
    fn enqueue(&self, reply: signalhub_messages::command::Reply) -> bool {
        self.replies.lock().push_back(reply);
        true
    }
}

fn test_node() -> Arc<Node> {
    // Unbatched: every publication flushes synchronously inside the hub's
    // broadcast call, so tests never race the background scheduler task.
    let config = NodeConfig::default().with_default_batch_config(ChannelBatchConfig::unbatched());
    NodeBuilder::new(config, Arc::new(AnonymousCredentialsHook)).build()
}

fn connect_cmd(token: &str, subs: Vec<SubscribeRequest>) -> Command {
    Command {
        id: CommandId(1),
        body: CommandBody::Connect {
            token: Some(token.to_string()),
            subs,
            name: None,
        },
    }
}

fn sub_request(channel: &Channel) -> SubscribeRequest {
    SubscribeRequest {
        channel: channel.clone(),
        recover: false,
        since: StreamPosition::ZERO,
        presence: true,
        join_leave: true,
    }
}

async fn connect(node: &Node, user: &str, sink: Arc<RecordingSink>) -> Arc<signalhub_core::client::ClientSession> {
    let session = node.new_session(sink).expect("node should not be shut down");
    let reply = session.handle_command(connect_cmd(user, Vec::new())).await;
    assert!(matches!(
        reply,
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::Connect { .. }),
            ..
        })
    ));
    session
}

#[tokio::test]
async fn publish_reaches_every_subscriber_including_the_publisher() {
    let node = test_node();
    let ch = Channel::new("room").unwrap();

    let alice_sink = RecordingSink::new();
    let alice = connect(&node, "alice", alice_sink.clone()).await;
    let bob_sink = RecordingSink::new();
    let bob = connect(&node, "bob", bob_sink.clone()).await;

    alice
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Subscribe(sub_request(&ch)),
        })
        .await;
    bob.handle_command(Command {
        id: CommandId(2),
        body: CommandBody::Subscribe(sub_request(&ch)),
    })
    .await;

    let publish_reply = alice
        .handle_command(Command {
            id: CommandId(3),
            body: CommandBody::Publish {
                channel: ch.clone(),
                data: Bytes::from_static(b"hello"),
            },
        })
        .await;
    assert!(matches!(
        publish_reply,
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::Publish { .. }),
            ..
        })
    ));

    // both subscribers, including the publisher, get the fan-out push
    let alice_push = alice_sink.pop_push().expect("alice should see her own publication");
    let bob_push = bob_sink.pop_push().expect("bob should see alice's publication");
    match (alice_push, bob_push) {
        (Push::Publication { channel: ca, publication: pa }, Push::Publication { channel: cb, publication: pb }) => {
            assert_eq!(ca, ch);
            assert_eq!(cb, ch);
            assert_eq!(pa.data, Bytes::from_static(b"hello"));
            assert_eq!(pb.data, Bytes::from_static(b"hello"));
        }
        other => panic!("expected Publication pushes, got {other:?}"),
    }
}

#[tokio::test]
async fn num_subscribers_reflects_live_subscriptions_only() {
    let node = test_node();
    let ch = Channel::new("room").unwrap();

    let a = connect(&node, "alice", RecordingSink::new()).await;
    a.handle_command(Command {
        id: CommandId(2),
        body: CommandBody::Subscribe(sub_request(&ch)),
    })
    .await;
    assert_eq!(node.hub().num_subscribers(&ch), 1);

    a.handle_command(Command {
        id: CommandId(3),
        body: CommandBody::Unsubscribe { channel: ch.clone() },
    })
    .await;
    assert_eq!(node.hub().num_subscribers(&ch), 0);
}

#[tokio::test]
async fn presence_tracks_join_and_leave_with_accurate_stats() {
    let node = test_node();
    let ch = Channel::new("lobby").unwrap();

    let alice_sink = RecordingSink::new();
    let alice = connect(&node, "alice", alice_sink.clone()).await;
    let bob_sink = RecordingSink::new();
    let bob = connect(&node, "bob", bob_sink.clone()).await;

    alice
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Subscribe(sub_request(&ch)),
        })
        .await;

    // alice should have received no join push for her own subscribe (she's
    // the only subscriber so far); bob's join fires after he subscribes.
    bob.handle_command(Command {
        id: CommandId(2),
        body: CommandBody::Subscribe(sub_request(&ch)),
    })
    .await;

    let stats_reply = alice
        .handle_command(Command {
            id: CommandId(3),
            body: CommandBody::PresenceStats { channel: ch.clone() },
        })
        .await;
    match stats_reply {
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::PresenceStats { num_clients, num_users }),
            ..
        }) => {
            assert_eq!(num_clients, 2);
            assert_eq!(num_users, 2);
        }
        other => panic!("expected PresenceStats result, got {other:?}"),
    }

    let join_push = alice_sink.pop_push().expect("alice should see bob's join");
    assert!(matches!(join_push, Push::Join { .. }));

    bob.handle_command(Command {
        id: CommandId(3),
        body: CommandBody::Unsubscribe { channel: ch.clone() },
    })
    .await;
    let leave_push = alice_sink.pop_push().expect("alice should see bob's leave");
    assert!(matches!(leave_push, Push::Leave { .. }));

    let stats = node.presence_stats(&ch).await.unwrap();
    assert_eq!(stats.num_clients, 1);
    assert_eq!(stats.num_users, 1);
}

#[tokio::test]
async fn resubscribe_with_recover_replays_whatever_is_still_retained() {
    let node = test_node();
    let ch = Channel::new("chat").unwrap();

    let alice_sink = RecordingSink::new();
    let alice = connect(&node, "alice", alice_sink.clone()).await;
    alice
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Subscribe(sub_request(&ch)),
        })
        .await;

    // publish a couple of messages via the node directly (e.g. a server job)
    node.publish(&ch, Bytes::from_static(b"m1")).await.unwrap();
    let p2 = node.publish(&ch, Bytes::from_static(b"m2")).await.unwrap();

    // alice saw both pushes live; drop them so we can isolate recovery
    alice_sink.pop_push();
    alice_sink.pop_push();

    alice
        .handle_command(Command {
            id: CommandId(3),
            body: CommandBody::Unsubscribe { channel: ch.clone() },
        })
        .await;

    // resubscribe claiming to have seen only the first publication
    let mut req = sub_request(&ch);
    req.recover = true;
    req.since = StreamPosition { offset: p2.offset - 1, epoch: p2.epoch };
    let reply = alice
        .handle_command(Command {
            id: CommandId(4),
            body: CommandBody::Subscribe(req),
        })
        .await;

    match reply {
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::Subscribe(result)),
            ..
        }) => {
            assert!(result.recovered);
            assert_eq!(result.publications_len, 1);
        }
        other => panic!("expected Subscribe result, got {other:?}"),
    }

    let replayed = alice_sink.pop_push().expect("the missed publication should have replayed");
    match replayed {
        Push::Publication { publication, .. } => assert_eq!(publication.data, Bytes::from_static(b"m2")),
        other => panic!("expected a Publication push, got {other:?}"),
    }
}

#[tokio::test]
async fn history_command_returns_retained_publications() {
    let node = test_node();
    let ch = Channel::new("chat").unwrap();
    node.publish(&ch, Bytes::from_static(b"m1")).await.unwrap();
    node.publish(&ch, Bytes::from_static(b"m2")).await.unwrap();

    let alice = connect(&node, "alice", RecordingSink::new()).await;
    let reply = alice
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::History(HistoryRequest {
                channel: ch,
                limit: None,
                since: None,
                reverse: false,
            }),
        })
        .await;

    match reply {
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::History { publications, .. }),
            ..
        }) => assert_eq!(publications.len(), 2),
        other => panic!("expected History result, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_user_closes_every_session_for_that_user() {
    let node = test_node();

    let sink1 = RecordingSink::new();
    let session1 = connect(&node, "alice", sink1.clone()).await;
    let sink2 = RecordingSink::new();
    let session2 = connect(&node, "alice", sink2.clone()).await;

    assert_eq!(node.num_clients(), 2);
    assert_eq!(node.num_users(), 1);

    node.disconnect_user(&UserId::from("alice"), DisconnectPush::KICKED)
        .await
        .unwrap();

    // control messages dispatch synchronously through MemoryBroker, so both
    // sessions are already closed by the time publish_control returns.
    assert_eq!(session1.state(), signalhub_core::client::SessionState::Closed);
    assert_eq!(session2.state(), signalhub_core::client::SessionState::Closed);
    assert_eq!(node.num_clients(), 0);

    let push1 = sink1.pop_push().expect("session1 should see a disconnect push");
    assert!(matches!(push1, Push::Disconnect(DisconnectPush { reason: signalhub_messages::command::DisconnectReason::Kicked, .. })));
    let push2 = sink2.pop_push().expect("session2 should see a disconnect push");
    assert!(matches!(push2, Push::Disconnect(_)));
}

#[tokio::test]
async fn unsubscribe_user_forces_every_session_off_the_channel() {
    let node = test_node();
    let ch = Channel::new("room").unwrap();

    let sink = RecordingSink::new();
    let session = connect(&node, "alice", sink.clone()).await;
    session
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Subscribe(sub_request(&ch)),
        })
        .await;
    assert_eq!(node.hub().num_subscribers(&ch), 1);

    node.unsubscribe_user(&UserId::from("alice"), &ch).await.unwrap();

    // force_unsubscribe spawns a detached task to do the actual bookkeeping;
    // give it a turn to run before asserting.
    for _ in 0..10 {
        tokio::task::yield_now().await;
        if node.hub().num_subscribers(&ch) == 0 {
            break;
        }
    }
    assert_eq!(node.hub().num_subscribers(&ch), 0);
}

struct EchoRpc;

#[async_trait::async_trait]
impl RpcHandler for EchoRpc {
    async fn handle(
        &self,
        _client_id: signalhub_messages::ClientId,
        _user_id: &UserId,
        method: &str,
        data: Bytes,
    ) -> Result<Bytes, signalhub_core::SessionError> {
        assert_eq!(method, "echo");
        Ok(data)
    }
}

#[tokio::test]
async fn rpc_command_dispatches_to_the_configured_handler() {
    let config = NodeConfig::default().with_default_batch_config(ChannelBatchConfig::unbatched());
    let node = NodeBuilder::new(config, Arc::new(AnonymousCredentialsHook))
        .with_rpc_handler(Arc::new(EchoRpc))
        .build();

    let session = connect(&node, "alice", RecordingSink::new()).await;
    let reply = session
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Rpc {
                method: "echo".to_string(),
                data: Bytes::from_static(b"ping"),
            },
        })
        .await;

    match reply {
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::Rpc(data)),
            ..
        }) => assert_eq!(data, Bytes::from_static(b"ping")),
        other => panic!("expected Rpc result, got {other:?}"),
    }
}

struct RecordingMessageHandler {
    received: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait::async_trait]
impl MessageHandler for RecordingMessageHandler {
    async fn handle(&self, _client_id: signalhub_messages::ClientId, _user_id: &UserId, data: Bytes) {
        self.received.lock().push(data);
    }
}

#[tokio::test]
async fn send_command_has_no_reply_but_reaches_the_message_handler() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let config = NodeConfig::default().with_default_batch_config(ChannelBatchConfig::unbatched());
    let node = NodeBuilder::new(config, Arc::new(AnonymousCredentialsHook))
        .with_message_handler(Arc::new(RecordingMessageHandler { received: received.clone() }))
        .build();

    let session = connect(&node, "alice", RecordingSink::new()).await;
    let reply = session
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Send { data: Bytes::from_static(b"fire and forget") },
        })
        .await;
    assert!(reply.is_none());
    assert_eq!(*received.lock(), vec![Bytes::from_static(b"fire and forget")]);
}

#[tokio::test]
async fn ping_gets_a_pong() {
    let node = test_node();
    let session = connect(&node, "alice", RecordingSink::new()).await;
    let reply = session
        .handle_command(Command {
            id: CommandId(2),
            body: CommandBody::Ping,
        })
        .await;
    assert!(matches!(
        reply,
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Result(ReplyResult::Pong),
            ..
        })
    ));
}

#[tokio::test]
async fn shutdown_disconnects_live_sessions_and_stops_new_ones() {
    let node = test_node();
    let sink = RecordingSink::new();
    let session = connect(&node, "alice", sink.clone()).await;

    node.shutdown().await;

    assert_eq!(session.state(), signalhub_core::client::SessionState::Closed);
    let push = sink.pop_push().expect("session should see a shutdown disconnect push");
    assert!(matches!(push, Push::Disconnect(DisconnectPush { reason: signalhub_messages::command::DisconnectReason::Shutdown, .. })));

    assert!(node.new_session(RecordingSink::new()).is_none());
}

#[tokio::test]
async fn commands_before_connect_are_rejected() {
    let node = test_node();
    let session = node.new_session(RecordingSink::new()).expect("node should not be shut down");
    let reply = session
        .handle_command(Command {
            id: CommandId(1),
            body: CommandBody::Ping,
        })
        .await;
    match reply {
        Some(signalhub_messages::command::Reply {
            outcome: ReplyOutcome::Error(err),
            ..
        }) => assert_eq!(err.code, signalhub_messages::command::ErrorCode::BadRequest),
        other => panic!("expected a BadRequest error reply, got {other:?}"),
    }
}
