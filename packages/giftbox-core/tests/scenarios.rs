//! End-to-end scenarios across the relationship store and delivery channel.

use std::sync::Arc;
use std::time::Duration;

use giftbox_core::{
    ChannelConfig, ChannelEvent, Credentials, Database, Error, Identity, IdentityDirectory,
    MessageBody, MessageChannel, RelationshipStore, Target,
};

struct World {
    relationships: RelationshipStore,
    channel: MessageChannel,
}

fn id(name: &str) -> Identity {
    Identity::parse(name).unwrap()
}

fn world(names: &[&str], config: ChannelConfig) -> World {
    let db = Arc::new(Database::open(None).unwrap());
    for name in names {
        db.register(&Credentials::new(*name, "pw")).unwrap();
    }
    World {
        relationships: RelationshipStore::new(db.clone(), db.clone()),
        channel: MessageChannel::new(db.clone(), db, config),
    }
}

#[tokio::test]
async fn test_request_accept_chat_scenario() {
    let w = world(&["alice", "bob"], ChannelConfig::default());
    let (alice, bob) = (id("alice"), id("bob"));

    w.relationships.request(&alice, &bob).unwrap();
    w.relationships.respond(&bob, &alice, true).unwrap();
    assert!(w.relationships.list_friends(&alice).unwrap().contains(&bob));
    assert!(w.relationships.list_friends(&bob).unwrap().contains(&alice));
    assert!(w.relationships.list_pending(&bob).requesters().unwrap().is_empty());

    let (_conn, mut bob_rx) = w.channel.connections().open(&bob);
    let sent = w
        .channel
        .send(&alice, Target::Peer(bob.clone()), MessageBody::text("hi"))
        .await
        .unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .expect("push should arrive")
        .expect("queue open");
    match pushed {
        ChannelEvent::Message(message) => {
            assert_eq!(message.id, sent);
            assert_eq!(message.body.text.as_deref(), Some("hi"));
            assert_eq!(message.sender, alice);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let history = w.channel.history(&alice, &bob).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body.text.as_deref(), Some("hi"));
}

#[tokio::test]
async fn test_reject_then_request_again() {
    let w = world(&["alice", "bob"], ChannelConfig::default());
    let (alice, bob) = (id("alice"), id("bob"));

    w.relationships.request(&alice, &bob).unwrap();
    w.relationships.respond(&bob, &alice, false).unwrap();

    assert!(w.relationships.list_friends(&alice).unwrap().is_empty());
    assert!(w.relationships.request(&alice, &bob).is_ok());
}

#[test]
fn test_pending_blocks_both_directions_until_resolved() {
    let w = world(&["alice", "bob"], ChannelConfig::default());
    let (alice, bob) = (id("alice"), id("bob"));

    w.relationships.request(&alice, &bob).unwrap();
    assert!(matches!(w.relationships.request(&alice, &bob), Err(Error::AlreadyExists(_))));
    assert!(matches!(w.relationships.request(&bob, &alice), Err(Error::AlreadyExists(_))));

    // Only the addressee may answer
    let wrong_side = w.relationships.respond(&alice, &bob, true);
    assert!(matches!(
        wrong_side,
        Err(Error::AuthorizationDenied(_)) | Err(Error::NotFound(_))
    ));
    w.relationships.respond(&bob, &alice, true).unwrap();
}

#[tokio::test]
async fn test_history_is_ordered_and_symmetric() {
    let w = world(&["alice", "bob"], ChannelConfig::default());
    let (alice, bob) = (id("alice"), id("bob"));

    for i in 0..10 {
        let (from, to) = if i % 2 == 0 { (&alice, &bob) } else { (&bob, &alice) };
        w.channel
            .send(from, Target::Peer(to.clone()), MessageBody::text(format!("{}", i)))
            .await
            .unwrap();
    }

    let ab = w.channel.history(&alice, &bob).unwrap();
    let ba = w.channel.history(&bob, &alice).unwrap();
    assert_eq!(ab, ba);
    assert_eq!(ab.len(), 10);
    assert!(ab
        .windows(2)
        .all(|pair| (pair[0].created_at, pair[0].seq) < (pair[1].created_at, pair[1].seq)));
    let texts: Vec<String> = ab.iter().map(|m| m.body.text.clone().unwrap()).collect();
    assert_eq!(texts, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_send_never_waits_for_a_stuck_subscriber() {
    let config = ChannelConfig { queue_capacity: 1, ..ChannelConfig::default() };
    let w = world(&["alice", "bob"], config);
    let (alice, bob) = (id("alice"), id("bob"));

    // Bob connects but never reads
    let (_conn, _bob_rx) = w.channel.connections().open(&bob);

    let all_sends = async {
        for i in 0..20 {
            w.channel
                .send(&alice, Target::Peer(bob.clone()), MessageBody::text(format!("m{}", i)))
                .await
                .unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(5), all_sends)
        .await
        .expect("sends must not block on push");

    assert_eq!(w.channel.history(&alice, &bob).unwrap().len(), 20);
}

#[tokio::test]
async fn test_closed_connection_gets_no_pushes() {
    let w = world(&["alice", "bob"], ChannelConfig::default());
    let (alice, bob) = (id("alice"), id("bob"));

    let (conn, mut bob_rx) = w.channel.connections().open(&bob);
    assert!(w.channel.connections().close(conn));

    w.channel
        .send(&alice, Target::Peer(bob.clone()), MessageBody::text("after close"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob_rx.try_recv().is_err());
    assert_eq!(w.channel.stats().pushed(), 0);
    assert_eq!(w.channel.history(&alice, &bob).unwrap().len(), 1);
}
