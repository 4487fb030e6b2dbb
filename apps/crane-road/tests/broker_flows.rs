//! End-to-end broker flows over the in-process coordination store. Sockets
//! are stood in for by hub receivers, so every message a client would see
//! can be asserted on directly.

use std::sync::Arc;
use std::time::Duration;

use crane_road::auth::DenyAll;
use crane_road::broker::{Broker, Peer};
use crane_road::config::{BrokerConfig, LeasePolicy};
use crane_road::directory::{AgentDirectory, AgentStatus, InMemoryDirectory};
use crane_road::registry::Outbound;
use crane_road::signaling::{ClientEvent, Envelope};
use crane_sdk::frame::BINARY_FLAG;
use crane_sdk::memory::InMemoryCoordinationStore;
use crane_sdk::store::{keys, PositionEntry, PositionStore, SessionKind};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        lock_backoff: Duration::from_millis(5),
        ..BrokerConfig::default()
    }
}

struct Harness {
    broker: Arc<Broker>,
    store: Arc<InMemoryCoordinationStore>,
    directory: Arc<InMemoryDirectory>,
}

struct Client {
    peer: Peer,
    rx: UnboundedReceiver<Outbound>,
}

impl Client {
    fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }

    /// Payloads of queued events called `name`. Everything queued is consumed.
    fn events(&mut self, name: &str) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Event { event, data } if event == name => Some(data),
                _ => None,
            })
            .collect()
    }

    fn last_event(&mut self, name: &str) -> Value {
        self.events(name)
            .pop()
            .unwrap_or_else(|| panic!("no {name} event queued"))
    }

    async fn wait_for(&mut self, name: &str, action: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.rx.recv().await {
                    Some(Outbound::Event { event, data })
                        if event == name && data["action"] == action =>
                    {
                        return data;
                    }
                    Some(_) => continue,
                    None => panic!("hub channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name}/{action} within 2s"))
    }
}

impl Harness {
    fn new(config: BrokerConfig) -> Self {
        let store = InMemoryCoordinationStore::new();
        let directory = InMemoryDirectory::new();
        let broker = Broker::new(config, store.clone(), directory.clone(), Arc::new(DenyAll));
        Self {
            broker,
            store,
            directory,
        }
    }

    async fn operator(&self, user: &str) -> Client {
        let peer = Peer::operator(user);
        let rx = self.broker.hub().attach(&peer.connection_id);
        self.broker
            .open_operator(&peer, Some(format!("phone-{user}")))
            .await
            .unwrap();
        Client { peer, rx }
    }

    async fn agent(&self, name: &str) -> (Client, String) {
        let peer = Peer::agent();
        let rx = self.broker.hub().attach(&peer.connection_id);
        let mut client = Client { peer, rx };
        self.send(
            &mut client,
            "register",
            json!({ "name": name, "status": "running", "mapName": "yard-a" }),
        )
        .await;
        let reply = client.last_event("register");
        assert_eq!(reply["result"], "success");
        let crane_id = reply["algorithmId"].as_str().unwrap().to_string();
        (client, crane_id)
    }

    async fn send(&self, client: &mut Client, event: &str, data: Value) {
        let event = ClientEvent::from_envelope(Envelope::new(event, data)).unwrap();
        self.broker.handle_event(&mut client.peer, event).await;
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn concurrent_requests_grant_exactly_one_operator() {
    let h = Harness::new(fast_config());
    let arbiter = h.broker.arbiter();
    let users: Vec<String> = (0..6).map(|i| format!("u{i}")).collect();

    let results = join_all(users.iter().map(|u| arbiter.request_control("c1", u))).await;
    let winners: Vec<&String> = users
        .iter()
        .zip(&results)
        .filter(|(_, r)| r.is_ok())
        .map(|(u, _)| u)
        .collect();
    assert_eq!(winners.len(), 1, "results: {results:?}");
    let winner = winners[0];

    let loser = users.iter().find(|u| *u != winner).unwrap();
    let view = h
        .broker
        .broadcaster()
        .check_access("c1", loser)
        .await
        .unwrap()
        .to_value();
    assert_eq!(view["c1"], "occupied");
    assert_eq!(view["currentOccupiedId"], winner.as_str());

    let report = arbiter.diagnose_index().await.unwrap();
    assert_eq!(report.leases, 1);
    assert!(report.is_consistent());
    assert!(!h.store.contains_key(&keys::lock("lease", "c1")).await);
}

#[test_timeout::tokio_timeout_test(10)]
async fn request_control_replies_and_pushes_viewer_relative_status() {
    let h = Harness::new(fast_config());
    let mut holder = h.operator("u1").await;
    let mut watcher = h.operator("u2").await;
    h.send(
        &mut watcher,
        "refresh-status",
        json!({ "craneId": "c1", "userId": "u2" }),
    )
    .await;
    assert_eq!(watcher.last_event("status-notify")["c1"], "free");

    h.send(
        &mut holder,
        "request-control",
        json!({ "craneId": "c1", "userId": "u1" }),
    )
    .await;
    let queued = holder.drain();
    assert!(queued.contains(&Outbound::event("request-control", json!("success"))));
    assert!(queued.iter().any(|m| matches!(
        m,
        Outbound::Event { event, data } if event == "status-notify" && data["c1"] == "using"
    )));

    let seen = watcher.last_event("status-notify");
    assert_eq!(seen["c1"], "occupied");
    assert_eq!(seen["currentOccupiedId"], "u1");
    assert_eq!(seen["userName"], "phone-u1");

    h.send(
        &mut watcher,
        "request-control",
        json!({ "craneId": "c1", "userId": "u2" }),
    )
    .await;
    assert_eq!(watcher.last_event("request-control"), json!("fail"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn events_claiming_another_identity_are_dropped() {
    let h = Harness::new(fast_config());
    let mut client = h.operator("u1").await;
    h.send(
        &mut client,
        "request-control",
        json!({ "craneId": "c1", "userId": "u2" }),
    )
    .await;
    assert!(client.drain().is_empty());
    assert_eq!(h.broker.arbiter().find_user_by_crane("c1").await.unwrap(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn release_and_reassign_through_events() {
    let h = Harness::new(fast_config());
    let mut u1 = h.operator("u1").await;
    let mut u2 = h.operator("u2").await;
    h.send(&mut u1, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    u1.drain();

    // Only the holder may hand the crane on.
    h.send(
        &mut u2,
        "reassign-control",
        json!({ "craneId": "c1", "fromUserId": "u2", "toUserId": "u2" }),
    )
    .await;
    assert_eq!(u2.last_event("reassign-control"), json!("fail"));

    h.send(
        &mut u1,
        "reassign-control",
        json!({ "craneId": "c1", "fromUserId": "u1", "toUserId": "u2" }),
    )
    .await;
    assert_eq!(u1.last_event("reassign-control"), json!("success"));
    let arbiter = h.broker.arbiter();
    assert_eq!(arbiter.find_user_by_crane("c1").await.unwrap().as_deref(), Some("u2"));
    assert_eq!(arbiter.find_crane_by_user("u1").await.unwrap(), None);

    h.send(&mut u2, "release-control", json!({ "craneId": "c1", "userId": "u2" }))
        .await;
    assert_eq!(u2.last_event("release-control"), json!("success"));
    assert_eq!(arbiter.find_user_by_crane("c1").await.unwrap(), None);
    assert!(arbiter.diagnose_index().await.unwrap().is_consistent());
}

#[test_timeout::tokio_timeout_test(10)]
async fn hand_over_policy_frees_the_previous_crane() {
    let h = Harness::new(BrokerConfig {
        lease_policy: LeasePolicy::HandOver,
        ..fast_config()
    });
    let mut u1 = h.operator("u1").await;
    let mut u2 = h.operator("u2").await;
    h.send(&mut u2, "refresh-status", json!({ "craneId": "c1", "userId": "u2" }))
        .await;
    h.send(&mut u1, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    h.send(&mut u1, "request-control", json!({ "craneId": "c2", "userId": "u1" }))
        .await;
    assert_eq!(u1.last_event("request-control"), json!("success"));
    let pushes = u2.events("status-notify");
    assert_eq!(pushes.last().unwrap()["c1"], "free");
    assert_eq!(
        h.broker.arbiter().find_crane_by_user("u1").await.unwrap().as_deref(),
        Some("c2")
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn agent_registration_is_idempotent_by_name() {
    let h = Harness::new(fast_config());
    let (_first, id) = h.agent("tower-north").await;
    let (_second, again) = h.agent("tower-north").await;
    assert_eq!(id, again);
    let registered = h.directory.get(&id).await.unwrap().unwrap();
    assert_eq!(registered.status, AgentStatus::Running);
    assert_eq!(registered.map_name.as_deref(), Some("yard-a"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn relay_binds_holder_and_agent() {
    let h = Harness::new(fast_config());
    let (mut agent, crane_id) = h.agent("tower-north").await;
    let mut operator = h.operator("u1").await;

    // Unbound traffic goes nowhere.
    h.broker.handle_binary(&operator.peer, &[1, 2, 3]).await;
    assert!(agent.drain().is_empty());

    h.send(
        &mut operator,
        "request-control",
        json!({ "craneId": crane_id, "userId": "u1" }),
    )
    .await;
    operator.drain();

    h.broker.handle_binary(&operator.peer, &[1, 2, 3]).await;
    assert_eq!(agent.drain(), vec![Outbound::Binary(vec![BINARY_FLAG, 1, 2, 3])]);

    h.broker.handle_binary(&agent.peer, &[9, 8]).await;
    assert_eq!(operator.drain(), vec![Outbound::Binary(vec![9, 8])]);

    h.send(&mut operator, "relay-text", json!({ "cmd": "hoist" })).await;
    assert_eq!(agent.last_event("relay-text"), json!({ "cmd": "hoist" }));

    h.send(
        &mut operator,
        "force-map-update",
        json!({ "craneId": crane_id, "mapName": "yard-b" }),
    )
    .await;
    assert_eq!(agent.last_event("force-map-update")["mapName"], "yard-b");
    assert_eq!(operator.last_event("force-map-update"), json!("success"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn agent_disconnect_frees_its_crane() {
    let h = Harness::new(fast_config());
    let (agent, crane_id) = h.agent("tower-north").await;
    let mut operator = h.operator("u1").await;
    h.send(
        &mut operator,
        "request-control",
        json!({ "craneId": crane_id, "userId": "u1" }),
    )
    .await;
    operator.drain();

    h.broker.handle_disconnect(&agent.peer).await;

    let pushes = operator.events("status-notify");
    assert!(pushes
        .iter()
        .any(|p| p["action"] == "agent_offline" && p[crane_id.as_str()] == "disconnected"));
    assert_eq!(pushes.last().unwrap()[crane_id.as_str()], "free");
    assert_eq!(h.broker.arbiter().find_user_by_crane(&crane_id).await.unwrap(), None);
    assert_eq!(
        h.directory.get(&crane_id).await.unwrap().unwrap().status,
        AgentStatus::Idle
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn operator_disconnect_releases_lease_and_position() {
    let h = Harness::new(fast_config());
    h.directory.assign_place("u1", "p1").await;
    let mut operator = h.operator("u1").await;
    h.send(&mut operator, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    h.send(
        &mut operator,
        "location-update",
        json!({ "userId": "u1", "placeId": "p1", "location": { "x": 1.5, "y": 2.0 } }),
    )
    .await;
    assert_eq!(h.store.raw_positions("p1").await.unwrap().len(), 1);

    h.broker.handle_disconnect(&operator.peer).await;

    assert_eq!(h.broker.arbiter().find_user_by_crane("c1").await.unwrap(), None);
    assert!(h.store.raw_positions("p1").await.unwrap().is_empty());
    assert!(!h.broker.hub().is_attached(&operator.peer.connection_id));
}

#[test_timeout::tokio_timeout_test(10)]
async fn stale_connection_closing_keeps_lease_of_reconnected_operator() {
    let h = Harness::new(fast_config());
    let mut old = h.operator("u1").await;
    h.send(&mut old, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    let _new = h.operator("u1").await;

    h.broker.handle_disconnect(&old.peer).await;

    assert_eq!(
        h.broker.arbiter().find_user_by_crane("c1").await.unwrap().as_deref(),
        Some("u1")
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn exit_releases_and_closes() {
    let h = Harness::new(fast_config());
    let mut operator = h.operator("u1").await;
    h.send(&mut operator, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    operator.drain();
    h.send(&mut operator, "exit", json!({ "userId": "u1", "placeId": "p1" }))
        .await;
    assert_eq!(operator.drain().last(), Some(&Outbound::Close));
    assert_eq!(h.broker.arbiter().find_user_by_crane("c1").await.unwrap(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn duplicate_expiry_events_notify_once() {
    let h = Harness::new(fast_config());
    let (_agent, crane_id) = h.agent("tower-north").await;
    let mut operator = h.operator("u1").await;
    h.broker.start().await.unwrap();

    let key = keys::lease(&crane_id);
    assert_eq!(h.broker.watcher().dispatch(&key).await, 1);
    assert_eq!(h.broker.watcher().dispatch(&key).await, 1);

    let expired: Vec<Value> = operator
        .events("status-notify")
        .into_iter()
        .filter(|p| p["action"] == "control_expired")
        .collect();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0][crane_id.as_str()], "free");
    assert!(expired[0]["currentOccupiedId"].is_null());
    assert_eq!(
        h.directory.get(&crane_id).await.unwrap().unwrap().status,
        AgentStatus::Idle
    );
    h.broker.shutdown().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn lapsed_lease_is_announced_through_the_watcher() {
    let h = Harness::new(BrokerConfig {
        lease_ttl: Duration::from_millis(40),
        ..fast_config()
    });
    let (_agent, crane_id) = h.agent("tower-north").await;
    let mut operator = h.operator("u1").await;
    h.broker.start().await.unwrap();
    assert!(h.broker.watcher().is_running().await);

    h.send(
        &mut operator,
        "request-control",
        json!({ "craneId": crane_id, "userId": "u1" }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.store.purge_expired().await;

    let notice = operator.wait_for("status-notify", "control_expired").await;
    assert_eq!(notice["craneId"], crane_id.as_str());
    assert_eq!(h.broker.arbiter().find_user_by_crane(&crane_id).await.unwrap(), None);
    h.broker.shutdown().await;
    assert!(!h.broker.watcher().is_running().await);
}

#[test_timeout::tokio_timeout_test(10)]
async fn heartbeat_sweep_evicts_silent_operator_and_frees_crane() {
    let h = Harness::new(BrokerConfig {
        session_timeout: Duration::from_millis(30),
        ..fast_config()
    });
    let mut silent = h.operator("u1").await;
    let mut watcher = h.operator("u2").await;
    h.send(&mut silent, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.send(&mut watcher, "refresh-status", json!({ "craneId": "c1", "userId": "u2" }))
        .await;
    h.send(&mut watcher, "heartbeat", Value::Null).await;
    watcher.drain();

    let report = h.broker.monitor().sweep_sessions().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.released, 1);

    assert_eq!(silent.drain().last(), Some(&Outbound::Close));
    assert_eq!(watcher.last_event("status-notify")["c1"], "free");
    assert!(h
        .broker
        .registry()
        .session(&watcher.peer.connection_id)
        .await
        .unwrap()
        .is_some());
}

#[test_timeout::tokio_timeout_test(10)]
async fn heartbeat_sweep_of_superseded_session_keeps_lease() {
    let h = Harness::new(BrokerConfig {
        session_timeout: Duration::from_millis(50),
        ..fast_config()
    });
    let mut old = h.operator("u1").await;
    h.send(&mut old, "request-control", json!({ "craneId": "c1", "userId": "u1" }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let new = h.operator("u1").await;

    let report = h.broker.monitor().sweep_sessions().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(report.released, 0);

    assert_eq!(old.drain().last(), Some(&Outbound::Close));
    assert_eq!(
        h.broker.arbiter().find_user_by_crane("c1").await.unwrap().as_deref(),
        Some("u1")
    );
    assert!(h
        .broker
        .registry()
        .owns_presence(SessionKind::Operator, "u1", &new.peer.connection_id)
        .await);
}

#[test_timeout::tokio_timeout_test(10)]
async fn position_sweep_drops_stale_and_unreadable_entries() {
    let h = Harness::new(BrokerConfig {
        position_timeout: Duration::from_secs(20),
        ..fast_config()
    });
    let mut operator = h.operator("u1").await;
    h.send(
        &mut operator,
        "location-update",
        json!({ "userId": "u1", "placeId": "p1", "location": { "x": 0 }, "userInfo": { "role": "rigger" } }),
    )
    .await;
    let stale = PositionEntry {
        location: json!({ "x": 9 }),
        last_heartbeat_at: Some(0),
    };
    h.store.put_position("p1", "u-old", &stale).await.unwrap();
    let unstamped = PositionEntry {
        location: json!({ "x": 3 }),
        last_heartbeat_at: None,
    };
    h.store.put_position("p1", "u-none", &unstamped).await.unwrap();
    h.store
        .put_raw_hash(&keys::positions("p1"), &[("u-junk", "not json")])
        .await;

    let report = h.broker.monitor().sweep_positions().await.unwrap();
    assert_eq!(report.buckets, 1);
    assert_eq!(report.evicted, 3);

    h.send(&mut operator, "location-query", json!({ "placeId": "p1" }))
        .await;
    let answer = operator.last_event("location-query");
    let positions = answer["positions"].as_object().unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions["u1"]["location"]["userInfo"]["role"], "rigger");
}
