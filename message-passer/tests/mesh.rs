use {
    multegula_message_passer::{
        ClockSnapshot, FaultRules, Message, MessagePasser, MessagePasserConfig, Node,
        NodeDirectory, Rule, RuleAction, RuleSet, MULTICAST_DESTINATION,
    },
    std::time::Duration,
    tokio::net::TcpListener,
};

const WAIT: Duration = Duration::from_secs(10);

/// Start one passer per name inside this process, in `start_order`, with
/// `stagger` between starts.  Returned passers are in directory order.
async fn cluster(
    names: &[&str],
    start_order: &[usize],
    stagger: Duration,
    rules: impl Fn(&str) -> FaultRules,
) -> Vec<MessagePasser> {
    let mut listeners = Vec::new();
    let mut nodes = Vec::new();
    for name in names {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        nodes.push(Node::new(*name, "127.0.0.1", port));
        listeners.push(Some(listener));
    }

    let mut handles: Vec<_> = names.iter().map(|_| None).collect();
    for &i in start_order {
        let directory = NodeDirectory::new(nodes.clone()).unwrap();
        let listener = listeners[i].take().unwrap();
        let name = names[i].to_string();
        let node_rules = rules(&name);
        handles[i] = Some(tokio::spawn(async move {
            MessagePasser::start_with_listener(
                MessagePasserConfig::dev_default(),
                directory,
                &name,
                node_rules,
                listener,
            )
            .await
        }));
        tokio::time::sleep(stagger).await;
    }

    let mut passers = Vec::new();
    for handle in handles {
        let passer = tokio::time::timeout(WAIT, handle.unwrap())
            .await
            .expect("mesh setup timed out")
            .unwrap()
            .unwrap();
        passers.push(passer);
    }
    passers
}

async fn plain_cluster(names: &[&str]) -> Vec<MessagePasser> {
    let order: Vec<_> = (0..names.len()).collect();
    cluster(names, &order, Duration::ZERO, |_| FaultRules::default()).await
}

async fn next(passer: &mut MessagePasser) -> Message {
    tokio::time::timeout(WAIT, passer.receive())
        .await
        .expect("timeout waiting for delivery")
        .expect("passer closed")
}

async fn wait_for<F>(passer: &MessagePasser, condition: F) -> ClockSnapshot
where
    F: Fn(&ClockSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = passer.clock_snapshot().await.unwrap();
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached")
}

#[tokio::test]
async fn test_mesh_forms_in_any_start_order() {
    let names = ["armin", "babak", "garrett"];
    for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
        let passers = cluster(&names, &order, Duration::from_millis(30), |_| {
            FaultRules::default()
        })
        .await;
        for passer in &passers {
            assert_eq!(passer.connection_count(), names.len());
            assert_eq!(passer.live_connections(), names.len());
            assert_eq!(passer.directory().len(), names.len());
        }
    }
}

#[tokio::test]
async fn test_multicasts_reach_everyone_once_in_source_order() {
    let names = ["a", "b", "c", "d"];
    let mut passers = plain_cluster(&names).await;
    const PER_NODE: u64 = 5;

    for passer in &passers {
        for i in 0..PER_NODE {
            let content = format!("{}-{}", passer.local_name(), i);
            passer.multicast(Message::multicast("test", content)).await;
        }
    }

    let total = PER_NODE.saturating_mul(u64::try_from(names.len()).unwrap());
    for passer in &mut passers {
        let mut per_source: Vec<Vec<u64>> = vec![Vec::new(); names.len()];
        for _ in 0..total {
            let message = next(passer).await;
            let source = passer.directory().index_of(&message.source).unwrap();
            per_source[source].push(message.timestamp[source]);
        }
        for seqs in &per_source {
            assert_eq!(seqs, &(1..=PER_NODE).collect::<Vec<_>>());
        }

        let snapshot = passer.clock_snapshot().await.unwrap();
        assert_eq!(snapshot.clock, vec![PER_NODE; names.len()]);
        assert_eq!(snapshot.local_delivered, PER_NODE);
        assert_eq!(snapshot.holdback, 0);
    }

    // relayed copies must not produce extra deliveries
    tokio::time::sleep(Duration::from_millis(100)).await;
    for passer in &mut passers {
        assert!(passer.try_receive().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sustained_large_multicasts_from_every_node() {
    let names = ["a", "b", "c"];
    let passers = plain_cluster(&names).await;
    const PER_NODE: u64 = 300;
    let total = PER_NODE.saturating_mul(u64::try_from(names.len()).unwrap());
    let payload = "x".repeat(20_000);

    let mut senders = Vec::new();
    for passer in &passers {
        let sender = passer.sender();
        let payload = payload.clone();
        senders.push(tokio::spawn(async move {
            for _ in 0..PER_NODE {
                sender.multicast(Message::multicast("load", payload.clone())).await;
            }
        }));
    }

    let mut receivers = Vec::new();
    for mut passer in passers {
        receivers.push(tokio::spawn(async move {
            let width = passer.directory().len();
            let mut last_seen = vec![0u64; width];
            for _ in 0..total {
                let message = passer.receive().await.expect("passer closed");
                let source = passer.directory().index_of(&message.source).unwrap();
                assert_eq!(message.timestamp[source], last_seen[source].saturating_add(1));
                last_seen[source] = message.timestamp[source];
            }
            (passer.clock_snapshot().await.unwrap(), passer)
        }));
    }

    let finished = tokio::time::timeout(Duration::from_secs(60), async {
        for sender in senders {
            sender.await.unwrap();
        }
        let mut done = Vec::new();
        for receiver in receivers {
            done.push(receiver.await.unwrap());
        }
        done
    })
    .await
    .expect("multicast load did not drain on every node");

    for (snapshot, _passer) in &finished {
        assert_eq!(snapshot.clock, vec![PER_NODE; names.len()]);
        assert_eq!(snapshot.holdback, 0);
    }
}

#[tokio::test]
async fn test_reordered_multicast_is_held_until_its_cause_arrives() {
    let names = ["a", "b", "c"];
    let order = [0, 1, 2];
    let mut passers = cluster(&names, &order, Duration::ZERO, |name| {
        if name == "c" {
            FaultRules {
                receive: RuleSet::new(vec![Rule::new(RuleAction::Delay).with_kind("m1")]),
                ..FaultRules::default()
            }
        } else {
            FaultRules::default()
        }
    })
    .await;

    passers[0].multicast(Message::multicast("m1", "first")).await;
    let seen_by_b = next(&mut passers[1]).await;
    assert_eq!(seen_by_b.kind, "m1");
    assert_eq!(seen_by_b.timestamp, vec![1, 0, 0]);

    // c has parked m1 and delivered nothing
    let snapshot = wait_for(&passers[2], |s| s.delayed_inbound >= 1).await;
    assert_eq!(snapshot.clock, vec![0, 0, 0]);
    assert!(passers[2].try_receive().is_none());

    passers[1].multicast(Message::multicast("m2", "reply")).await;

    let first = next(&mut passers[2]).await;
    let second = next(&mut passers[2]).await;
    assert_eq!((first.kind.as_str(), first.timestamp.clone()), ("m1", vec![1, 0, 0]));
    assert_eq!((second.kind.as_str(), second.timestamp.clone()), ("m2", vec![1, 1, 0]));

    let snapshot = passers[2].clock_snapshot().await.unwrap();
    assert_eq!(snapshot.clock, vec![1, 1, 0]);
    assert_eq!(snapshot.holdback, 0);
}

#[tokio::test]
async fn test_unicast_numbering_and_unknown_destination() {
    let names = ["a", "b", "c"];
    let mut passers = plain_cluster(&names).await;

    for i in 0..5 {
        passers[0]
            .send(Message::new("b", "test", format!("direct {i}")))
            .await;
    }
    passers[0].send(Message::new("z", "test", "lost")).await;
    passers[0].send(Message::new("b", "test", "marker")).await;
    passers[0].send(Message::new("c", "test", "marker")).await;

    let mut seqs = Vec::new();
    for _ in 0..5 {
        let message = next(&mut passers[1]).await;
        assert_eq!(message.source, "a");
        assert_eq!(message.destination, "b");
        assert!(message.timestamp.is_empty());
        seqs.push(message.seq_num);
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(next(&mut passers[1]).await.content, "marker");

    let to_c = next(&mut passers[2]).await;
    assert_eq!(to_c.content, "marker");
    assert_eq!(to_c.seq_num, 1);
    assert!(passers[0].try_receive().is_none());
}

#[tokio::test]
async fn test_send_delay_rule_released_by_next_live_message() {
    let names = ["a", "b"];
    let order = [0, 1];
    let mut passers = cluster(&names, &order, Duration::ZERO, |name| {
        if name == "a" {
            FaultRules {
                send: RuleSet::new(vec![Rule::new(RuleAction::Delay).with_kind("slow")]),
                ..FaultRules::default()
            }
        } else {
            FaultRules::default()
        }
    })
    .await;

    passers[0].send(Message::new("b", "slow", "held back")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(passers[1].try_receive().is_none());

    passers[0].send(Message::new("b", "fast", "live")).await;
    assert_eq!(next(&mut passers[1]).await.content, "live");
    assert_eq!(next(&mut passers[1]).await.content, "held back");
}

#[tokio::test]
async fn test_send_drop_rule_on_multicast_link() {
    let names = ["a", "b", "c"];
    let order = [0, 1, 2];
    // a never writes to c directly; c still gets the multicast through b
    let mut passers = cluster(&names, &order, Duration::ZERO, |name| {
        if name == "a" {
            FaultRules {
                send: RuleSet::new(vec![Rule::new(RuleAction::Drop).with_destination("c")]),
                ..FaultRules::default()
            }
        } else {
            FaultRules::default()
        }
    })
    .await;

    passers[0].multicast(Message::multicast("test", "via relay")).await;
    for passer in &mut passers {
        let message = next(passer).await;
        assert_eq!(message.content, "via relay");
        assert_eq!(message.destination, MULTICAST_DESTINATION);
    }
}

#[tokio::test]
async fn test_shutdown_flushes_queued_multicasts() {
    let names = ["a", "b"];
    let mut passers = plain_cluster(&names).await;
    let mut b = passers.pop().unwrap();
    let mut a = passers.pop().unwrap();
    const COUNT: u64 = 100;

    let payload = "y".repeat(16_000);
    for _ in 0..COUNT {
        a.multicast(Message::multicast("last words", payload.clone())).await;
    }
    // every copy is queued on its link once the snapshot comes back
    a.clock_snapshot().await.unwrap();

    let reader = tokio::spawn(async move {
        let mut seqs = Vec::new();
        while let Ok(Some(message)) = tokio::time::timeout(WAIT, b.receive()).await {
            if message.source == "a" {
                seqs.push(message.seq_num);
            }
            if seqs.len() == usize::try_from(COUNT).unwrap() {
                break;
            }
        }
        seqs
    });
    a.shutdown().await;

    let seqs = reader.await.unwrap();
    assert_eq!(seqs, (1..=COUNT).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_shutdown_is_seen_by_peers() {
    let names = ["a", "b"];
    let mut passers = plain_cluster(&names).await;
    let mut b = passers.pop().unwrap();
    let mut a = passers.pop().unwrap();

    b.shutdown().await;
    assert!(b.receive().await.is_none());

    tokio::time::timeout(WAIT, async {
        while a.live_connections() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("a never noticed b going away");

    a.multicast(Message::multicast("test", "alone")).await;
    assert_eq!(next(&mut a).await.content, "alone");
}
