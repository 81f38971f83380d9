//! End-to-end tests: agents discover each other over gossip, replicate
//! through Raft on the shared listener, and serve clients that route by
//! role.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use strand_client::{Client, ClientConfig};
use strand_server::{Agent, AgentConfig};

fn agent_config(tmp: &TempDir, index: usize, acl: Option<&PathBuf>) -> AgentConfig {
    let mut config = AgentConfig::new(tmp.path().join(format!("node-{index}")))
        .with_node_name(format!("{index}"))
        .with_bind_addr("127.0.0.1:0")
        .with_rpc_port(0)
        .with_bootstrap(index == 0);

    config.raft.tick_interval_ms = 10;
    config.raft.min_election_ticks = 10;
    config.raft.max_election_ticks = 20;
    config.raft.heartbeat_ticks = 2;

    if let Some(acl) = acl {
        config.acl_policy_file = Some(acl.clone());
    }
    config
}

async fn start_cluster(tmp: &TempDir, count: usize, acl: Option<&PathBuf>) -> Vec<Agent> {
    let mut agents: Vec<Agent> = Vec::new();

    for index in 0..count {
        let mut config = agent_config(tmp, index, acl);
        if index > 0 {
            config.start_join_addrs = vec![agents[0].gossip_addr().unwrap().to_string()];
        }

        let agent = Agent::new(config).await.unwrap();
        if index == 0 {
            agent
                .distributed()
                .wait_for_leader(Duration::from_secs(10))
                .await
                .unwrap();
        }
        agents.push(agent);
    }

    // Wait for the leader's configuration to cover every member.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let servers = agents[0].distributed().get_servers().await.unwrap();
        if servers.len() == count {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster never converged: {servers:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    agents
}

async fn wait_for_record(agent: &Agent, offset: u64) -> Bytes {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(record) = agent.distributed().read(offset) {
            return record.value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never replicated offset {offset}",
            agent.name()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn shutdown_all(agents: Vec<Agent>) {
    for agent in &agents {
        agent.shutdown().await;
    }
}

#[tokio::test]
async fn test_replication_across_three_nodes() {
    let tmp = TempDir::new().unwrap();
    let agents = start_cluster(&tmp, 3, None).await;

    let client = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default(),
    )
    .await
    .unwrap();

    let first = client.produce(Bytes::from_static(b"first")).await.unwrap();
    let second = client.produce(Bytes::from_static(b"second")).await.unwrap();
    assert_eq!((first, second), (0, 1));

    for agent in &agents {
        assert_eq!(wait_for_record(agent, 0).await.as_ref(), b"first");
        assert_eq!(wait_for_record(agent, 1).await.as_ref(), b"second");
    }

    // One leader, two followers, visible to clients.
    let servers = client.get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    // Reads work through the role-routing client too.
    let record = client.consume(0).await.unwrap();
    assert_eq!(record.value.as_ref(), b"first");
    assert_eq!(record.offset, 0);

    shutdown_all(agents).await;
}

#[tokio::test]
async fn test_consume_past_end_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let agents = start_cluster(&tmp, 1, None).await;

    let client = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default(),
    )
    .await
    .unwrap();

    client.produce(Bytes::from_static(b"only")).await.unwrap();

    let err = client.consume(1).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    shutdown_all(agents).await;
}

#[tokio::test]
async fn test_streams_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let agents = start_cluster(&tmp, 3, None).await;

    let client = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default(),
    )
    .await
    .unwrap();

    let offsets = client
        .produce_stream(vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")])
        .await
        .unwrap();
    assert_eq!(offsets, vec![0, 1]);

    // Streaming consume starts at 0, follows the log in order, and picks
    // up the record produced after the stream opened.
    for agent in &agents {
        wait_for_record(agent, 1).await;
    }

    let mut stream = client.consume_stream(0).await.unwrap();
    let one = stream.next().await.unwrap();
    let two = stream.next().await.unwrap();
    assert_eq!(one.value.as_ref(), b"first");
    assert_eq!(one.offset, 0);
    assert_eq!(two.value.as_ref(), b"second");
    assert_eq!(two.offset, 1);

    let third = client.produce(Bytes::from_static(b"third")).await.unwrap();
    let pushed = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream never delivered the new record")
        .unwrap();
    assert_eq!(pushed.offset, third);
    assert_eq!(pushed.value.as_ref(), b"third");

    shutdown_all(agents).await;
}

#[tokio::test]
async fn test_member_leave_keeps_cluster_writable() {
    let tmp = TempDir::new().unwrap();
    let agents = start_cluster(&tmp, 3, None).await;

    let client = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default(),
    )
    .await
    .unwrap();

    client.produce(Bytes::from_static(b"before")).await.unwrap();
    for agent in &agents {
        wait_for_record(agent, 0).await;
    }

    // Node 1 leaves; its gossip goodbye makes the leader drop it from the
    // configuration.
    agents[1].shutdown().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let servers = agents[0].distributed().get_servers().await.unwrap();
        if servers.len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "leader never dropped the departed member: {servers:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Writes still commit with the remaining quorum and reach the
    // surviving follower, not the departed node.
    let offset = client.produce(Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(wait_for_record(&agents[2], offset).await.as_ref(), b"after");

    shutdown_all(agents).await;
}

#[tokio::test]
async fn test_acl_denies_unauthorized_identity() {
    let tmp = TempDir::new().unwrap();

    let mut policy = tempfile::NamedTempFile::new().unwrap();
    writeln!(policy, "p, root, *, produce").unwrap();
    writeln!(policy, "p, root, *, consume").unwrap();
    let policy_path = policy.path().to_path_buf();

    let agents = start_cluster(&tmp, 1, Some(&policy_path)).await;

    let nobody = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default().with_identity("nobody"),
    )
    .await
    .unwrap();

    let err = nobody.produce(Bytes::from_static(b"x")).await.unwrap_err();
    assert_eq!(err.code(), Some(strand_client::Code::PermissionDenied));
    assert_eq!(
        err.to_string(),
        "server error (PERMISSION_DENIED): nobody not permitted to produce to *"
    );

    let err = nobody.consume(0).await.unwrap_err();
    assert_eq!(err.code(), Some(strand_client::Code::PermissionDenied));

    // The authorized identity is unaffected.
    let root = Client::new(
        vec![agents[0].rpc_addr().to_string()],
        ClientConfig::default(),
    )
    .await
    .unwrap();
    let offset = root.produce(Bytes::from_static(b"allowed")).await.unwrap();
    assert_eq!(offset, 0);
    assert_eq!(root.consume(0).await.unwrap().value.as_ref(), b"allowed");

    shutdown_all(agents).await;
}
