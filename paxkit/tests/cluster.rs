//! End-to-end cluster scenarios over loopback TCP.
//!
//! Three servers with real sockets, a client driving them, and misbehaving
//! round strategies injected through the configuration to exercise the
//! failure paths. The leader is deterministic: the alive peer with the
//! highest endpoint, i.e. the highest port here.

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::time::{Duration, Instant};

use futures::FutureExt;
use paxkit::strategy::{BasicPaxos, FollowerContext, Strategy, StrategyAction, StrategyFactory};
use paxkit::{
    Client, Configuration, Endpoint, Liveness, ProposalId, RoundCore, RoundStep, SendError, Server,
};
use tracing_subscriber::EnvFilter;

const HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paxkit=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn test_config() -> Configuration {
    Configuration {
        heartbeat_interval: Duration::from_millis(150),
        retry_backoff: Duration::from_millis(200),
        ..Configuration::default()
    }
}

/// Reserve `n` distinct loopback ports, lowest first.
fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind((HOST, 0)).expect("reserve port"))
        .collect();
    let mut ports: Vec<u16> = listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect();
    ports.sort_unstable();
    ports
}

/// Start one server per port; `configs` is indexed like `ports`.
async fn start_cluster<F>(ports: &[u16], configs: Vec<Configuration>, callback: F) -> Vec<Server>
where
    F: Fn(&[u8]) -> Vec<u8> + Clone + Send + Sync + 'static,
{
    let mut servers = Vec::new();
    for (port, config) in ports.iter().zip(configs) {
        let mut server =
            Server::new(HOST, *port, callback.clone(), config).expect("valid configuration");
        for peer in ports {
            server.add(HOST, *peer);
        }
        server.start().await.expect("server starts");
        servers.push(server);
    }
    servers
}

async fn connected_client(ports: &[u16], config: Configuration) -> Client {
    let mut client = Client::new(config).expect("valid configuration");
    for port in ports {
        client.add(HOST, *port);
    }
    client.start().await.expect("client starts");
    tokio::time::timeout(Duration::from_secs(10), client.wait_until_quorum_ready())
        .await
        .expect("quorum becomes ready");
    client
}

async fn send(client: &Client, workload: &str) -> Result<Vec<u8>, SendError> {
    tokio::time::timeout(Duration::from_secs(10), client.send(workload))
        .await
        .expect("send resolves")
}

// ----------------------------------------------------------------------
// Fault injection
// ----------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Fault {
    /// Close the connection on every `prepare`.
    ClosePrepare,
    /// Close the connection on the first `prepare` only.
    ClosePrepareOnce,
    /// Never answer a `prepare`.
    IgnorePrepare,
}

struct FaultyStrategy {
    fault: Fault,
    fired: bool,
    inner: BasicPaxos,
}

impl Strategy for FaultyStrategy {
    fn prepare(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        digest: u64,
    ) -> StrategyAction {
        match self.fault {
            Fault::ClosePrepare => StrategyAction::Close,
            Fault::ClosePrepareOnce if !self.fired => {
                self.fired = true;
                StrategyAction::Close
            }
            Fault::IgnorePrepare => StrategyAction::Ignore,
            Fault::ClosePrepareOnce => self.inner.prepare(follower, id, digest),
        }
    }

    fn accept(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        workload: &[u8],
    ) -> StrategyAction {
        self.inner.accept(follower, id, workload)
    }

    fn promise(&mut self, round: &mut RoundCore, from: Endpoint, granted: bool) -> RoundStep {
        self.inner.promise(round, from, granted)
    }

    fn accepted(
        &mut self,
        round: &mut RoundCore,
        from: Endpoint,
        granted: bool,
        reply: Vec<u8>,
    ) -> RoundStep {
        self.inner.accepted(round, from, granted, reply)
    }
}

#[derive(Clone, Copy, Debug)]
struct FaultFactory(Fault);

impl StrategyFactory for FaultFactory {
    fn create(&self) -> Box<dyn Strategy> {
        Box::new(FaultyStrategy {
            fault: self.0,
            fired: false,
            inner: BasicPaxos,
        })
    }
}

fn with_fault(base: &Configuration, fault: Fault) -> Configuration {
    Configuration {
        strategy_factory: std::sync::Arc::new(FaultFactory(fault)),
        ..base.clone()
    }
}

fn bar_callback() -> impl Fn(&[u8]) -> Vec<u8> + Clone + Send + Sync + 'static {
    |_workload: &[u8]| b"bar".to_vec()
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_replicates_and_replies() {
    init_tracing();
    let ports = free_ports(3);
    let config = test_config();
    let _servers = start_cluster(&ports, vec![config.clone(); 3], bar_callback()).await;

    let client = connected_client(&ports, config).await;
    assert_eq!(send(&client, "foo").await, Ok(b"bar".to_vec()));
    assert_eq!(send(&client, "foo").await, Ok(b"bar".to_vec()));
}

#[tokio::test]
async fn follower_dropping_mid_prepare_does_not_block_the_round() {
    init_tracing();
    let ports = free_ports(3);
    // A slower heartbeat keeps the dead mark observable after the round.
    let config = Configuration {
        heartbeat_interval: Duration::from_millis(500),
        retry_backoff: Duration::from_millis(200),
        ..Configuration::default()
    };
    // The bad apple is the lowest port: a follower, never the leader.
    let configs = vec![
        with_fault(&config, Fault::ClosePrepare),
        config.clone(),
        config.clone(),
    ];
    let servers = start_cluster(&ports, configs, bar_callback()).await;

    let client = connected_client(&ports, config).await;

    let bad_apple = Endpoint::new(HOST, ports[0]);
    let mut observed_dead = false;
    for _ in 0..10 {
        // The majority formed by the other two still completes the round.
        assert_eq!(send(&client, "foo").await, Ok(b"bar".to_vec()));

        // The leader observed the closed connection and marked the
        // follower dead.
        let status = servers[2].status().await.expect("leader status");
        if status
            .peers
            .iter()
            .any(|(peer, liveness)| *peer == bad_apple && *liveness == Liveness::Dead)
        {
            observed_dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(observed_dead, "bad follower was never marked dead");
}

#[tokio::test]
async fn leader_dropping_mid_prepare_fails_until_it_is_stopped() {
    init_tracing();
    let ports = free_ports(3);
    let config = test_config();
    // The bad apple is the highest port: the deterministic leader.
    let configs = vec![
        config.clone(),
        config.clone(),
        with_fault(&config, Fault::ClosePrepare),
    ];
    let mut servers = start_cluster(&ports, configs, bar_callback()).await;

    let client = connected_client(&ports, config).await;

    // The leader kills its own loopback connection on prepare; the round
    // dies with its leadership, and recovery re-elects the same bad apple.
    assert_eq!(send(&client, "foo").await, Err(SendError::RequestError));
    assert_eq!(send(&client, "foo").await, Err(SendError::RequestError));

    // Stopping the misbehaving leader makes the client lose it for real.
    servers[2].stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_not_ready = false;
    while Instant::now() < deadline {
        match send(&client, "foo").await {
            Err(SendError::NotReady) => {
                saw_not_ready = true;
                break;
            }
            Err(SendError::RequestError) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(reply) => panic!("send succeeded before readiness was lost: {reply:?}"),
        }
    }
    assert!(saw_not_ready, "client never reported not_ready");

    // The surviving pair elects a new leader; everything works again.
    tokio::time::timeout(Duration::from_secs(10), client.wait_until_quorum_ready())
        .await
        .expect("quorum recovers");
    assert_eq!(send(&client, "foo").await, Ok(b"bar".to_vec()));
}

#[tokio::test]
async fn transient_leader_error_recovers_after_backoff() {
    init_tracing();
    let ports = free_ports(3);
    let config = Configuration {
        heartbeat_interval: Duration::from_millis(100),
        retry_backoff: Duration::from_millis(400),
        ..Configuration::default()
    };
    let configs = vec![
        config.clone(),
        config.clone(),
        with_fault(&config, Fault::ClosePrepareOnce),
    ];
    let _servers = start_cluster(&ports, configs, bar_callback()).await;

    let client = connected_client(&ports, config).await;

    let started = Instant::now();
    let reply = tokio::time::timeout(
        Duration::from_secs(10),
        client.send_with_retries("foo", 3),
    )
    .await
    .expect("send resolves");
    assert_eq!(reply, Ok(b"bar".to_vec()));
    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "recovery cannot be faster than one backoff, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn requests_complete_in_submission_order() {
    init_tracing();
    let ports = free_ports(3);
    let config = test_config();
    let reverse = |workload: &[u8]| {
        let mut reply = workload.to_vec();
        reply.reverse();
        reply
    };
    let _servers = start_cluster(&ports, vec![config.clone(); 3], reverse).await;

    let client = connected_client(&ports, config).await;

    let first = client.send("first");
    let second = client.send("second");

    let second_reply = tokio::time::timeout(Duration::from_secs(10), second)
        .await
        .expect("second resolves");
    assert_eq!(second_reply, Ok(b"dnoces".to_vec()));

    // The queue admits one request at a time, so by the time the second
    // completed the first must already have its reply.
    let first_reply = first
        .now_or_never()
        .expect("first completed before second");
    assert_eq!(first_reply, Ok(b"tsrif".to_vec()));
}

#[tokio::test]
async fn stopping_the_client_drains_in_flight_requests() {
    init_tracing();
    let ports = free_ports(3);
    let config = test_config();
    // Every server stays silent on prepare: rounds stall and nothing can
    // complete before the deadlines.
    let configs = vec![with_fault(&config, Fault::IgnorePrepare); 3];
    let _servers = start_cluster(&ports, configs, bar_callback()).await;

    let mut client = connected_client(&ports, config).await;

    let first = client.send("foo");
    let second = client.send("foo");
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop();

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("drained first resolves");
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("drained second resolves");
    assert_eq!(first, Err(SendError::RequestError));
    assert_eq!(second, Err(SendError::RequestError));
}

#[tokio::test]
async fn quorum_boundary_one_loss_survives_two_do_not() {
    init_tracing();
    let ports = free_ports(3);
    let config = test_config();
    let mut servers = start_cluster(&ports, vec![config.clone(); 3], bar_callback()).await;

    let client = connected_client(&ports, config).await;
    assert_eq!(send(&client, "foo").await, Ok(b"bar".to_vec()));

    // A strict majority of two remains: rounds still complete.
    servers[0].stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match send(&client, "foo").await {
            Ok(reply) => {
                assert_eq!(reply, b"bar".to_vec());
                break;
            }
            // A round racing the loss may fail once; the next one lands.
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("cluster of two never recovered: {e}"),
        }
    }

    // One below a strict majority: requests stop producing replies.
    servers[1].stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match send(&client, "foo").await {
            Err(SendError::NotReady | SendError::RequestError) => break,
            Ok(_) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(reply) => panic!("minority cluster still replied: {reply:?}"),
        }
    }
}
