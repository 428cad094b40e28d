//! End-to-end tests for the client coordinator.
//!
//! Ten servers, one hundred parameters `p_0..p_99` with `(i + 1) * 100`
//! bytes each, one elected initializer and one follower.

use async_trait::async_trait;
use pserver::client::Client;
use pserver::config::{ClientConfig, ServerConfig};
use pserver::core::{
    ElementType, Error, Gradient, Parameter, ParameterWithConfig, Result, Server,
};
use pserver::discovery::{
    publish_desired, register_server, DiscoveryRegistry, DiscoverySelector, FixedSelector,
    KvStore, MemoryStore, ServerRegistry, StaticRegistry,
};
use pserver::rpc::{Connector, LocalConnector, PserverRpc, TcpConnector};
use pserver::server::{OptimizerConfig, ParameterServer};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const NUM_SERVERS: usize = 10;
const NUM_PARAMS: usize = 100;

fn names() -> Vec<String> {
    (0..NUM_PARAMS).map(|i| format!("p_{}", i)).collect()
}

async fn init_all(client: &Client) {
    for i in 0..NUM_PARAMS {
        let param = Parameter::new(
            &format!("p_{}", i),
            ElementType::Float32,
            vec![0u8; (i + 1) * 100],
        );
        client
            .init_param(ParameterWithConfig::new(param))
            .await
            .unwrap();
    }
    client.finish_init_params().await.unwrap();
}

async fn check_all(client: &Client) {
    let names = names();
    let params = client.get_params(&names).await.unwrap();
    assert_eq!(params.len(), names.len());
    for (i, (param, name)) in params.iter().zip(names.iter()).enumerate() {
        assert_eq!(&param.name, name);
        assert_eq!(param.content.len(), (i + 1) * 100);
    }
}

/// Runs the init / push / pull cycle the way a trainer would.
async fn run_scenario(elected: &Client, follower: &Client) {
    assert!(elected.begin_init_params().await.unwrap());
    assert!(!follower.begin_init_params().await.unwrap());

    init_all(elected).await;
    assert_ok!(follower.wait_ready().await);

    let grads: Vec<Gradient> = (0..NUM_PARAMS / 2)
        .map(|i| {
            Gradient::new(
                &format!("p_{}", i),
                ElementType::Float32,
                vec![0u8; (i + 1) * 100],
            )
        })
        .collect();
    assert_ok!(elected.send_grads(grads).await);

    check_all(follower).await;
    check_all(elected).await;

    let result = follower
        .get_params(&["p_3".to_string(), "never_initialized".to_string()])
        .await;
    assert!(matches!(result, Err(Error::UnknownParameter(name)) if name == "never_initialized"));
}

fn client(
    registry: Arc<dyn ServerRegistry>,
    selected: bool,
    connector: Arc<dyn Connector>,
) -> Client {
    Client::new(
        registry,
        NUM_SERVERS,
        Arc::new(FixedSelector::new(selected)),
        connector,
    )
}

#[tokio::test]
async fn local_fleet_scenario() {
    let connector = Arc::new(LocalConnector::new());
    let mut addrs = Vec::new();
    for i in 0..NUM_SERVERS {
        let addr = format!("local:{}", i);
        connector
            .register(&addr, Arc::new(ParameterServer::default()))
            .await;
        addrs.push(addr);
    }
    let registry: Arc<dyn ServerRegistry> = Arc::new(StaticRegistry::from_addrs(&addrs));

    let elected = client(registry.clone(), true, connector.clone());
    let follower = client(registry, false, connector);
    run_scenario(&elected, &follower).await;
}

#[tokio::test]
async fn tcp_fleet_scenario() {
    let mut addrs = Vec::new();
    for _ in 0..NUM_SERVERS {
        let server = Arc::new(ParameterServer::new(ServerConfig::default()));
        let (addr, _handle) = pserver::rpc::tcp::spawn(server).await.unwrap();
        addrs.push(addr.to_string());
    }
    let registry: Arc<dyn ServerRegistry> = Arc::new(StaticRegistry::from_addrs(&addrs));

    // Small threshold so that larger parameters travel compressed.
    let config = ClientConfig {
        compression_threshold: 1024,
        ..Default::default()
    };
    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config));

    let elected = client(registry.clone(), true, connector.clone());
    let follower = client(registry, false, connector);
    run_scenario(&elected, &follower).await;
}

#[tokio::test]
async fn discovery_fleet_scenario() {
    let store = Arc::new(MemoryStore::new());
    publish_desired(store.as_ref(), NUM_SERVERS).await.unwrap();

    for _ in 0..NUM_SERVERS {
        let server = Arc::new(ParameterServer::default());
        let (addr, _handle) = pserver::rpc::tcp::spawn(server).await.unwrap();
        register_server(store.as_ref(), &addr.to_string())
            .await
            .unwrap();
    }

    let kv: Arc<dyn KvStore> = store.clone();
    let registry = Arc::new(DiscoveryRegistry::new(kv.clone(), Duration::from_secs(5)));
    let desired = registry.desired().await.unwrap();
    assert_eq!(desired, NUM_SERVERS);

    let clients: Vec<Client> = (0..2)
        .map(|_| {
            Client::new(
                registry.clone(),
                desired,
                Arc::new(DiscoverySelector::new(kv.clone())),
                Arc::new(TcpConnector::default()),
            )
        })
        .collect();

    let mut elected = Vec::new();
    for c in &clients {
        elected.push(c.begin_init_params().await.unwrap());
    }
    assert_eq!(elected.iter().filter(|e| **e).count(), 1);

    let (winner, follower) = if elected[0] {
        (&clients[0], &clients[1])
    } else {
        (&clients[1], &clients[0])
    };
    init_all(winner).await;
    follower.wait_ready().await.unwrap();
    check_all(follower).await;
}

#[tokio::test]
async fn discovery_unavailable_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    publish_desired(store.as_ref(), 2).await.unwrap();
    store.set_available(false);

    let registry = Arc::new(DiscoveryRegistry::new(store.clone(), Duration::from_millis(100)));
    let c = Client::new(
        registry,
        2,
        Arc::new(DiscoverySelector::new(store)),
        Arc::new(LocalConnector::new()),
    );

    let err = assert_err!(c.begin_init_params().await);
    assert!(matches!(err, Error::DiscoveryUnavailable(_)));
    assert!(matches!(
        c.finish_init_params().await,
        Err(Error::DiscoveryUnavailable(_))
    ));
}

/// Shard that accepts initialization but fails every read and push.
struct RejectingRpc {
    index: usize,
}

#[async_trait]
impl PserverRpc for RejectingRpc {
    async fn init_param(&self, _param: ParameterWithConfig) -> Result<()> {
        Ok(())
    }

    async fn finish_init_params(&self) -> Result<()> {
        Ok(())
    }

    async fn send_grads(&self, _grads: Vec<Gradient>) -> Result<()> {
        Err(Error::shard_rpc(self.index, "rejected"))
    }

    async fn get_params(&self, _names: Vec<String>) -> Result<Vec<Parameter>> {
        Err(Error::shard_rpc(self.index, "rejected"))
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Shard 0 over TCP, every other shard rejecting.
struct SplitConnector {
    tcp: TcpConnector,
}

#[async_trait]
impl Connector for SplitConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn PserverRpc>> {
        if server.index == 0 {
            self.tcp.connect(server).await
        } else {
            Ok(Arc::new(RejectingRpc {
                index: server.index,
            }))
        }
    }
}

#[tokio::test]
async fn failed_fan_out_leaves_tcp_shard_consistent() {
    let server = Arc::new(ParameterServer::default());
    let (addr, _handle) = assert_ok!(pserver::rpc::tcp::spawn(server.clone()).await);
    let registry = Arc::new(StaticRegistry::from_addrs(&[
        addr.to_string(),
        "rejecting:1".to_string(),
    ]));
    let c = Client::new(
        registry,
        2,
        Arc::new(FixedSelector::new(true)),
        Arc::new(SplitConnector {
            tcp: TcpConnector::default(),
        }),
    );

    // "a" lives on shard 0, "y" on shard 1.
    let sgd = OptimizerConfig {
        learning_rate: 1.0,
        ..Default::default()
    };
    let a = Parameter::new("a", ElementType::Float32, 1.0f32.to_le_bytes().to_vec());
    assert_ok!(
        c.init_param(ParameterWithConfig::new(a).with_config(sgd.to_blob().unwrap()))
            .await
    );
    assert_ok!(c.finish_init_params().await);

    // Shard 1 fails while the read on shard 0 is still in flight.
    let result = c.get_params(&["a".to_string(), "y".to_string()]).await;
    assert!(matches!(result, Err(Error::ShardRpc { index: 1, .. })));

    let grad = Gradient::new("a", ElementType::Float32, 1.0f32.to_le_bytes().to_vec());
    assert_ok!(server.send_grad(&grad).await);

    let params = assert_ok!(c.get_params(&["a".to_string()]).await);
    assert_eq!(params[0].content, 0.0f32.to_le_bytes().to_vec());
}
