#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use oathlink_gateway::BoxFuture;
use oathlink_gateway::cache::{CacheStorage, MemoryCacheStorage};
use oathlink_gateway::config::GatewayConfig;
use oathlink_gateway::gateway::OfflineGateway;
use oathlink_gateway::http::{Request, Response, StatusCode};
use oathlink_gateway::network::{Network, NetworkError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// In-process origin: canned responses by request target, an on/off switch,
/// and a log of every request that reached it.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    seen: Mutex<Vec<Request>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network that serves every default asset with a body naming it.
    pub fn serving_assets(config: &GatewayConfig) -> Arc<Self> {
        let network = Self::new();
        for url in config.asset_urls() {
            network.route(
                &url,
                Response::new(StatusCode::Ok)
                    .header("Content-Type", "text/plain")
                    .body(format!("asset {url}")),
            );
        }
        network
    }

    pub fn route(&self, target: &str, response: Response) {
        self.routes
            .lock()
            .unwrap()
            .insert(target.to_owned(), response);
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn forget(&self) {
        self.seen.lock().unwrap().clear();
    }
}

impl Network for ScriptedNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(request.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Unavailable);
            }
            let routes = self.routes.lock().unwrap();
            Ok(routes
                .get(request.target())
                .cloned()
                .unwrap_or_else(|| Response::new(StatusCode::NotFound).body("no such route")))
        })
    }
}

pub struct Fixture {
    pub config: GatewayConfig,
    pub storage: Arc<MemoryCacheStorage>,
    pub network: Arc<ScriptedNetwork>,
    pub gateway: Arc<OfflineGateway>,
}

pub fn fixture() -> Fixture {
    fixture_with(GatewayConfig::default())
}

pub fn fixture_with(config: GatewayConfig) -> Fixture {
    let storage = Arc::new(MemoryCacheStorage::new());
    let network = ScriptedNetwork::serving_assets(&config);
    let gateway = Arc::new(OfflineGateway::new(
        config.clone(),
        Arc::clone(&storage) as Arc<dyn CacheStorage>,
        Arc::clone(&network) as Arc<dyn Network>,
    ));
    Fixture {
        config,
        storage,
        network,
        gateway,
    }
}

/// A TCP origin that answers every connection with `reply`, written as-is
/// once the request head has arrived. Returns its address.
pub async fn spawn_raw_origin(reply: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(reply.as_bytes()).await;
            });
        }
    });
    addr
}
