//! Connection pool keyed by reuse key.
//!
//! All mutations of the key → group map go through one worker task that
//! consumes a request channel, so the map itself needs no lock. Callers talk
//! to the worker with small request messages carrying a oneshot reply, and
//! never wait longer than the time to process the queue ahead of them.
//!
//! Dialing never happens here. A caller that gets a pool miss dials in its
//! own task and hands the finished client back with [`ConnectionPool::store`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::config;
use crate::error::BrokerError;
use crate::transport::TransportClient;

mod group;

use group::ClientGroup;

/// Separator for the composite reuse key. Not expected to occur inside any
/// of the identity fields.
const REUSE_KEY_DELIMITER: &str = "|";

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Build the opaque reuse key under which connections are shared.
pub fn reuse_key(end_user: &str, target: &str, account: &str, username: &str) -> String {
    [end_user, target, account, username].join(REUSE_KEY_DELIMITER)
}

enum PoolRequest {
    Fetch {
        key: String,
        reply: oneshot::Sender<Option<Arc<TransportClient>>>,
    },
    Store {
        key: String,
        client: Arc<TransportClient>,
        reply: oneshot::Sender<()>,
    },
    Release {
        key: String,
        client: Arc<TransportClient>,
        reply: oneshot::Sender<()>,
    },
}

/// Process-wide pool. First touch must happen inside a Tokio runtime, since
/// the worker task is spawned lazily.
pub static POOL: Lazy<ConnectionPool> =
    Lazy::new(|| ConnectionPool::start(config::POOL_SWEEP_INTERVAL));

/// Handle to the pool worker. Cheap to clone; all clones feed the same map.
#[derive(Clone)]
pub struct ConnectionPool {
    tx: mpsc::Sender<PoolRequest>,
}

impl ConnectionPool {
    /// Spawn a worker with its own map. The sweep interval is a parameter so
    /// tests can run the eviction path without waiting out the default tick.
    pub fn start(sweep_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        tokio::spawn(run_worker(rx, sweep_interval));
        Self { tx }
    }

    /// Least-loaded pooled client for `key`, or `None` on a miss.
    pub async fn fetch(&self, key: &str) -> Result<Option<Arc<TransportClient>>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Fetch {
                key: key.to_string(),
                reply,
            })
            .await?;
        rx.await
            .map_err(|_| BrokerError::SendDataError("pool worker dropped the reply".to_string()))
    }

    /// Register a freshly dialed client under `key`. The pool takes a self
    /// hold on the client so it survives until the matching release even if
    /// no session opens right away.
    pub async fn store(&self, key: &str, client: Arc<TransportClient>) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Store {
                key: key.to_string(),
                client,
                reply,
            })
            .await?;
        rx.await
            .map_err(|_| BrokerError::SendDataError("pool worker dropped the reply".to_string()))
    }

    /// Give back the pool's hold on `client` and recycle its group at once.
    pub async fn release(&self, key: &str, client: Arc<TransportClient>) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Release {
                key: key.to_string(),
                client,
                reply,
            })
            .await?;
        rx.await
            .map_err(|_| BrokerError::SendDataError("pool worker dropped the reply".to_string()))
    }
}

async fn run_worker(mut rx: mpsc::Receiver<PoolRequest>, sweep_interval: Duration) {
    let mut groups: HashMap<String, ClientGroup> = HashMap::new();
    let mut ticker = time::interval_at(time::Instant::now() + sweep_interval, sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Set by every request, cleared on a tick. The sweep only runs on a tick
    // that follows a fully quiet interval.
    let mut active = false;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => {
                    active = true;
                    handle_request(&mut groups, request);
                }
                None => break,
            },
            _ = ticker.tick() => {
                if active {
                    active = false;
                    continue;
                }
                sweep(&mut groups);
            }
        }
    }
}

fn handle_request(groups: &mut HashMap<String, ClientGroup>, request: PoolRequest) {
    match request {
        PoolRequest::Fetch { key, reply } => {
            let found = groups.get_mut(&key).and_then(ClientGroup::fetch);
            let _ = reply.send(found);
        }
        PoolRequest::Store { key, client, reply } => {
            client.acquire_self();
            debug!("pool stores {} under {}", client.identity(), key);
            groups.entry(key).or_default().insert(client);
            let _ = reply.send(());
        }
        PoolRequest::Release { key, client, reply } => {
            client.release_self();
            match groups.get_mut(&key) {
                Some(group) => {
                    close_all(group.recycle());
                    if group.is_empty() {
                        groups.remove(&key);
                    }
                }
                None => {
                    // Group already evicted. Close the stray client instead
                    // of letting the connection leak.
                    info!(
                        "release for unknown group {}; closing {}",
                        key,
                        client.identity()
                    );
                    close_all(vec![client]);
                }
            }
            let _ = reply.send(());
        }
    }
}

fn sweep(groups: &mut HashMap<String, ClientGroup>) {
    let before = groups.len();
    groups.retain(|_, group| {
        close_all(group.recycle());
        !group.is_empty()
    });
    if groups.len() != before {
        let members: usize = groups.values().map(ClientGroup::len).sum();
        debug!(
            "sweep removed {} empty group(s); {} pooled member(s) remain",
            before - groups.len(),
            members
        );
    }
}

/// The worker itself never awaits a disconnect; closes run in their own
/// tasks so a slow peer cannot stall the request queue.
fn close_all(clients: Vec<Arc<TransportClient>>) {
    for client in clients {
        debug!("pool recycles {}", client.identity());
        tokio::spawn(async move { client.close().await });
    }
}
