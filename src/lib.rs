//! `electrum-netcore`: the network core of a lightweight Bitcoin wallet
//! client — a pool of concurrent connections to remote header/transaction
//! indexing servers, one designated primary, each driven through a header
//! sync state machine that proves a checkpoint before its headers are
//! trusted.
//!
//! [`NetworkCore`] is the facade a wallet embeds: it owns nothing directly,
//! instead handing off to a [`supervisor::NetworkSupervisor`] task and
//! exposing `send`/`synchronous_get` through a [`router::Router`], events
//! through an [`events::EventBus`], and read-only state through a
//! `watch`-channel [`supervisor::Snapshot`].

pub mod blockchain;
pub mod checkpoint;
pub mod checkpoints;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod hostmap;
pub mod interface;
pub mod network_parse;
pub mod proxy;
pub mod router;
pub mod sanitize;
pub mod server_key;
pub mod supervisor;
pub mod sync;
pub mod wire;

pub use crate::error::Error;

use crate::events::Event;
use crate::hostmap::HostMap;
use crate::network_parse::NetworkParse;
use crate::proxy::ProxyConfig;
use crate::router::Router;
use crate::server_key::ServerKey;
use crate::supervisor::{Command, NetworkSupervisor, Snapshot};
use bitcoin::{Network, Txid};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// CLI/config surface, mirroring the persisted config keys as flags with
/// `env` fallbacks.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    /// Directory holding `config.json`, `recent-servers`, `certs/`, and the
    /// dense header files. Defaults to `~/.electrum-netcore`.
    #[arg(long, env)]
    pub data_dir: Option<PathBuf>,

    /// Which Bitcoin network to join: bitcoin, testnet, signet, or regtest.
    #[arg(long, env, default_value = "bitcoin")]
    pub network: NetworkParse,

    /// Pin to a single `host:port:protocol` server instead of pooling.
    #[arg(long, env)]
    pub server: Option<String>,

    /// Outbound proxy as `mode:host[:port[:user[:password]]]`, or "none".
    #[arg(long, env)]
    pub proxy: Option<String>,

    /// Automatically pick a primary/replace a lagging one when no server is
    /// pinned.
    #[arg(long, env, default_value_t = true)]
    pub auto_connect: bool,

    /// Connect to exactly one server instead of maintaining a pool.
    #[arg(long, env, default_value_t = false)]
    pub oneserver: bool,

    /// Target number of simultaneously connected interfaces (ignored when
    /// `--oneserver` is set).
    #[arg(long, env, default_value_t = supervisor::DEFAULT_POOL_SIZE)]
    pub pool_size: usize,
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".electrum-netcore")
}

/// The embeddable handle to a running network core: spawns the supervisor
/// task and exposes its router/events/snapshot surface to callers.
pub struct NetworkCore {
    command_tx: mpsc::Sender<Command>,
    router: Arc<Router>,
    events: Arc<events::EventBus>,
    snapshot_rx: watch::Receiver<Snapshot>,
}

impl NetworkCore {
    /// Builds a [`NetworkSupervisor`] for `network` rooted at `data_dir`,
    /// applies `args`' pool-size/oneserver/server/proxy/auto_connect
    /// overrides, and spawns its main loop as a background task.
    pub fn spawn(data_dir: PathBuf, network: Network, args: &Arguments) -> Result<(Self, JoinHandle<()>), Error> {
        let (mut supervisor, snapshot_rx) = NetworkSupervisor::new(data_dir, network)?;
        supervisor.set_pool_size(args.pool_size);
        if args.oneserver {
            supervisor.config.set_oneserver(true)?;
        }
        if let Some(server) = &args.server {
            supervisor.config.set_server(Some(ServerKey::from_str(server)?))?;
        }
        if let Some(proxy) = &args.proxy {
            let proxy = crate::proxy::deserialize_proxy(proxy)?;
            supervisor.config.set_proxy(proxy.as_ref())?;
        }
        supervisor.config.set_auto_connect(args.auto_connect)?;

        let router = supervisor.router.clone();
        let events = supervisor.events.clone();
        let (command_tx, command_rx) = mpsc::channel(8);
        let handle = tokio::spawn(supervisor.run(command_rx));
        Ok((NetworkCore { command_tx, router, events, snapshot_rx }, handle))
    }

    /// Subscribes to the typed event stream (`status`, `updated`, `banner`,
    /// `fee`, `servers`, `interfaces`).
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The known-servers registry as of the last published [`Snapshot`].
    pub fn get_servers(&self) -> HostMap {
        self.snapshot_rx.borrow().known_servers.clone()
    }

    /// Currently connected interfaces' server keys.
    pub fn get_interfaces(&self) -> Vec<ServerKey> {
        self.snapshot_rx.borrow().interfaces.clone()
    }

    /// The current primary, if any.
    pub fn primary(&self) -> Option<ServerKey> {
        self.snapshot_rx.borrow().primary.clone()
    }

    /// Whether the checkpoint proof has been established.
    pub fn checkpoint_verified(&self) -> bool {
        self.snapshot_rx.borrow().checkpoint_verified
    }

    /// Height of the locally stored canonical chain.
    pub fn local_height(&self) -> u64 {
        self.snapshot_rx.borrow().local_height
    }

    /// Queues `(method, params)` against the primary interface (or answers
    /// from the subscription cache); see [`Router::send`].
    pub async fn send(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        subscribe: bool,
    ) -> mpsc::UnboundedReceiver<Result<Value, Error>> {
        self.router.send(method, params, subscribe).await
    }

    /// Blocking-style request/response; see [`Router::synchronous_get`].
    pub async fn synchronous_get(&self, method: impl Into<String>, params: Vec<Value>) -> Result<Value, Error> {
        self.router.synchronous_get(method, params).await
    }

    /// Broadcasts a raw transaction, sanitizing the rejection reason on
    /// failure rather than surfacing the server's raw error string.
    pub async fn broadcast_transaction(&self, raw_hex: &str) -> Result<Txid, Error> {
        match self
            .router
            .synchronous_get("blockchain.transaction.broadcast", vec![Value::String(raw_hex.to_string())])
            .await
        {
            Ok(result) => {
                let txid_hex = result.as_str().ok_or_else(|| Error::Rpc(result.clone()))?;
                Txid::from_str(txid_hex).map_err(|_| Error::Rpc(result))
            }
            Err(Error::Rpc(err)) => {
                let raw = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| err.to_string());
                Err(Error::BroadcastRejected(crate::sanitize::sanitize_broadcast_error(&raw)))
            }
            Err(other) => Err(other),
        }
    }

    /// Fetches the merkle proof for a confirmed transaction at `height`.
    pub async fn get_merkle(&self, txid: &Txid, height: u64) -> Result<Value, Error> {
        self.router
            .synchronous_get("blockchain.transaction.get_merkle", vec![Value::String(txid.to_string()), Value::from(height)])
            .await
    }

    /// Persists the new server/proxy/auto_connect, tearing the pool down and
    /// reconnecting if the transport changed.
    pub async fn set_parameters(&self, server: Option<ServerKey>, proxy: Option<ProxyConfig>, auto_connect: bool) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::SetParameters { server, proxy, auto_connect, reply })
            .await
            .map_err(|_| Error::NoPrimary)?;
        rx.await.map_err(|_| Error::NoPrimary)?
    }

    /// Switches the wallet's view to the fork rooted at `base_height`.
    pub async fn follow_chain(&self, base_height: u64) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::FollowChain { base_height, reply })
            .await
            .map_err(|_| Error::NoPrimary)?;
        rx.await.map_err(|_| Error::NoPrimary)?
    }

    /// Gracefully stops the supervisor loop: it closes every interface,
    /// drains the connect queue, and returns.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.command_tx.send(Command::Shutdown).await.map_err(|_| Error::NoPrimary)
    }
}

/// Entry point shared by `main.rs`: resolves the data directory, spawns the
/// core, and logs published events until interrupted.
pub async fn inner_main(args: Arguments) -> Result<(), Error> {
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
    let network: Network = args.network.clone().into();
    log::info!("starting electrum-netcore on {network:?} at {}", data_dir.display());

    let (core, handle) = NetworkCore::spawn(data_dir, network, &args)?;
    let mut events = core.subscribe_events();

    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log::info!("event: {event:?}"),
                Err(broadcast::error::RecvError::Lagged(n)) => log::warn!("dropped {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await.map_err(Error::Io)?;
    log::info!("shutting down");
    core.shutdown().await?;
    let _ = handle.await;
    log_events.abort();
    Ok(())
}
