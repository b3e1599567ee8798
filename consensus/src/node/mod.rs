//! Replica node
//!
//! Wraps a `ConsensusEngine` in a tokio task. Inputs arrive through a
//! cloneable `NodeHandle`, a periodic tick drives the pacemaker, and the
//! engine's effects leave through the `Outbound` channels:
//! - `messages`: batches of protocol messages to hand to the transport
//! - `blocks`: newly committed headers, oldest first
//! - `ready`: views this replica leads and needs a payload for

pub mod config;

pub use config::{ConfigError, NodeConfig, DEFAULT_CHANNEL_CAPACITY};

use crate::crypto::BLSSecretKey;
use crate::hotstuff::certificate::{verify_qc, CertificateError};
use crate::hotstuff::engine::{Action, ConsensusEngine, EngineConfig, EngineError};
use crate::hotstuff::types::{GenesisError, Header, Message, MsgTo};
use crate::storage::{BlockStore, StorageError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Secret key does not match the configured identity")]
    KeyMismatch,

    #[error("Block store has no genesis")]
    MissingGenesis,

    #[error("Invalid genesis: {0}")]
    Genesis(#[from] GenesisError),

    #[error("Genesis certificate does not verify: {0}")]
    GenesisCertificate(#[from] CertificateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Engine(#[from] EngineError),

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Node is closed")]
    Closed,

    #[error("Deadline elapsed")]
    Cancelled,

    #[error("Event loop panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Input to the event loop
#[derive(Debug, Clone)]
pub enum Event {
    /// Protocol message from another replica
    Message(Message),
    /// Payload for this replica's next proposal
    Data(Vec<u8>),
}

/// Output channels of a node
#[derive(Debug)]
pub struct Outbound {
    pub messages: mpsc::Receiver<Vec<MsgTo>>,
    pub blocks: mpsc::Receiver<Vec<Header>>,
    pub ready: mpsc::Receiver<u64>,
}

/// Sending half of a node's inbound channel
#[derive(Debug, Clone)]
pub struct NodeHandle {
    events: mpsc::Sender<Event>,
}

impl NodeHandle {
    /// Deliver a protocol message, waiting for channel capacity
    pub async fn step(&self, message: Message) -> Result<()> {
        self.events
            .send(Event::Message(message))
            .await
            .map_err(|_| NodeError::Closed)
    }

    /// Supply a payload, waiting for channel capacity
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.events
            .send(Event::Data(data))
            .await
            .map_err(|_| NodeError::Closed)
    }

    /// Like `step`, giving up after `timeout`
    pub async fn step_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        self.deliver(Event::Message(message), timeout).await
    }

    /// Like `send`, giving up after `timeout`
    pub async fn send_timeout(&self, data: Vec<u8>, timeout: Duration) -> Result<()> {
        self.deliver(Event::Data(data), timeout).await
    }

    async fn deliver(&self, event: Event, timeout: Duration) -> Result<()> {
        match self.events.send_timeout(event, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NodeError::Cancelled),
            Err(SendTimeoutError::Closed(_)) => Err(NodeError::Closed),
        }
    }
}

struct Senders {
    messages: mpsc::Sender<Vec<MsgTo>>,
    blocks: mpsc::Sender<Vec<Header>>,
    ready: mpsc::Sender<u64>,
}

enum Lifecycle {
    Idle {
        engine: Box<ConsensusEngine>,
        inbound: mpsc::Receiver<Event>,
        senders: Senders,
    },
    Running {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<()>>,
    },
    Closed,
}

/// One replica: engine, channels and event loop
pub struct Node {
    index: u64,
    interval: Duration,
    store: BlockStore,
    handle: NodeHandle,
    outbound: Option<Outbound>,
    lifecycle: Lifecycle,
}

impl Node {
    /// Build a node over an initialized store
    ///
    /// The store must hold a genesis whose certificate verifies against the
    /// configured replica set.
    pub fn new(store: BlockStore, secret_key: BLSSecretKey, config: NodeConfig) -> Result<Self> {
        let (replicas, index) = config.validate()?;
        if secret_key.public_key() != config.id {
            return Err(NodeError::KeyMismatch);
        }

        let genesis = store.genesis()?.ok_or(NodeError::MissingGenesis)?;
        genesis.validate()?;
        verify_qc(&genesis.certificate, &replicas)?;

        let engine = ConsensusEngine::new(
            store.clone(),
            secret_key,
            EngineConfig {
                index,
                replicas,
                interval: config.interval,
                max_backoff: config.max_backoff,
                retention: config.retention,
            },
        )?;

        let capacity = config.channel_capacity;
        let (events, inbound) = mpsc::channel(capacity);
        let (messages_tx, messages) = mpsc::channel(capacity);
        let (blocks_tx, blocks) = mpsc::channel(capacity);
        let (ready_tx, ready) = mpsc::channel(capacity);

        Ok(Self {
            index,
            interval: config.interval,
            store,
            handle: NodeHandle { events },
            outbound: Some(Outbound {
                messages,
                blocks,
                ready,
            }),
            lifecycle: Lifecycle::Idle {
                engine: Box::new(engine),
                inbound,
                senders: Senders {
                    messages: messages_tx,
                    blocks: blocks_tx,
                    ready: ready_tx,
                },
            },
        })
    }

    /// This replica's index in the replica set
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Take the output channels; only the first call returns them
    pub fn outbound(&mut self) -> Option<Outbound> {
        self.outbound.take()
    }

    /// Block store, for reading the committed chain
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// Spawn the event loop on the current tokio runtime
    pub fn start(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Idle {
                engine,
                inbound,
                senders,
            } => {
                let (shutdown, shutdown_rx) = oneshot::channel();
                let event_loop = EventLoop {
                    engine,
                    inbound,
                    senders,
                    interval: self.interval,
                };
                let span = info_span!("replica", index = self.index);
                let task = tokio::spawn(event_loop.run(shutdown_rx).instrument(span));
                self.lifecycle = Lifecycle::Running { shutdown, task };
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                self.lifecycle = running;
                Err(NodeError::AlreadyStarted)
            }
            Lifecycle::Closed => Err(NodeError::Closed),
        }
    }

    /// Stop the event loop and wait for it
    ///
    /// Returns the error that stopped the loop, if any. Later calls are
    /// no-ops.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Running { shutdown, task } => {
                // The loop may already have exited on its own
                let _ = shutdown.send(());
                match task.await {
                    Ok(result) => result,
                    Err(e) => Err(NodeError::Panicked(e.to_string())),
                }
            }
            Lifecycle::Idle { .. } | Lifecycle::Closed => Ok(()),
        }
    }
}

struct EventLoop {
    engine: Box<ConsensusEngine>,
    inbound: mpsc::Receiver<Event>,
    senders: Senders,
    interval: Duration,
}

impl EventLoop {
    async fn run(self, shutdown: oneshot::Receiver<()>) -> Result<()> {
        let result = self.process(shutdown).await;
        match &result {
            Ok(()) => info!("Event loop stopped"),
            Err(e) => error!(error = %e, "Event loop failed"),
        }
        result
    }

    async fn process(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        self.engine.start()?;
        if !self.flush(&mut shutdown).await {
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutdown requested");
                    return Ok(());
                }

                event = self.inbound.recv() => match event {
                    Some(Event::Message(message)) => self.engine.on_message(message)?,
                    Some(Event::Data(data)) => self.engine.on_data(data)?,
                    None => return Ok(()),
                },

                _ = ticker.tick() => self.engine.on_tick()?,
            }

            if !self.flush(&mut shutdown).await {
                return Ok(());
            }
        }
    }

    /// Hand the engine's actions to the outbound channels
    ///
    /// Returns false if shutdown was requested while waiting for capacity.
    async fn flush(&mut self, shutdown: &mut oneshot::Receiver<()>) -> bool {
        let mut messages = Vec::new();
        let mut commits = Vec::new();
        let mut ready = Vec::new();
        for action in self.engine.drain() {
            match action {
                Action::Send(msg) => messages.push(msg),
                Action::Commit(headers) => commits.push(headers),
                Action::Ready(view) => ready.push(view),
            }
        }

        if !messages.is_empty() && !forward(&self.senders.messages, messages, shutdown).await {
            return false;
        }
        for headers in commits {
            if !forward(&self.senders.blocks, headers, shutdown).await {
                return false;
            }
        }
        for view in ready {
            match self.senders.ready.try_send(view) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!(view, "Ready prompt already pending"),
                Err(TrySendError::Closed(_)) => debug!(view, "Ready receiver dropped"),
            }
        }
        true
    }
}

/// Send on a bounded channel unless shutdown comes first
async fn forward<T>(
    sender: &mpsc::Sender<T>,
    value: T,
    shutdown: &mut oneshot::Receiver<()>,
) -> bool {
    tokio::select! {
        biased;

        _ = &mut *shutdown => false,

        result = sender.send(value) => {
            if result.is_err() {
                debug!("Outbound receiver dropped");
            }
            true
        }
    }
}
