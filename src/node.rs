use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::abi::AbiStore;
use crate::api::ApiState;
use crate::config::NodeConfig;
use crate::dispatcher::PrivateTxManager;
use crate::domain::DomainRegistry;
use crate::errors::EngineResult;
use crate::ethclient::{EthClient, IndexedTransaction};
use crate::identity::{CachingIdentityResolver, IdentityResolver, KeyManager};
use crate::pubtm::{PubTmEvent, PublicTxManager};
use crate::storage::Storage;
use crate::transport::{Frame, Transport};

/// External collaborators a node is wired with. Production wiring provides
/// plugin-backed implementations; tests provide in-process doubles.
pub struct NodeDeps {
    pub registry: DomainRegistry,
    pub resolver: Arc<dyn IdentityResolver>,
    pub keymgr: Arc<dyn KeyManager>,
    pub eth: Arc<dyn EthClient>,
    pub transport: Arc<dyn Transport>,
    /// Frames arriving from remote nodes.
    pub transport_inbound: mpsc::UnboundedReceiver<Frame>,
    /// Confirmed-transaction batches from the block indexer.
    pub indexer: mpsc::UnboundedReceiver<Vec<IndexedTransaction>>,
}

/// One node of the network: storage, the private transaction manager with
/// its sequencers, and the public transaction manager with its
/// orchestrators.
pub struct Node {
    ptm: PrivateTxManager,
    pubtm: PublicTxManager,
    abi: AbiStore,
    transport_inbound: mpsc::UnboundedReceiver<Frame>,
    indexer: mpsc::UnboundedReceiver<Vec<IndexedTransaction>>,
    events: mpsc::UnboundedReceiver<PubTmEvent>,
}

#[derive(Clone)]
pub struct NodeHandle {
    pub ptm: PrivateTxManager,
    pub pubtm: PublicTxManager,
    pub abi: AbiStore,
}

impl Node {
    pub fn new(config: NodeConfig, deps: NodeDeps) -> EngineResult<Self> {
        config.ensure_directories()?;
        let storage = Storage::open(&config.data_dir.join("db"))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let pubtm = PublicTxManager::new(
            storage.clone(),
            deps.eth,
            deps.keymgr.clone(),
            config.orchestrator.clone(),
            config.engine.clone(),
            config.gas_price.clone(),
            event_tx,
        );
        let resolver = Arc::new(CachingIdentityResolver::new(deps.resolver));
        let ptm = PrivateTxManager::new(
            config.node_name.clone(),
            deps.registry,
            storage.clone(),
            resolver,
            deps.keymgr,
            deps.transport,
            pubtm.clone(),
            config.sequencer.clone(),
            config.transport.clone(),
            config.engine.retry.clone(),
        );
        let abi = AbiStore::new(storage);

        Ok(Self {
            ptm,
            pubtm,
            abi,
            transport_inbound: deps.transport_inbound,
            indexer: deps.indexer,
            events: event_rx,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            ptm: self.ptm.clone(),
            pubtm: self.pubtm.clone(),
            abi: self.abi.clone(),
        }
    }

    /// Runs the node's background loops until shutdown: the public tx
    /// engine, the inbound transport router, the block-indexer feed, and
    /// completion event fan-out.
    pub async fn start(self) -> EngineResult<()> {
        let Node {
            ptm,
            pubtm,
            abi: _,
            mut transport_inbound,
            mut indexer,
            mut events,
        } = self;

        info!(node = ptm.node_name(), "node runtime started");
        let engine = pubtm.start();

        let inbound_ptm = ptm.clone();
        let inbound = tokio::spawn(async move {
            while let Some(frame) = transport_inbound.recv().await {
                if let Err(err) = inbound_ptm.handle_inbound(frame).await {
                    warn!(%err, "inbound frame handling failed");
                }
            }
        });

        let indexer_pubtm = pubtm.clone();
        let indexer_task = tokio::spawn(async move {
            while let Some(batch) = indexer.recv().await {
                if let Err(err) = indexer_pubtm.handle_confirmed_transactions(batch) {
                    warn!(%err, "confirmation handling failed");
                }
            }
        });

        let events_ptm = ptm.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = events_ptm.handle_pubtm_event(event).await {
                    warn!(%err, "completion event handling failed");
                }
            }
        });

        let _ = tokio::try_join!(engine, inbound, indexer_task, events_task);
        Ok(())
    }
}

impl NodeHandle {
    pub fn api_state(&self) -> ApiState {
        ApiState {
            ptm: self.ptm.clone(),
            pubtm: self.pubtm.clone(),
            abi: self.abi.clone(),
        }
    }
}
