//! The block supervisor: reconcile ownership with locally running blocks.
//!
//! Each node runs one supervision loop. Every tick it walks the full
//! block graph and reconciles:
//!
//! - unowned block, not blacklisted → invoke placement
//! - owned by this node, not running → start it
//! - owned elsewhere, still running here → cancel it
//!
//! Starting a block schedules two cooperative tasks sharing one
//! cancellation token: the resource-run task (probe/setup side effects,
//! which flips each resource's monotonic `initialised` flag on first
//! success) and the [`run_while_ok`] wrapper around the block's `run()`.
//! Ownership loss cancels both — the token is flipped as soon as a tick
//! observes a foreign owner.
//!
//! Per-block lifecycle, local to the owning node:
//!
//! ```text
//! UNASSIGNED → ASSIGNED   (placement writes an owner)
//! ASSIGNED   → RUNNING    (resources initialised)
//! RUNNING    → STOPPING   (run() returns/fails, or ownership moves)
//! STOPPING   → UNASSIGNED (ownership cleared, placement re-invoked)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::block::{Block, BlockRegistry, OutputHandle};
use crate::config::Config;
use crate::dispatch::{input_wirings, Event, InputWiring, LocalBlock, LocalBlocks};
use crate::errors::{ConfigError, PlacementError};
use crate::placement::{current_owner, PlacementEngine};
use crate::resource::{self, ResourceRegistry, ResourceSpec};
use crate::store::{owner_key, ReplicatedStore};

/// One reconciliation pass per second.
pub const SUPERVISOR_TICK: Duration = Duration::from_secs(1);

/// Poll interval while waiting for resource initialisation.
const INIT_POLL: Duration = Duration::from_millis(200);

/// Retry interval for a failing resource setup probe.
const RESOURCE_RETRY: Duration = Duration::from_secs(5);

// ── Per-block runtime state ───────────────────────────────────────────────────

/// A resource bound to a running block instance: its `ResourceSpec` plus the local
/// availability flags the wrapper gates on.
pub struct ResourceRuntime {
    pub spec: Arc<dyn ResourceSpec>,
    initialised: AtomicBool,
    available: AtomicBool,
}

impl ResourceRuntime {
    pub fn new(spec: Arc<dyn ResourceSpec>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            initialised: AtomicBool::new(false),
            available: AtomicBool::new(false),
        })
    }

    /// Monotonic: set once the setup probe first succeeds.
    pub fn initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// The resource-run task body: probe until the first success, then
    /// mark the resource usable. Gives up only when cancelled.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let describe = self.spec.describe();
        loop {
            if *cancel.borrow() {
                return;
            }
            match self.spec.fitness().await {
                Ok(fitness) if fitness.is_truthy() => {
                    self.available.store(true, Ordering::SeqCst);
                    self.initialised.store(true, Ordering::SeqCst);
                    debug!(resource = %describe, "Resource initialised");
                    return;
                }
                Ok(_) => {
                    debug!(resource = %describe, "Resource not available yet");
                }
                Err(e) => {
                    warn!(resource = %describe, error = %e, "Resource setup probe failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RESOURCE_RETRY) => {}
                _ = cancel.changed() => {}
            }
        }
    }
}

/// Everything the supervisor holds for one configured block.
pub struct BlockRuntime {
    pub name: String,
    pub block: Arc<dyn Block>,
    pub resources: Vec<Arc<ResourceRuntime>>,
    pub wirings: Vec<InputWiring>,
    pub optional: bool,
}

impl BlockRuntime {
    /// Construct every configured block with its output handle, resource
    /// specs, and resolved input wirings. Unknown block or resource types
    /// are fatal here, before anything starts.
    pub fn build_all(
        config: &Config,
        blocks: &BlockRegistry,
        resources: &ResourceRegistry,
        out_tx: &mpsc::UnboundedSender<Event>,
    ) -> Result<BTreeMap<String, Arc<BlockRuntime>>, ConfigError> {
        let mut runtimes = BTreeMap::new();
        for (name, block_config) in &config.blocks {
            let out = OutputHandle::new(name, out_tx.clone());
            let block = blocks.build(name, block_config, out)?;
            let specs = block_config
                .require
                .iter()
                .map(|entry| resources.build(name, entry))
                .collect::<Result<Vec<_>, _>>()?;
            runtimes.insert(
                name.clone(),
                Arc::new(BlockRuntime {
                    name: name.clone(),
                    block,
                    resources: specs.into_iter().map(ResourceRuntime::new).collect(),
                    wirings: input_wirings(block_config),
                    optional: block_config.optional,
                }),
            );
        }
        Ok(runtimes)
    }

    fn specs(&self) -> Vec<Arc<dyn ResourceSpec>> {
        self.resources.iter().map(|r| r.spec.clone()).collect()
    }
}

// ── run_while_ok ──────────────────────────────────────────────────────────────

/// Guarded wrapper around a block's `run()`.
///
/// Waits for every resource to initialise, then re-invokes `run()` for as
/// long as this node owns the block, its resources stay available, and
/// nobody has flipped the cancellation token. A failing or panicking
/// `run()` exits the wrapper. On exit, ownership is cleared if it still
/// points here, which re-triggers placement on the next tick.
pub async fn run_while_ok(
    runtime: Arc<BlockRuntime>,
    store: ReplicatedStore,
    self_node: String,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        if runtime.resources.iter().all(|r| r.initialised()) {
            break;
        }
        tokio::time::sleep(INIT_POLL).await;
    }

    while !*cancel.borrow()
        && current_owner(&store, &runtime.name).as_deref() == Some(self_node.as_str())
        && runtime.resources.iter().all(|r| r.available())
    {
        let block = runtime.block.clone();
        let run_cancel = cancel.clone();
        // Spawned so a panicking run() surfaces as a JoinError here
        // instead of unwinding into the supervisor.
        let outcome = tokio::spawn(async move { block.run(run_cancel).await }).await;
        match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                error!(block = %runtime.name, error = %e, "Block run failed");
                break;
            }
            Err(e) => {
                error!(block = %runtime.name, error = %e, "Block run panicked");
                break;
            }
        }
    }

    if current_owner(&store, &runtime.name).as_deref() == Some(self_node.as_str()) {
        match store.set(&owner_key(&runtime.name), Value::Null).await {
            Ok(()) => info!(block = %runtime.name, "Ownership cleared"),
            Err(e) => {
                // The next tick's reconciliation retries via placement.
                debug!(block = %runtime.name, error = %e, "Could not clear ownership")
            }
        }
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

struct RunningBlock {
    cancel_tx: watch::Sender<bool>,
    wrapper: JoinHandle<()>,
    // Resource tasks listen on the same token and exit once it flips.
    _resource_tasks: Vec<JoinHandle<()>>,
}

pub struct Supervisor {
    self_node: String,
    store: ReplicatedStore,
    placement: PlacementEngine,
    runtimes: BTreeMap<String, Arc<BlockRuntime>>,
    locals: LocalBlocks,
    running: HashMap<String, RunningBlock>,
    /// Optional blocks that turned out unassignable. Never retried.
    blacklist: HashSet<String>,
    node_names: Vec<String>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        self_node: String,
        store: ReplicatedStore,
        runtimes: BTreeMap<String, Arc<BlockRuntime>>,
        locals: LocalBlocks,
    ) -> Self {
        let node_names = if config.nodes.is_empty() {
            vec![self_node.clone()]
        } else {
            config.node_names()
        };
        let placement = PlacementEngine::new(store.clone(), node_names.clone());
        Self {
            self_node,
            store,
            placement,
            runtimes,
            locals,
            running: HashMap::new(),
            blacklist: HashSet::new(),
            node_names,
        }
    }

    /// Probe resources, wait for the whole cluster to finish probing, then
    /// reconcile forever. Only a non-optional unassignable block returns.
    pub async fn run(mut self) -> Result<(), PlacementError> {
        let specs: Vec<Arc<dyn ResourceSpec>> = self
            .runtimes
            .values()
            .flat_map(|rt| rt.specs())
            .collect();
        resource::probe_all(&specs, &self.store, &self.self_node).await;

        let mut describes: Vec<String> = specs.iter().map(|s| s.describe()).collect();
        describes.sort();
        describes.dedup();
        resource::wait_checked_all(&self.store, &self.node_names, &describes).await;

        info!(node = %self.self_node, blocks = self.runtimes.len(), "Supervisor started");
        loop {
            self.tick().await?;
            tokio::time::sleep(SUPERVISOR_TICK).await;
        }
    }

    /// One reconciliation pass over every configured block.
    pub async fn tick(&mut self) -> Result<(), PlacementError> {
        self.reap();

        let entries: Vec<(String, Arc<BlockRuntime>)> = self
            .runtimes
            .iter()
            .map(|(name, rt)| (name.clone(), rt.clone()))
            .collect();

        for (name, runtime) in entries {
            match current_owner(&self.store, &name) {
                None => {
                    if self.blacklist.contains(&name) {
                        continue;
                    }
                    match self.placement.assign_block(&name, &runtime.specs()).await {
                        Ok(Some(node)) if node == self.self_node => {
                            if !self.running.contains_key(&name) {
                                self.start_block(&name, &runtime);
                            }
                        }
                        Ok(_) => {}
                        Err(PlacementError::Unassignable(_)) if runtime.optional => {
                            warn!(block = %name, "Optional block unassignable, blacklisted");
                            self.blacklist.insert(name.clone());
                        }
                        Err(PlacementError::Unassignable(block)) => {
                            return Err(PlacementError::Unassignable(block));
                        }
                        Err(PlacementError::Store(e)) => {
                            debug!(block = %name, error = %e, "Placement write failed, retrying next tick");
                        }
                    }
                }
                Some(node) if node == self.self_node => {
                    if !self.running.contains_key(&name) {
                        self.start_block(&name, &runtime);
                    }
                }
                Some(_) => {
                    if let Some(running) = self.running.get(&name) {
                        // Losing instance: flip the shared token; reap
                        // removes it once the wrapper exits.
                        let _ = running.cancel_tx.send(true);
                    }
                }
            }
        }

        Ok(())
    }

    /// Schedule the two cooperative tasks for an owned block and make it
    /// visible to the delivery loop.
    fn start_block(&mut self, name: &str, runtime: &Arc<BlockRuntime>) {
        info!(block = %name, "Starting block");

        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.locals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.to_string(),
                LocalBlock {
                    block: runtime.block.clone(),
                    inputs: runtime.wirings.clone(),
                },
            );

        let resource_tasks = runtime
            .resources
            .iter()
            .map(|res| {
                let res = res.clone();
                let cancel = cancel_rx.clone();
                tokio::spawn(async move { res.run(cancel).await })
            })
            .collect();

        let wrapper = tokio::spawn(run_while_ok(
            runtime.clone(),
            self.store.clone(),
            self.self_node.clone(),
            cancel_rx,
        ));

        self.running.insert(
            name.to_string(),
            RunningBlock {
                cancel_tx,
                wrapper,
                _resource_tasks: resource_tasks,
            },
        );
    }

    /// Drop bookkeeping for wrappers that have exited, cancelling their
    /// resource tasks through the shared token.
    fn reap(&mut self) {
        let finished: Vec<String> = self
            .running
            .iter()
            .filter(|(_, running)| running.wrapper.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            if let Some(running) = self.running.remove(&name) {
                let _ = running.cancel_tx.send(true);
                self.locals
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&name);
                info!(block = %name, "Block stopped");
            }
        }
    }

    /// Blocks this node currently runs, for tests and status.
    pub fn running_blocks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.keys().cloned().collect();
        names.sort();
        names
    }

    /// The local unassignable blacklist.
    pub fn blacklisted(&self, name: &str) -> bool {
        self.blacklist.contains(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
