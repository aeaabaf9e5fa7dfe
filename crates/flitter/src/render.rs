//! Renderer proxies: one worker per renderer, driven over a capacity-one
//! queue.
//!
//! Concrete backends (windows, shaders, DMX, lasers) implement [`Renderer`]
//! and register a [`RendererFactory`] under the node kind they consume. The
//! scheduler talks to each backend through a [`RendererProxy`]: `update` is
//! asynchronous and backpressured — the queue holds at most one pending
//! update, so a submission suspends until the worker has picked up the
//! previous one — `purge` is a best-effort cache-release hint and `destroy`
//! shuts the worker down and joins it.

use std::{
    any::Any,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{errors::RenderError, nodes::Node, state::StateDict, symbols::Symbol, values::Vector};

/// The per-frame variables handed to every renderer update.
pub type FrameVars = IndexMap<Symbol, Vector>;

/// Objects renderers publish under user-assigned `id` attributes, shared
/// across one frame's fan-out so siblings can refer to earlier ones.
pub type References = Arc<Mutex<AHashMap<Symbol, Arc<dyn Any + Send + Sync>>>>;

/// A renderer backend. Runs on its proxy's worker thread.
pub trait Renderer: Send + 'static {
    /// Consumes one scene-graph subtree for one frame.
    fn update(
        &mut self,
        node: &Node,
        state: &StateDict,
        references: &References,
        variables: &FrameVars,
    ) -> Result<(), RenderError>;

    /// Best-effort request to release caches.
    fn purge(&mut self) {}
}

/// Creates renderers for one node kind.
pub trait RendererFactory: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn Renderer>, RenderError>;
}

impl<F> RendererFactory for F
where
    F: Fn() -> Result<Box<dyn Renderer>, RenderError> + Send + Sync,
{
    fn spawn(&self) -> Result<Box<dyn Renderer>, RenderError> {
        self()
    }
}

/// Registered renderer factories, keyed by the node kind they consume.
#[derive(Default)]
pub struct RendererRegistry {
    factories: AHashMap<Symbol, Arc<dyn RendererFactory>>,
}

impl RendererRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<Symbol>, factory: Arc<dyn RendererFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    #[must_use]
    pub fn get(&self, kind: Symbol) -> Option<&Arc<dyn RendererFactory>> {
        self.factories.get(&kind)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<Symbol> {
        self.factories.keys().copied().collect()
    }
}

/// One queued frame update.
pub struct UpdateArgs {
    pub node: Arc<Node>,
    pub state: StateDict,
    pub references: References,
    pub variables: Arc<FrameVars>,
}

pub(crate) enum ProxyRequest {
    Update(UpdateArgs),
    Purge,
}

/// The scheduler-side handle to one renderer worker.
///
/// Dropping the sender ends the worker's receive loop; `destroy` does that
/// explicitly and joins the thread.
pub struct RendererProxy {
    kind: Symbol,
    sender: Option<mpsc::Sender<ProxyRequest>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl RendererProxy {
    /// Spawns a renderer on a fresh worker thread. A factory failure means
    /// this kind is unavailable; the caller logs and carries on.
    pub fn start(kind: Symbol, factory: &dyn RendererFactory) -> Result<Self, RenderError> {
        let renderer = factory.spawn()?;
        let (sender, receiver) = mpsc::channel(1);
        let worker = thread::Builder::new()
            .name(format!("render-{kind}"))
            .spawn(move || worker_loop(kind, renderer, receiver))
            .map_err(|error| RenderError::Failed(error.to_string()))?;
        debug!(%kind, "started renderer worker");
        Ok(Self {
            kind,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queues one update. Suspends while the worker still holds the
    /// previous one: the queue depth is one, which is what keeps frame N's
    /// updates ahead of frame N+1's everywhere.
    pub async fn update(&self, args: UpdateArgs) -> Result<(), RenderError> {
        let Some(sender) = &self.sender else {
            return Err(RenderError::WorkerStopped);
        };
        sender
            .send(ProxyRequest::Update(args))
            .await
            .map_err(|_| RenderError::WorkerStopped)
    }

    /// Clone of the queue sender, for spawning fan-out tasks.
    pub(crate) fn update_sender(&self) -> Option<mpsc::Sender<ProxyRequest>> {
        self.sender.clone()
    }

    pub(crate) fn send_update(sender: &mpsc::Sender<ProxyRequest>, args: UpdateArgs) -> impl Future<Output = Result<(), RenderError>> + use<> {
        let sender = sender.clone();
        async move {
            sender
                .send(ProxyRequest::Update(args))
                .await
                .map_err(|_| RenderError::WorkerStopped)
        }
    }

    /// Asks the worker to release caches; never blocks, quietly drops the
    /// hint when the queue is busy.
    pub fn purge(&self) {
        if let Some(sender) = &self.sender
            && sender.try_send(ProxyRequest::Purge).is_err()
        {
            debug!(kind = %self.kind, "purge skipped, worker busy");
        }
    }

    /// Shuts the worker down and joins it.
    pub async fn destroy(mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let kind = self.kind;
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            match joined {
                Ok(Ok(())) => debug!(%kind, "renderer worker stopped"),
                _ => warn!(%kind, "renderer worker did not stop cleanly"),
            }
        }
    }
}

/// Stats cadence for the per-worker render-time log line.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn worker_loop(kind: Symbol, mut renderer: Box<dyn Renderer>, mut receiver: mpsc::Receiver<ProxyRequest>) {
    let mut frames = 0u32;
    let mut render_time = Duration::ZERO;
    let mut stats_at = Instant::now() + STATS_INTERVAL;
    while let Some(request) = receiver.blocking_recv() {
        match request {
            ProxyRequest::Update(args) => {
                let started = Instant::now();
                if let Err(err) = renderer.update(&args.node, &args.state, &args.references, &args.variables) {
                    // Worker failures are logged and the renderer carries on.
                    error!(%kind, error = %err, "renderer update failed");
                }
                render_time += started.elapsed();
                frames += 1;
            }
            ProxyRequest::Purge => renderer.purge(),
        }
        if Instant::now() >= stats_at {
            if frames > 0 {
                info!(
                    %kind,
                    per_frame_ms = render_time.as_secs_f64() * 1e3 / f64::from(frames),
                    "render time"
                );
            }
            frames = 0;
            render_time = Duration::ZERO;
            stats_at += STATS_INTERVAL;
        }
    }
}
