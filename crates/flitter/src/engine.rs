//! The frame scheduler: reload, re-specialize, evaluate, dispatch, pace.
//!
//! A single cooperative loop drives everything. Each frame it asks the cache
//! for the current page's program (reloading on modification-time changes),
//! optionally re-specializes the tree against stable control state, walks it
//! into a scene graph, fans the graph's top-level subtrees out to renderer
//! proxies in parallel, persists dirty state at most once a second, and
//! sleeps to the next frame deadline — or yields immediately in lockstep
//! mode. External control (a surface, a UI) arrives on a command channel
//! drained between frames.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use indexmap::IndexMap;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::{FileCache, LoadedProgram, ProgramParser},
    clock::BeatCounter,
    errors::EngineError,
    evaluate::{Context, ModuleExports},
    render::{FrameVars, References, RendererProxy, RendererRegistry, UpdateArgs},
    simplify::{NameBinding, Names},
    state::{GlobalState, StateDict},
    symbols::Symbol,
    values::Vector,
};

/// Variables defined fresh each frame; dynamic to the load-time simplifier.
const FRAME_VARIABLES: [&str; 8] = [
    "beat",
    "quantum",
    "tempo",
    "delta",
    "clock",
    "performance",
    "fps",
    "realtime",
];

/// Consecutive state-file write failures tolerated before giving up.
const MAX_DUMP_FAILURES: u32 = 5;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub target_fps: f64,
    /// Real time paces frames against the wall clock; lockstep never sleeps.
    pub realtime: bool,
    pub state_file: Option<PathBuf>,
    /// Seconds of state stability before re-specializing the program on it;
    /// zero disables state specialization.
    pub state_eval_wait: f64,
    /// Seconds of state stability after which page state auto-resets.
    pub autoreset: Option<f64>,
    /// The load-time partial evaluator; off means raw parsed trees run.
    pub simplify: bool,
    pub cache_ttl: Duration,
    /// Static definitions folded into programs at load.
    pub defined: IndexMap<Symbol, Vector>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_fps: 60.0,
            realtime: true,
            state_file: None,
            state_eval_wait: 0.0,
            autoreset: None,
            simplify: true,
            cache_ttl: Duration::from_secs(5),
            defined: IndexMap::new(),
        }
    }
}

/// Control events from external collaborators, applied between frames.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Tempo { tempo: f64, quantum: u32, start: f64 },
    PageLeft,
    PageRight,
    SelectPage(usize),
    SetState { key: Vector, value: Vector },
    ResetState,
    Shutdown,
}

/// Cheap cloneable handle for sending commands into a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Queues a command; false when the engine is gone.
    pub fn send(&self, command: EngineCommand) -> bool {
        self.sender.send(command).is_ok()
    }
}

struct Page {
    path: PathBuf,
    state: StateDict,
}

pub struct Engine {
    config: EngineConfig,
    parser: Arc<dyn ProgramParser>,
    registry: RendererRegistry,
    cache: FileCache,
    counter: BeatCounter,
    pages: Vec<Page>,
    recovered: GlobalState,
    current_page: usize,
    next_page: Option<usize>,
    proxies: AHashMap<Symbol, Vec<RendererProxy>>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    handle: EngineHandle,

    current_program: Option<Arc<LoadedProgram>>,
    run_program: Option<Arc<LoadedProgram>>,
    state_timestamp: Option<f64>,
    global_dirty: bool,
    dump_time: f64,
    dump_failures: u32,
    frame_time: f64,
    last_beat: f64,
    performance: f64,
    errors: BTreeSet<String>,
    logs: BTreeSet<String>,
    frame_marks: Vec<f64>,
    shutdown: bool,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, parser: Arc<dyn ProgramParser>, registry: RendererRegistry) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let recovered = config
            .state_file
            .as_deref()
            .map(GlobalState::load)
            .unwrap_or_default();
        if !recovered.pages.is_empty() {
            info!("recovered state for {} pages", recovered.pages.len());
        }
        Self {
            config,
            parser,
            registry,
            cache: FileCache::new(),
            counter: BeatCounter::new(),
            pages: Vec::new(),
            recovered,
            current_page: 0,
            next_page: None,
            proxies: AHashMap::new(),
            commands,
            handle: EngineHandle { sender },
            current_program: None,
            run_program: None,
            state_timestamp: None,
            global_dirty: false,
            dump_time: 0.0,
            dump_failures: 0,
            frame_time: 0.0,
            last_beat: 0.0,
            performance: 1.0,
            errors: BTreeSet::new(),
            logs: BTreeSet::new(),
            frame_marks: Vec::new(),
            shutdown: false,
        }
    }

    /// Attaches media decoders to the engine's cache.
    pub fn set_decoders(&mut self, decoders: Arc<dyn crate::cache::AssetDecoders>) {
        self.cache = FileCache::with_decoders(decoders);
    }

    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn performance(&self) -> f64 {
        self.performance
    }

    #[must_use]
    pub fn current_page(&self) -> usize {
        self.current_page
    }

    /// Collected evaluation errors of the last frame.
    #[must_use]
    pub fn frame_errors(&self) -> &BTreeSet<String> {
        &self.errors
    }

    /// Registers a program file as the next page.
    pub fn load_page(&mut self, path: impl Into<PathBuf>) {
        let number = self.pages.len();
        let path = path.into();
        let state = self.recovered.pages.remove(&number).unwrap_or_default();
        info!(page = number, path = %path.display(), "added code page");
        self.pages.push(Page { path, state });
    }

    /// Readies the first page and the frame clock. Must run once before
    /// `run_frame`.
    pub fn prepare(&mut self) -> Result<(), EngineError> {
        if self.pages.is_empty() {
            return Err(EngineError::NoPages);
        }
        self.switch_to_page(self.current_page);
        self.frame_time = self.counter.clock();
        self.last_beat = self.counter.beat_at_time(self.frame_time);
        self.dump_time = self.frame_time;
        Ok(())
    }

    /// Runs until a `Shutdown` command arrives, then tears down proxies and
    /// the cache.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.prepare()?;
        let result = loop {
            match self.run_frame().await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            }
        };
        self.shutdown().await;
        result
    }

    /// One full frame. Returns false once shutdown has been requested.
    /// Exposed so embedders and tests can drive the loop themselves.
    pub async fn run_frame(&mut self) -> Result<bool, EngineError> {
        self.drain_commands();
        if self.shutdown {
            return Ok(false);
        }

        if self.pages[self.current_page].state.clear_dirty() {
            self.state_timestamp = Some(self.counter.clock());
            self.global_dirty = true;
        }

        // State changed while running a state-specialized tree: fall back to
        // the unspecialized program until the state settles again.
        if self.state_timestamp.is_some() && !program_eq(&self.run_program, &self.current_program) {
            debug!("undo partial-evaluation on state");
            self.run_program = self.current_program.clone();
        }

        self.reload_program();
        self.respecialize();

        let beat = self.counter.beat_at_time(self.frame_time);
        let delta = beat - self.last_beat;
        self.last_beat = beat;
        let variables = self.frame_variables(beat, delta);

        let state = std::mem::take(&mut self.pages[self.current_page].state);
        let mut context = Context::new(variables.clone(), state);
        let run_program = self.run_program.clone();
        if let Some(program) = &run_program {
            self.preload_imports(&program.top, &mut context);
            context.errors.extend(program.errors.iter().cloned());
            program.top.run(&mut context);
        }

        // Errors and logs print once per change, not once per frame.
        for message in context.errors.difference(&self.errors) {
            error!(target: "program", "{message}");
        }
        self.errors = context.errors.clone();
        for message in context.logs.difference(&self.logs) {
            info!(target: "program", "{message}");
        }
        self.logs = context.logs.clone();

        self.handle_pragmas(&mut context);
        self.route(&mut context, Arc::new(variables)).await;

        let mut state = std::mem::take(&mut context.state);
        if state.clear_dirty() {
            self.state_timestamp = Some(self.counter.clock());
            self.global_dirty = true;
        }
        self.pages[self.current_page].state = state;

        self.cache.clean(self.config.cache_ttl);
        self.autoreset();
        self.persist_state()?;

        if let Some(next) = self.next_page.take() {
            // Leaving a page with autoreset configured clears its state; the
            // initial entry into page zero never resets anything.
            if self.config.autoreset.is_some() {
                self.pages[self.current_page].state.reset();
            }
            self.switch_to_page(next);
        }

        self.pace().await;
        Ok(true)
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::Tempo { tempo, quantum, start } => {
                    self.counter.update(tempo, quantum, start);
                    let value = Vector::from(vec![tempo, f64::from(quantum), start]);
                    self.pages[self.current_page].state.set(Vector::symbol("_counter"), value);
                }
                EngineCommand::PageLeft => {
                    if self.current_page > 0 {
                        self.next_page = Some(self.current_page - 1);
                    }
                }
                EngineCommand::PageRight => {
                    if self.current_page + 1 < self.pages.len() {
                        self.next_page = Some(self.current_page + 1);
                    }
                }
                EngineCommand::SelectPage(page) => {
                    if page < self.pages.len() {
                        self.next_page = Some(page);
                    }
                }
                EngineCommand::SetState { key, value } => {
                    self.pages[self.current_page].state.set(key, value);
                }
                EngineCommand::ResetState => {
                    self.pages[self.current_page].state.reset();
                }
                EngineCommand::Shutdown => self.shutdown = true,
            }
        }
    }

    fn switch_to_page(&mut self, page: usize) {
        if page >= self.pages.len() {
            return;
        }
        self.current_page = page;
        self.current_program = None;
        self.run_program = None;
        self.performance = 1.0;
        self.state_timestamp = Some(self.counter.clock());
        let path = self.pages[page].path.clone();
        self.cache.set_root(&path);
        info!(page, path = %path.display(), "switched to page");
        // A recovered counter triple rewinds musical time to where the page
        // left off.
        let counter = self.pages[page].state.get(&Vector::symbol("_counter"));
        if let Some([tempo, quantum, start]) = counter.numbers() {
            self.counter.update(*tempo, quantum.floor().max(1.0) as u32, *start);
            info!(tempo = self.counter.tempo(), quantum = self.counter.quantum(), "restored counter");
        }
        for pool in self.proxies.values() {
            for proxy in pool {
                proxy.purge();
            }
        }
    }

    /// The static environment programs load under: the configured defines
    /// plus every frame variable marked dynamic.
    fn static_env(&self) -> Names {
        let mut names = Names::new();
        for (name, value) in &self.config.defined {
            names.insert(*name, NameBinding::Value(value.clone()));
        }
        for name in FRAME_VARIABLES {
            names.insert(Symbol::new(name), NameBinding::Dynamic);
        }
        names
    }

    fn frame_variables(&self, beat: f64, delta: f64) -> FrameVars {
        let mut variables = IndexMap::new();
        for (name, value) in &self.config.defined {
            variables.insert(*name, value.clone());
        }
        variables.insert(Symbol::new("beat"), Vector::from(beat));
        variables.insert(Symbol::new("quantum"), Vector::from(f64::from(self.counter.quantum())));
        variables.insert(Symbol::new("tempo"), Vector::from(self.counter.tempo()));
        variables.insert(Symbol::new("delta"), Vector::from(delta));
        variables.insert(Symbol::new("clock"), Vector::from(self.frame_time));
        variables.insert(Symbol::new("performance"), Vector::from(self.performance));
        variables.insert(Symbol::new("fps"), Vector::from(self.config.target_fps));
        variables.insert(Symbol::new("realtime"), Vector::boolean(self.config.realtime));
        variables
    }

    fn reload_program(&mut self) {
        let env = self.static_env();
        let parser = self.parser.clone();
        let path = self.pages[self.current_page].path.clone();
        let program = self
            .cache
            .entry(&path)
            .read_program(&env, parser.as_ref(), self.config.simplify);
        if !program_eq(&program, &self.current_program) {
            if program.is_some() {
                info!(page = self.current_page, path = %path.display(), "loaded page");
            }
            self.current_program = program.clone();
            self.run_program = program;
        }
    }

    /// Re-specializes the program against control state once the state has
    /// been stable for `state_eval_wait` seconds.
    fn respecialize(&mut self) {
        if self.config.state_eval_wait <= 0.0 || !self.config.simplify {
            return;
        }
        let Some(current) = self.current_program.clone() else {
            return;
        };
        let evaluate_state = match self.state_timestamp {
            Some(timestamp) => self.counter.clock() > timestamp + self.config.state_eval_wait,
            None => program_eq(&self.run_program, &self.current_program),
        };
        if !evaluate_state {
            return;
        }
        let env = self.static_env();
        let started = Instant::now();
        let (top, simplification) = current.top.simplify(&env, Some(&self.pages[self.current_page].state));
        debug!(
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            expressions = top.count_expressions(),
            "partially evaluated program on state"
        );
        let mut errors = current.errors.clone();
        errors.extend(simplification.errors);
        self.run_program = Some(Arc::new(LoadedProgram { top, errors }));
        self.state_timestamp = None;
    }

    /// Loads every imported module so evaluation never touches the
    /// filesystem mid-walk.
    fn preload_imports(&mut self, top: &crate::tree::Top, context: &mut Context) {
        let paths = top.imported_paths();
        if paths.is_empty() {
            return;
        }
        let env = self.static_env();
        let parser = self.parser.clone();
        for path in paths {
            let loaded = self
                .cache
                .entry(&path)
                .read_program(&env, parser.as_ref(), self.config.simplify);
            if let Some(loaded) = loaded {
                context
                    .modules
                    .insert(path, ModuleExports::collect(&loaded.top, &env));
            }
        }
    }

    /// First frame with no counter state adopts the program's `tempo` and
    /// `quantum` pragmas.
    fn handle_pragmas(&mut self, context: &mut Context) {
        let counter_key = Vector::symbol("_counter");
        if context.state.contains(&counter_key) {
            return;
        }
        let tempo = context
            .pragmas
            .get(&Symbol::new("tempo"))
            .and_then(Vector::as_f64)
            .filter(|tempo| *tempo > 0.0)
            .unwrap_or(BeatCounter::DEFAULT_TEMPO);
        let quantum = context
            .pragmas
            .get(&Symbol::new("quantum"))
            .and_then(Vector::as_f64)
            .filter(|quantum| *quantum >= 2.0)
            .map_or(BeatCounter::DEFAULT_QUANTUM, |quantum| quantum as u32);
        let start = self.counter.clock();
        self.counter.update(tempo, quantum, start);
        context
            .state
            .set(counter_key, Vector::from(vec![tempo, f64::from(quantum), start]));
        info!(tempo, quantum, "start counter");
    }

    /// Partitions the graph's top-level nodes by kind and fans updates out
    /// to the renderer pools, reusing proxies in order, spawning new ones as
    /// needed and destroying surplus. Awaits every queue submission.
    async fn route(&mut self, context: &mut Context, variables: Arc<FrameVars>) {
        let references: References = Arc::new(Mutex::new(AHashMap::new()));
        let mut by_kind: IndexMap<Symbol, Vec<Arc<crate::nodes::Node>>> = IndexMap::new();
        for child in &context.root.children {
            by_kind.entry(child.kind).or_default().push(child.clone());
        }

        let mut fanout = JoinSet::new();
        for (kind, nodes) in &by_kind {
            let Some(factory) = self.registry.get(*kind) else {
                continue;
            };
            let pool = self.proxies.entry(*kind).or_default();
            while pool.len() < nodes.len() {
                match RendererProxy::start(*kind, factory.as_ref()) {
                    Ok(proxy) => pool.push(proxy),
                    Err(err) => {
                        warn!(%kind, error = %err, "unable to start renderer");
                        break;
                    }
                }
            }
            for (proxy, node) in pool.iter().zip(nodes.iter()) {
                if let Some(sender) = proxy.update_sender() {
                    let args = UpdateArgs {
                        node: node.clone(),
                        state: context.state.clone(),
                        references: references.clone(),
                        variables: variables.clone(),
                    };
                    fanout.spawn(RendererProxy::send_update(&sender, args));
                }
            }
            while pool.len() > nodes.len() {
                if let Some(proxy) = pool.pop() {
                    proxy.destroy().await;
                }
            }
        }

        // Kinds that vanished from the graph release their whole pool.
        let stale: Vec<Symbol> = self
            .proxies
            .iter()
            .filter(|(kind, pool)| !pool.is_empty() && !by_kind.contains_key(*kind))
            .map(|(kind, _)| *kind)
            .collect();
        for kind in stale {
            if let Some(pool) = self.proxies.get_mut(&kind) {
                for proxy in pool.drain(..).collect::<Vec<_>>() {
                    proxy.destroy().await;
                }
            }
        }

        while let Some(result) = fanout.join_next().await {
            if let Ok(Err(err)) = result {
                warn!(error = %err, "renderer update not delivered");
            }
        }
    }

    fn autoreset(&mut self) {
        let Some(wait) = self.config.autoreset else {
            return;
        };
        if let Some(timestamp) = self.state_timestamp
            && self.counter.clock() > timestamp + wait
        {
            debug!("auto-reset state");
            self.pages[self.current_page].state.reset();
            self.pages[self.current_page].state.clear_dirty();
            self.global_dirty = true;
            self.state_timestamp = None;
            self.run_program = self.current_program.clone();
        }
    }

    fn persist_state(&mut self) -> Result<(), EngineError> {
        let Some(path) = self.config.state_file.clone() else {
            return Ok(());
        };
        if !self.global_dirty || self.frame_time <= self.dump_time + 1.0 {
            return Ok(());
        }
        debug!("saving state");
        match self.global_state().dump(&path) {
            Ok(()) => {
                self.global_dirty = false;
                self.dump_time = self.frame_time;
                self.dump_failures = 0;
                Ok(())
            }
            Err(error) => {
                self.dump_failures += 1;
                if self.dump_failures >= MAX_DUMP_FAILURES {
                    return Err(error);
                }
                warn!(%error, "unable to write state file");
                Ok(())
            }
        }
    }

    fn global_state(&self) -> GlobalState {
        let mut global = GlobalState::default();
        for (number, page) in self.pages.iter().enumerate() {
            global.pages.insert(number, page.state.clone());
        }
        global
    }

    /// Advances the frame deadline and sleeps (or yields) to it, tracking
    /// the performance scalar: up 0.001 for an on-time frame, down 0.01 for
    /// a late one, clamped to `[0.5, 2.0]`.
    async fn pace(&mut self) {
        let now = self.counter.clock();
        self.frame_marks.push(now);
        let frame_period = now - self.frame_time;
        self.frame_time += 1.0 / self.config.target_fps;
        if self.config.realtime {
            let wait = self.frame_time - now;
            self.performance = if wait > 0.001 {
                (self.performance + 0.001).min(2.0)
            } else {
                (self.performance - 0.01).max(0.5)
            };
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            } else {
                trace!(period_ms = frame_period * 1e3, "slow frame");
                tokio::task::yield_now().await;
                self.frame_time = self.counter.clock();
            }
        } else {
            self.performance = 1.0;
            tokio::task::yield_now().await;
        }
        self.log_frame_stats();
    }

    fn log_frame_stats(&mut self) {
        if self.frame_marks.len() < 2 {
            return;
        }
        let first = self.frame_marks[0];
        let last = *self.frame_marks.last().expect("non-empty marks");
        if last - first > 5.0 {
            let fps = (self.frame_marks.len() - 1) as f64 / (last - first);
            info!(fps = format!("{fps:.1}"), performance = format!("{:.2}", self.performance), "frame rate");
            self.frame_marks = vec![last];
        }
    }

    /// Destroys every proxy, empties the cache and writes a final state
    /// snapshot if one is pending.
    pub async fn shutdown(&mut self) {
        for (_, pool) in self.proxies.drain() {
            for proxy in pool {
                proxy.destroy().await;
            }
        }
        self.cache.clean(Duration::ZERO);
        if self.global_dirty
            && let Some(path) = self.config.state_file.clone()
            && let Err(error) = self.global_state().dump(&path)
        {
            warn!(%error, "unable to write state file at shutdown");
        }
        debug!("engine stopped");
    }
}

fn program_eq(a: &Option<Arc<LoadedProgram>>, b: &Option<Arc<LoadedProgram>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
