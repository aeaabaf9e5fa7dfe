//! Frame scheduler behavior: pacing, routing, state persistence, page
//! switching and error surfacing.

use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use flitter::{
    Binding, Engine, EngineCommand, EngineConfig, Expression, FrameVars, GlobalState, Node, ParseError,
    ProgramParser, References, RenderError, Renderer, RendererFactory, RendererRegistry, StateDict, Symbol, Top,
    Vector,
};

/// A toy language: each line is a word. `node <kind>` emits a node of that
/// kind, `store <name> <value>` emits a StoreGlobal, `use <name>` references
/// a name, anything else is a parse error.
struct WordParser;

impl ProgramParser for WordParser {
    fn parse(&self, source: &str) -> Result<Top, ParseError> {
        let mut items = Vec::new();
        for (index, line) in source.lines().enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                [] => {}
                ["node", kind] => items.push(Expression::node(*kind)),
                ["store", name, value] => items.push(Expression::StoreGlobal {
                    bindings: vec![Binding::new(*name, Expression::literal(value.parse::<f64>().unwrap_or(0.0)))],
                }),
                ["use", name] => items.push(Expression::Sequence(vec![Expression::name(*name)])),
                _ => return Err(ParseError::new(index + 1, 1, format!("unexpected line {line:?}"))),
            }
        }
        Ok(Top::new(items))
    }
}

struct CountingRenderer {
    updates: Arc<AtomicUsize>,
}

impl Renderer for CountingRenderer {
    fn update(
        &mut self,
        _node: &Node,
        _state: &StateDict,
        _references: &References,
        _variables: &FrameVars,
    ) -> Result<(), RenderError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingFactory {
    updates: Arc<AtomicUsize>,
}

impl RendererFactory for CountingFactory {
    fn spawn(&self) -> Result<Box<dyn Renderer>, RenderError> {
        Ok(Box::new(CountingRenderer {
            updates: self.updates.clone(),
        }))
    }
}

fn registry_counting(kind: &str) -> (RendererRegistry, Arc<AtomicUsize>) {
    let updates = Arc::new(AtomicUsize::new(0));
    let mut registry = RendererRegistry::new();
    registry.register(kind, Arc::new(CountingFactory { updates: updates.clone() }));
    (registry, updates)
}

fn lockstep_config() -> EngineConfig {
    EngineConfig {
        realtime: false,
        ..EngineConfig::default()
    }
}

fn write_program(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

async fn drive(engine: &mut Engine, frames: usize) {
    for _ in 0..frames {
        assert!(engine.run_frame().await.unwrap());
    }
}

#[tokio::test]
async fn lockstep_frames_complete_without_wall_clock_sleeping() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "node window\n");
    let (registry, updates) = registry_counting("window");
    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), registry);
    engine.load_page(path);
    engine.prepare().unwrap();

    let started = Instant::now();
    drive(&mut engine, 100).await;
    engine.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(2), "lockstep slept on the wall clock");
    assert_eq!(updates.load(Ordering::SeqCst), 100);
    assert!((engine.performance() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn realtime_frames_pace_against_the_wall_clock() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "node window\n");
    let (registry, _) = registry_counting("window");
    let config = EngineConfig {
        target_fps: 50.0,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config, Arc::new(WordParser), registry);
    engine.load_page(path);
    engine.prepare().unwrap();

    let started = Instant::now();
    drive(&mut engine, 10).await;
    engine.shutdown().await;

    // Ten frames at 20ms each, allowing generous scheduling slack.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn the_performance_scalar_clamps_at_the_floor_under_constant_lateness() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "node window\n");
    let (registry, _) = registry_counting("window");
    let config = EngineConfig {
        // An impossible frame rate makes every frame late.
        target_fps: 1e6,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config, Arc::new(WordParser), registry);
    engine.load_page(path);
    engine.prepare().unwrap();
    drive(&mut engine, 200).await;
    engine.shutdown().await;
    assert!((engine.performance() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn store_globals_persist_to_the_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "store level 7\n");
    let state_file = dir.path().join("state.bin");
    let config = EngineConfig {
        realtime: false,
        target_fps: 5.0,
        state_file: Some(state_file.clone()),
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config, Arc::new(WordParser), RendererRegistry::new());
    engine.load_page(path);
    engine.prepare().unwrap();
    drive(&mut engine, 10).await;
    engine.shutdown().await;

    assert!(state_file.exists());
    let recovered = GlobalState::load(&state_file);
    let page = recovered.pages.get(&0).expect("page zero state");
    assert_eq!(page.get(&Vector::symbol("level")), Vector::from(7.0));
}

#[tokio::test]
async fn unbound_names_surface_as_frame_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "use nosuch\n");
    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), RendererRegistry::new());
    engine.load_page(path);
    engine.prepare().unwrap();
    drive(&mut engine, 3).await;
    engine.shutdown().await;
    assert!(engine.frame_errors().contains("Unbound name 'nosuch'"));
}

#[tokio::test]
async fn frame_variables_are_visible_to_programs() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "use beat\nuse fps\n");
    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), RendererRegistry::new());
    engine.load_page(path);
    engine.prepare().unwrap();
    drive(&mut engine, 3).await;
    engine.shutdown().await;
    assert!(engine.frame_errors().is_empty(), "frame variables should resolve: {:?}", engine.frame_errors());
}

#[tokio::test]
async fn page_switches_apply_between_frames_and_swap_renderer_pools() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_program(dir.path(), "one.fl", "node window\n");
    let second = write_program(dir.path(), "two.fl", "node lamp\n");

    let window_updates = Arc::new(AtomicUsize::new(0));
    let lamp_updates = Arc::new(AtomicUsize::new(0));
    let mut registry = RendererRegistry::new();
    registry.register("window", Arc::new(CountingFactory { updates: window_updates.clone() }));
    registry.register("lamp", Arc::new(CountingFactory { updates: lamp_updates.clone() }));

    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), registry);
    engine.load_page(first);
    engine.load_page(second);
    let handle = engine.handle();
    engine.prepare().unwrap();

    drive(&mut engine, 3).await;
    assert_eq!(engine.current_page(), 0);
    assert!(window_updates.load(Ordering::SeqCst) >= 3);
    assert_eq!(lamp_updates.load(Ordering::SeqCst), 0);

    handle.send(EngineCommand::SelectPage(1));
    drive(&mut engine, 3).await;
    engine.shutdown().await;

    assert_eq!(engine.current_page(), 1);
    assert!(lamp_updates.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn a_shutdown_command_ends_the_run_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "node window\n");
    let (registry, _) = registry_counting("window");
    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), registry);
    engine.load_page(path);
    let handle = engine.handle();
    handle.send(EngineCommand::Shutdown);
    tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .expect("run did not stop")
        .expect("run failed");
}

#[tokio::test]
async fn edited_programs_reload_on_modification_time_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_program(dir.path(), "page.fl", "node window\n");
    let window_updates = Arc::new(AtomicUsize::new(0));
    let lamp_updates = Arc::new(AtomicUsize::new(0));
    let mut registry = RendererRegistry::new();
    registry.register("window", Arc::new(CountingFactory { updates: window_updates.clone() }));
    registry.register("lamp", Arc::new(CountingFactory { updates: lamp_updates.clone() }));

    let mut engine = Engine::new(lockstep_config(), Arc::new(WordParser), registry);
    engine.load_page(&path);
    engine.prepare().unwrap();
    drive(&mut engine, 2).await;
    assert!(window_updates.load(Ordering::SeqCst) >= 2);

    // Rewrite the page; the next frames pick up the new tree.
    std::thread::sleep(Duration::from_millis(20));
    fs::write(&path, "node lamp\n").unwrap();
    drive(&mut engine, 3).await;
    engine.shutdown().await;
    assert!(lamp_updates.load(Ordering::SeqCst) >= 1);
}
