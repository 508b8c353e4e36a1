//! Owner of every loaded world and the shared render pool.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use mural_common::{ChunkCoord, MuralResult, WorldError};
use tracing::{debug, error, info, warn};

use crate::render::{ChunkEncoder, ChunkResponder, ChunkResponse, PngChunkEncoder, RenderPool};
use crate::timing::TickTimer;
use crate::world::{SaveSummary, World, WorldSettings};

/// Longest accepted world name.
pub const MAX_WORLD_NAME_LEN: usize = 24;

/// World used when a client names none.
pub const DEFAULT_WORLD_NAME: &str = "main";

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory holding one subdirectory per world
    pub worlds_dir: PathBuf,
    /// World used when a client names none
    pub default_world: String,
    /// Render worker threads
    pub render_threads: usize,
    /// Settings applied to every world
    pub world: WorldSettings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worlds_dir: PathBuf::from("worlds"),
            default_world: DEFAULT_WORLD_NAME.to_string(),
            render_threads: 2,
            world: WorldSettings::default(),
        }
    }
}

/// Loads, ticks, saves and unloads worlds.
pub struct WorldManager {
    /// Loaded worlds by name; declared before `pool` so worlds drop first
    worlds: BTreeMap<String, World>,
    /// Configuration
    config: ManagerConfig,
    /// Tick interval average
    timer: TickTimer,
    /// Shared encoder threads
    pool: RenderPool,
}

impl WorldManager {
    /// Creates a manager rendering chunks as PNG.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_encoder(config, Arc::new(PngChunkEncoder))
    }

    /// Creates a manager with a custom chunk encoder.
    #[must_use]
    pub fn with_encoder(config: ManagerConfig, encoder: Arc<dyn ChunkEncoder>) -> Self {
        let pool = RenderPool::new(config.render_threads, encoder);
        info!(
            "World manager started: dir={:?}, render_threads={}",
            config.worlds_dir,
            pool.threads()
        );
        Self {
            worlds: BTreeMap::new(),
            config,
            timer: TickTimer::default(),
            pool,
        }
    }

    /// Whether `name` is 1..=24 characters of `a-z`, `0-9`, `_` and `.`.
    #[must_use]
    pub fn verify_world_name(name: &str) -> bool {
        (1..=MAX_WORLD_NAME_LEN).contains(&name.len())
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'.')
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn default_world(&self) -> &str {
        &self.config.default_world
    }

    /// Changes the default world. Returns false for an invalid name.
    pub fn set_default_world(&mut self, name: &str) -> bool {
        if !Self::verify_world_name(name) {
            return false;
        }
        self.config.default_world = name.to_string();
        true
    }

    /// Returns the world called `name`, opening it on first use.
    pub fn get_or_load_world(&mut self, name: &str) -> MuralResult<&mut World> {
        if !Self::verify_world_name(name) {
            return Err(WorldError::InvalidWorldName(name.to_string()).into());
        }

        match self.worlds.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let world = World::open(
                    name,
                    &self.config.worlds_dir,
                    self.config.world,
                    self.pool.submitter(),
                )?;
                Ok(entry.insert(world))
            },
        }
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.worlds.contains_key(name)
    }

    #[must_use]
    pub fn loaded_worlds(&self) -> usize {
        self.worlds.len()
    }

    #[must_use]
    pub fn world(&self, name: &str) -> Option<&World> {
        self.worlds.get(name)
    }

    pub fn world_mut(&mut self, name: &str) -> Option<&mut World> {
        self.worlds.get_mut(name)
    }

    /// Players joined across every world.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.worlds.values().map(World::player_count).sum()
    }

    /// Ticks per second, smoothed.
    #[must_use]
    pub fn tps(&self) -> f64 {
        self.timer.tps()
    }

    /// One simulation step.
    ///
    /// Applies finished renders and flushes batched updates in every world,
    /// then unloads worlds that asked for it. A panic inside one world is
    /// logged and does not stop the others.
    pub fn tick(&mut self) {
        for (name, world) in &mut self.worlds {
            let result = catch_unwind(AssertUnwindSafe(|| {
                world.poll_renders();
                world.flush_updates();
            }));
            if result.is_err() {
                error!("World {name} panicked during tick");
            }
        }

        self.reap();
        self.timer.tick();
    }

    /// Unloads worlds that requested it and are still empty.
    fn reap(&mut self) -> usize {
        let idle: Vec<String> = self
            .worlds
            .iter_mut()
            .filter_map(|(name, world)| {
                (world.take_unload_request() && world.is_unload_eligible()).then(|| name.clone())
            })
            .collect();

        for name in &idle {
            self.worlds.remove(name);
        }
        idle.len()
    }

    /// Periodic maintenance: evicts idle chunks everywhere.
    pub fn sweep(&mut self) -> usize {
        self.unload_old_chunks(false)
    }

    /// Evicts idle chunks in every world (every unpinned chunk if `all`),
    /// then unloads empty worlds. Returns the number of chunks evicted.
    pub fn unload_old_chunks(&mut self, all: bool) -> usize {
        let evicted = self
            .worlds
            .values_mut()
            .map(|world| world.unload_old_chunks(all))
            .sum();
        self.reap();
        evicted
    }

    /// Saves every loaded world.
    pub fn save_all(&mut self) -> SaveSummary {
        let mut summary = SaveSummary::default();
        for world in self.worlds.values_mut() {
            summary.absorb(world.save());
        }

        if summary.has_failures() {
            warn!(
                "Save incomplete: {} chunks failed, {} props failed",
                summary.chunks_failed, summary.props_failed
            );
        } else if summary.wrote_anything() {
            info!(
                "Saved {} chunks and {} props files",
                summary.chunks_written, summary.props_written
            );
        }
        summary
    }

    /// Serves chunk `(cx, cy)` of world `name` to `responder`.
    ///
    /// Only loaded worlds are served; anything else answers not-found and
    /// touches nothing on disk. Returns true if the responder was answered
    /// before returning.
    pub fn request_chunk(
        &mut self,
        name: &str,
        cx: i32,
        cy: i32,
        responder: Box<dyn ChunkResponder>,
    ) -> bool {
        let world = if Self::verify_world_name(name) {
            self.worlds
                .get_mut(name)
                .ok_or_else(|| WorldError::NotLoaded(name.to_string()))
        } else {
            Err(WorldError::InvalidWorldName(name.to_string()))
        };

        match world {
            Ok(world) => world.send_chunk(ChunkCoord::new(cx, cy), responder),
            Err(e) => {
                debug!("Chunk request rejected: {e}");
                responder.respond(ChunkResponse::NotFound);
                true
            },
        }
    }

    /// Saves and unloads every world, then stops the render pool.
    pub fn shutdown(&mut self) -> SaveSummary {
        let summary = self.save_all();
        self.worlds.clear();
        self.pool.shutdown();
        info!("World manager shut down");
        summary
    }
}

impl std::fmt::Debug for WorldManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldManager")
            .field("worlds", &self.worlds.keys().collect::<Vec<_>>())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::Player;
    use crate::protocol::WorldUpdate;
    use crate::render::ChunkRequest;
    use mural_common::{MuralError, PlayerId, Rgb};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct TestPlayer {
        id: PlayerId,
        inbox: Mutex<Vec<Arc<[u8]>>>,
        explode: bool,
    }

    impl Player for TestPlayer {
        fn id(&self) -> PlayerId {
            self.id
        }

        fn position(&self) -> (i32, i32) {
            assert!(!self.explode, "position lookup failed");
            (0, 0)
        }

        fn can_modify_world(&self) -> bool {
            true
        }

        fn send(&self, message: &Arc<[u8]>) {
            self.inbox.lock().expect("lock").push(Arc::clone(message));
        }
    }

    fn manager(dir: &TempDir) -> WorldManager {
        WorldManager::new(ManagerConfig {
            worlds_dir: dir.path().to_path_buf(),
            render_threads: 1,
            ..ManagerConfig::default()
        })
    }

    fn join(manager: &mut WorldManager, name: &str, explode: bool) -> Arc<TestPlayer> {
        let world = manager.get_or_load_world(name).expect("world");
        let player = Arc::new(TestPlayer {
            id: world.admit_player().id,
            inbox: Mutex::new(Vec::new()),
            explode,
        });
        world.player_joined(player.clone());
        player
    }

    #[test]
    fn test_verify_world_name() {
        assert!(WorldManager::verify_world_name("main"));
        assert!(WorldManager::verify_world_name("a.b_c9"));
        assert!(WorldManager::verify_world_name(&"x".repeat(24)));
        assert!(!WorldManager::verify_world_name(""));
        assert!(!WorldManager::verify_world_name(&"x".repeat(25)));
        assert!(!WorldManager::verify_world_name("Main"));
        assert!(!WorldManager::verify_world_name("../etc"));
        assert!(!WorldManager::verify_world_name("a b"));
    }

    #[test]
    fn test_invalid_name_is_error() {
        let dir = TempDir::new().expect("temp dir");
        let mut manager = manager(&dir);
        assert!(matches!(
            manager.get_or_load_world("NOPE"),
            Err(MuralError::World(WorldError::InvalidWorldName(_)))
        ));
        assert_eq!(manager.loaded_worlds(), 0);
        assert!(!manager.set_default_world("bad name"));
        assert!(manager.set_default_world("lobby"));
        assert_eq!(manager.default_world(), "lobby");
    }

    #[test]
    fn test_world_unloads_after_last_player_leaves() {
        let dir = TempDir::new().expect("temp dir");
        let mut manager = manager(&dir);
        let player = join(&mut manager, "main", false);
        let world = manager.world_mut("main").expect("loaded");
        assert!(world.paint(player.as_ref(), 3, 3, Rgb::BLACK));
        assert_eq!(manager.player_count(), 1);

        manager.tick();
        assert!(manager.is_loaded("main"));

        manager
            .world_mut("main")
            .expect("loaded")
            .player_left(player.id());
        manager.tick();
        assert!(!manager.is_loaded("main"));
        assert!(dir.path().join("main").join("r.0.0.png").exists());

        // Reloading brings the pixel back.
        let world = manager.get_or_load_world("main").expect("world");
        assert_eq!(world.pixel(3, 3), Ok(Rgb::BLACK));
    }

    #[test]
    fn test_sweep_reaps_idle_world() {
        let dir = TempDir::new().expect("temp dir");
        let mut manager = manager(&dir);
        manager
            .get_or_load_world("idle")
            .expect("world")
            .get_or_load_chunk(ChunkCoord::new(0, 0))
            .expect("chunk");

        assert_eq!(manager.sweep(), 0);
        assert!(manager.is_loaded("idle"));
        assert_eq!(manager.unload_old_chunks(true), 1);
        assert!(!manager.is_loaded("idle"));
    }

    #[test]
    fn test_request_chunk_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let mut manager = manager(&dir);

        let (responder, pending) = ChunkRequest::new();
        assert!(manager.request_chunk("Bad!", 0, 0, Box::new(responder)));
        assert_eq!(pending.try_recv(), Some(ChunkResponse::NotFound));

        let (responder, pending) = ChunkRequest::new();
        assert!(manager.request_chunk("main", 0, 0, Box::new(responder)));
        assert_eq!(pending.try_recv(), Some(ChunkResponse::NotFound));
        assert!(!manager.is_loaded("main"));
        assert!(!dir.path().join("main").exists());

        manager.get_or_load_world("main").expect("world");
        let (responder, pending) = ChunkRequest::new();
        assert!(!manager.request_chunk("main", 0, 0, Box::new(responder)));

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut response = None;
        while response.is_none() && Instant::now() < deadline {
            manager.tick();
            response = pending.try_recv();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(matches!(response, Some(ChunkResponse::Image(_))));
    }

    #[test]
    fn test_panicking_world_does_not_stop_tick() {
        let dir = TempDir::new().expect("temp dir");
        let mut manager = manager(&dir);
        let _bad = join(&mut manager, "broken", true);
        let good = join(&mut manager, "fine", false);

        manager.tick();
        let inbox = good.inbox.lock().expect("lock").clone();
        assert_eq!(inbox.len(), 1);
        let update = WorldUpdate::decode(&inbox[0]).expect("decode");
        assert_eq!(update.players[0].id, good.id());
        assert!(manager.is_loaded("broken"));
    }

    #[test]
    fn test_save_all_and_shutdown() {
        let dir = TempDir::new().expect("temp dir");
        {
            let mut manager = manager(&dir);
            let a = join(&mut manager, "a", false);
            let b = join(&mut manager, "b", false);
            manager
                .world_mut("a")
                .expect("loaded")
                .paint(a.as_ref(), 0, 0, Rgb::BLACK);
            manager
                .world_mut("b")
                .expect("loaded")
                .paint(b.as_ref(), 0, 0, Rgb::BLACK);

            let summary = manager.save_all();
            assert_eq!(summary.chunks_written, 2);
            assert!(!summary.has_failures());

            manager
                .world_mut("a")
                .expect("loaded")
                .paint(a.as_ref(), 1, 0, Rgb::BLACK);
            assert_eq!(manager.shutdown().chunks_written, 1);
            assert_eq!(manager.loaded_worlds(), 0);
        }

        let mut manager = manager(&dir);
        let world = manager.get_or_load_world("a").expect("world");
        assert_eq!(world.pixel(1, 0), Ok(Rgb::BLACK));
    }

    #[test]
    fn test_tps_starts_at_twenty() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        assert!((manager.tps() - 20.0).abs() < 1e-9);
    }
}
