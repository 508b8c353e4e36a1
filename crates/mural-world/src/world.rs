//! A single canvas world: chunks, players, batched deltas, chunk serving.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mural_common::{
    ChunkCoord, IdAllocator, MuralResult, PlayerId, Rgb, WorldError, WorldResult,
};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkGeometry, DEFAULT_IDLE_THRESHOLD};
use crate::player::{JoinTicket, Player};
use crate::props::WorldProps;
use crate::protection::{PROTECTED, UNPROTECTED};
use crate::protocol::{FlushLimits, PixelUpdate, PlayerPosition, ProtectionUpdate, WorldUpdate};
use crate::render::{ChunkResponder, ChunkResponse, RenderDone, RenderJob, RenderSubmitter};
use crate::store::ChunkStore;

/// Default soft cap on resident chunks per world.
pub const DEFAULT_MAX_RESIDENT_CHUNKS: usize = 64;

/// Spawn point handed to joining players.
pub const SPAWN_POINT: (i32, i32) = (0, 0);

/// Runtime tuning shared by every world of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldSettings {
    /// Idle time after which an unpinned chunk is evicted by a sweep
    pub idle_threshold: Duration,
    /// Resident chunk count that triggers a forced eviction on load
    pub max_resident_chunks: usize,
    /// Per-flush caps for each update section
    pub limits: FlushLimits,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            max_resident_chunks: DEFAULT_MAX_RESIDENT_CHUNKS,
            limits: FlushLimits::default(),
        }
    }
}

/// Outcome of a save pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Chunks written or removed
    pub chunks_written: usize,
    /// Chunks that could not be persisted
    pub chunks_failed: usize,
    /// Property files written
    pub props_written: usize,
    /// Property files that could not be written
    pub props_failed: usize,
}

impl SaveSummary {
    /// Whether any change could not be persisted.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.chunks_failed > 0 || self.props_failed > 0
    }

    /// Whether anything was written.
    #[must_use]
    pub fn wrote_anything(&self) -> bool {
        self.chunks_written > 0 || self.props_written > 0
    }

    /// Adds `other` into `self`.
    pub fn absorb(&mut self, other: Self) {
        self.chunks_written += other.chunks_written;
        self.chunks_failed += other.chunks_failed;
        self.props_written += other.props_written;
        self.props_failed += other.props_failed;
    }
}

/// One named canvas.
///
/// Every method runs on the simulation thread. Rendering is the only work
/// handed elsewhere, and its results come back through [`World::poll_renders`].
pub struct World {
    /// World name, also the directory name
    name: String,
    /// Persistent properties
    props: WorldProps,
    /// Chunk geometry fixed at open
    geometry: ChunkGeometry,
    /// Chunk file access
    store: ChunkStore,
    /// Tuning
    settings: WorldSettings,
    /// Resident chunks by packed coordinate
    chunks: AHashMap<u64, Chunk>,
    /// Joined players
    players: BTreeMap<PlayerId, Arc<dyn Player>>,
    /// Player id allocation
    ids: IdAllocator,
    /// Players whose position must be broadcast
    player_updates: BTreeSet<PlayerId>,
    /// Painted pixels awaiting broadcast
    pixel_updates: VecDeque<PixelUpdate>,
    /// Departed players awaiting broadcast
    players_left: VecDeque<PlayerId>,
    /// Whether the next flush has anything to send
    updates_pending: bool,
    /// Requesters waiting on an outstanding render, by packed coordinate
    in_flight: AHashMap<u64, Vec<Box<dyn ChunkResponder>>>,
    /// Render job queue
    renderer: RenderSubmitter,
    /// Completion channel handed to render jobs
    render_tx: Sender<RenderDone>,
    /// Completion channel drained each tick
    render_rx: Receiver<RenderDone>,
    /// Set when the world found itself idle and empty
    unload_requested: bool,
}

impl World {
    /// Opens `name` under `worlds_dir`, creating the directory if needed.
    pub fn open(
        name: &str,
        worlds_dir: &Path,
        settings: WorldSettings,
        renderer: RenderSubmitter,
    ) -> MuralResult<Self> {
        let dir = worlds_dir.join(name);
        fs::create_dir_all(&dir)?;

        let props = WorldProps::load(&dir);
        let geometry = props.geometry();
        let store = ChunkStore::new(&dir, geometry);
        let (render_tx, render_rx) = unbounded();

        info!("World loaded: {name}");
        Ok(Self {
            name: name.to_string(),
            props,
            geometry,
            store,
            settings: WorldSettings {
                limits: settings.limits.clamped(),
                ..settings
            },
            chunks: AHashMap::new(),
            players: BTreeMap::new(),
            ids: IdAllocator::new(),
            player_updates: BTreeSet::new(),
            pixel_updates: VecDeque::new(),
            players_left: VecDeque::new(),
            updates_pending: false,
            in_flight: AHashMap::new(),
            renderer,
            render_tx,
            render_rx,
            unload_requested: false,
        })
    }

    /// World name, also its directory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// World directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// Chunk geometry fixed when the world was opened.
    #[must_use]
    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    /// Runtime tuning.
    #[must_use]
    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    /// Persistent properties.
    #[must_use]
    pub fn props(&self) -> &WorldProps {
        &self.props
    }

    /// Mutable properties; changes are written on the next save.
    pub fn props_mut(&mut self) -> &mut WorldProps {
        &mut self.props
    }

    /// Message of the day, if set.
    #[must_use]
    pub fn motd(&self) -> Option<&str> {
        self.props.motd()
    }

    /// Whether joining requires a password.
    #[must_use]
    pub fn has_password(&self) -> bool {
        self.props.has_password()
    }

    /// Paint rate handed to joining players.
    #[must_use]
    pub fn paint_rate(&self) -> u32 {
        self.props.paint_rate()
    }

    /// Colour of unpainted pixels.
    #[must_use]
    pub fn background(&self) -> Rgb {
        self.props.background()
    }

    // Chunks

    fn check_border(&self, coord: ChunkCoord) -> WorldResult<()> {
        if coord.within_border(self.geometry.border()) {
            Ok(())
        } else {
            Err(WorldError::OutOfBorder {
                x: coord.x,
                y: coord.y,
            })
        }
    }

    /// Returns the chunk at `coord`, loading it if needed.
    ///
    /// Loading past the resident cap first force-evicts every other
    /// unpinned chunk; the chunk being loaded is never a candidate.
    pub fn get_or_load_chunk(&mut self, coord: ChunkCoord) -> WorldResult<&mut Chunk> {
        self.check_border(coord)?;
        let key = coord.key();

        if !self.chunks.contains_key(&key)
            && self.chunks.len() >= self.settings.max_resident_chunks
        {
            let evicted = self.evict_chunks(true);
            debug!("Resident cap reached in {}, evicted {evicted} chunks", self.name);
        }

        let geometry = self.geometry;
        let background = self.props.background();
        let store = &self.store;
        Ok(self
            .chunks
            .entry(key)
            .or_insert_with(|| Chunk::load(coord, geometry, background, store)))
    }

    /// Resident chunk at `coord`, if loaded.
    #[must_use]
    pub fn chunk(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord.key())
    }

    /// Number of resident chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Colour of the pixel at `(x, y)`.
    pub fn pixel(&mut self, x: i32, y: i32) -> WorldResult<Rgb> {
        let coord = ChunkCoord::from_pixel(x, y, self.geometry.pixel_shift());
        Ok(self.get_or_load_chunk(coord)?.pixel(x, y))
    }

    /// Paints one pixel on behalf of `player`.
    ///
    /// Returns false if the player may not paint there. Painting the colour
    /// a pixel already has succeeds without queueing an update.
    pub fn paint(&mut self, player: &dyn Player, x: i32, y: i32, color: Rgb) -> bool {
        if !player.can_modify_world() {
            return false;
        }

        let coord = ChunkCoord::from_pixel(x, y, self.geometry.pixel_shift());
        let area_shift = self.geometry.area_shift();
        let Ok(chunk) = self.get_or_load_chunk(coord) else {
            return false;
        };
        if chunk.protection_gid(x >> area_shift, y >> area_shift) != UNPROTECTED {
            return false;
        }

        if chunk.set_pixel(x, y, color) {
            self.pixel_updates.push_back(PixelUpdate {
                placer: player.id(),
                x,
                y,
                color,
            });
            self.updates_pending = true;
        }
        true
    }

    /// Group id of protection cell `(cell_x, cell_y)`.
    pub fn area_protection(&mut self, cell_x: i32, cell_y: i32) -> WorldResult<u32> {
        let coord = ChunkCoord::from_cell(cell_x, cell_y, self.geometry.cell_shift());
        Ok(self.get_or_load_chunk(coord)?.protection_gid(cell_x, cell_y))
    }

    /// Protects or clears one protection cell and tells joined players.
    pub fn set_area_protection(
        &mut self,
        cell_x: i32,
        cell_y: i32,
        enabled: bool,
    ) -> WorldResult<()> {
        let coord = ChunkCoord::from_cell(cell_x, cell_y, self.geometry.cell_shift());
        let gid = if enabled { PROTECTED } else { UNPROTECTED };
        self.get_or_load_chunk(coord)?
            .set_protection_gid(cell_x, cell_y, gid);

        if !self.players.is_empty() {
            let update = ProtectionUpdate {
                cell_x,
                cell_y,
                gid,
            };
            self.broadcast(&Arc::from(update.encode().as_slice()));
        }
        Ok(())
    }

    fn evict_chunks(&mut self, force: bool) -> usize {
        let threshold = self.settings.idle_threshold;
        let candidates: Vec<u64> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.should_unload(force, threshold))
            .map(|(key, _)| *key)
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let Some(chunk) = self.chunks.get_mut(&key) else {
                continue;
            };
            match chunk.release(&self.store) {
                Ok(_) => {
                    debug!("Unloaded chunk {} of {}", chunk.coord(), self.name);
                    self.chunks.remove(&key);
                    evicted += 1;
                },
                Err(e) => {
                    warn!(
                        "Keeping chunk {} of {} resident, save failed: {e}",
                        chunk.coord(),
                        self.name
                    );
                },
            }
        }
        evicted
    }

    /// Evicts every unpinned chunk idle past the threshold, or every
    /// unpinned chunk if `force`. Returns how many were evicted.
    pub fn unload_old_chunks(&mut self, force: bool) -> usize {
        let evicted = self.evict_chunks(force);
        if self.is_unload_eligible() {
            self.request_unload();
        }
        evicted
    }

    // Players

    /// Allocates an id for a joining player.
    ///
    /// The id is freed again by [`World::player_left`].
    pub fn admit_player(&mut self) -> JoinTicket {
        JoinTicket {
            id: self.ids.acquire(),
            spawn: SPAWN_POINT,
            paint_rate: self.props.paint_rate(),
            can_modify: !self.props.has_password(),
        }
    }

    /// Adds `player` to the world and schedules its position broadcast.
    pub fn player_joined(&mut self, player: Arc<dyn Player>) {
        let id = player.id();
        // A reused id must not be announced as gone in the same update.
        self.players_left.retain(|&left| left != id);
        self.players.insert(id, player);
        self.unload_requested = false;
        self.player_updated(id);
    }

    /// Schedules a position broadcast for a joined player.
    pub fn player_updated(&mut self, id: PlayerId) {
        if self.players.contains_key(&id) {
            self.player_updates.insert(id);
            self.updates_pending = true;
        }
    }

    /// Removes a player and frees its id.
    ///
    /// When the last player leaves, every unpinned chunk is unloaded.
    /// Returns false if the player had not joined.
    pub fn player_left(&mut self, id: PlayerId) -> bool {
        self.ids.release(id);
        if self.players.remove(&id).is_none() {
            return false;
        }

        self.player_updates.remove(&id);
        self.players_left.push_back(id);
        self.updates_pending = true;

        if self.players.is_empty() {
            self.try_unload();
        }
        true
    }

    /// Number of joined players.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Sends `message` to every joined player.
    pub fn broadcast(&self, message: &Arc<[u8]>) {
        for player in self.players.values() {
            player.send(message);
        }
    }

    /// Whether the next flush has anything to send.
    #[must_use]
    pub fn has_pending_updates(&self) -> bool {
        self.updates_pending
    }

    /// Builds and broadcasts this tick's update message.
    ///
    /// Each section takes at most its cap; anything left over stays queued
    /// for the next tick. Returns the message, or `None` if nothing was
    /// pending.
    pub fn flush_updates(&mut self) -> Option<Arc<[u8]>> {
        if !self.updates_pending {
            return None;
        }
        self.updates_pending = false;
        let limits = self.settings.limits;

        let mut update = WorldUpdate::default();
        while update.players.len() < limits.player_updates {
            let Some(id) = self.player_updates.pop_first() else {
                break;
            };
            if let Some(player) = self.players.get(&id) {
                let (x, y) = player.position();
                update.players.push(PlayerPosition { id, x, y });
            }
        }

        let count = self.pixel_updates.len().min(limits.pixel_updates);
        update.pixels.extend(self.pixel_updates.drain(..count));

        let count = self.players_left.len().min(limits.player_left);
        update.players_left.extend(self.players_left.drain(..count));

        if !self.player_updates.is_empty()
            || !self.pixel_updates.is_empty()
            || !self.players_left.is_empty()
        {
            self.updates_pending = true;
        }

        let message: Arc<[u8]> = match update.encode() {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                warn!("Dropping update for {}: {e}", self.name);
                return None;
            },
        };
        self.broadcast(&message);
        Some(message)
    }

    // Chunk serving

    /// Serves the image of chunk `coord` to `responder`.
    ///
    /// Returns true if the responder was answered before returning. False
    /// means a render is outstanding and the answer will arrive through
    /// [`World::poll_renders`].
    pub fn send_chunk(&mut self, coord: ChunkCoord, responder: Box<dyn ChunkResponder>) -> bool {
        let key = coord.key();
        let cached = match self.get_or_load_chunk(coord) {
            Ok(chunk) => chunk.cached_image(),
            Err(_) => {
                responder.respond(ChunkResponse::NotFound);
                return true;
            },
        };

        if let Some(image) = cached {
            responder.respond(ChunkResponse::Image(image));
            return true;
        }

        if let Some(waiting) = self.in_flight.get_mut(&key) {
            waiting.push(responder);
            return false;
        }

        let Some(chunk) = self.chunks.get_mut(&key) else {
            responder.respond(ChunkResponse::Failed);
            return true;
        };
        let snapshot = chunk.snapshot();
        chunk.set_pinned(true);
        let job = RenderJob {
            snapshot,
            reply: self.render_tx.clone(),
        };

        if let Err(e) = self.renderer.submit(job) {
            warn!("Cannot render chunk {coord} of {}: {e}", self.name);
            if let Some(chunk) = self.chunks.get_mut(&key) {
                chunk.set_pinned(false);
            }
            responder.respond(ChunkResponse::Failed);
            return true;
        }

        self.in_flight.insert(key, vec![responder]);
        false
    }

    /// Number of chunks with an outstanding render.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Applies every finished render and answers its requesters.
    ///
    /// Returns the number of renders applied.
    pub fn poll_renders(&mut self) -> usize {
        let finished: Vec<RenderDone> = self.render_rx.try_iter().collect();
        let count = finished.len();
        for done in finished {
            self.complete_render(done);
        }

        if count > 0 && self.players.is_empty() {
            self.try_unload();
        }
        count
    }

    fn complete_render(&mut self, done: RenderDone) {
        let key = done.coord.key();
        let waiting = self.in_flight.remove(&key).unwrap_or_default();

        let response = match &done.result {
            Ok(image) => ChunkResponse::Image(Arc::clone(image)),
            Err(e) => {
                warn!("Render of chunk {} in {} failed: {e}", done.coord, self.name);
                ChunkResponse::Failed
            },
        };

        if let Some(chunk) = self.chunks.get_mut(&key) {
            if let Ok(image) = done.result {
                chunk.apply_render(done.revision, image);
            }
            chunk.set_pinned(false);
        }

        for responder in waiting {
            if responder.is_cancelled() {
                debug!("Chunk {} requester went away, not sending", done.coord);
                continue;
            }
            responder.respond(response.clone());
        }
    }

    // Lifecycle

    /// Whether the world has neither players nor resident chunks.
    #[must_use]
    pub fn is_unload_eligible(&self) -> bool {
        self.players.is_empty() && self.chunks.is_empty()
    }

    /// Whether the world asked to be unloaded.
    #[must_use]
    pub fn unload_requested(&self) -> bool {
        self.unload_requested
    }

    /// Returns and clears the unload request.
    pub fn take_unload_request(&mut self) -> bool {
        std::mem::take(&mut self.unload_requested)
    }

    fn request_unload(&mut self) {
        if !self.unload_requested {
            debug!("World {} is empty, requesting unload", self.name);
            self.unload_requested = true;
        }
    }

    fn try_unload(&mut self) {
        if !self.players.is_empty() {
            return;
        }
        self.evict_chunks(true);
        if self.chunks.is_empty() {
            self.request_unload();
        }
    }

    /// Saves every dirty chunk and the properties file.
    pub fn save(&mut self) -> SaveSummary {
        let mut summary = SaveSummary::default();
        for chunk in self.chunks.values_mut() {
            match chunk.save(&self.store) {
                Ok(true) => summary.chunks_written += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!("Failed to save chunk {} of {}: {e}", chunk.coord(), self.name);
                    summary.chunks_failed += 1;
                },
            }
        }

        match self.props.save() {
            Ok(true) => summary.props_written += 1,
            Ok(false) => {},
            Err(e) => {
                warn!("Failed to save props of {}: {e}", self.name);
                summary.props_failed += 1;
            },
        }
        summary
    }
}

impl Drop for World {
    fn drop(&mut self) {
        for (_, waiting) in self.in_flight.drain() {
            for responder in waiting {
                if !responder.is_cancelled() {
                    responder.respond(ChunkResponse::Failed);
                }
            }
        }

        for (_, mut chunk) in self.chunks.drain() {
            if let Err(e) = chunk.release(&self.store) {
                warn!("Lost changes to chunk {} of {}: {e}", chunk.coord(), self.name);
            }
        }
        if let Err(e) = self.props.save() {
            warn!("Failed to save props of {}: {e}", self.name);
        }
        info!("World unloaded: {}", self.name);
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("name", &self.name)
            .field("chunks", &self.chunks.len())
            .field("players", &self.players.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTECTION_UPDATE;
    use crate::render::{
        ChunkEncoder, ChunkRequest, PendingChunk, PixelSnapshot, PngChunkEncoder, RenderError,
        RenderPool,
    };
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    const RED: Rgb = Rgb::new(255, 0, 0);

    struct TestPlayer {
        id: PlayerId,
        position: Mutex<(i32, i32)>,
        can_modify: bool,
        inbox: Mutex<Vec<Arc<[u8]>>>,
    }

    impl TestPlayer {
        fn new(id: PlayerId) -> Arc<Self> {
            Self::with_permission(id, true)
        }

        fn with_permission(id: PlayerId, can_modify: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                position: Mutex::new((0, 0)),
                can_modify,
                inbox: Mutex::new(Vec::new()),
            })
        }

        fn move_to(&self, x: i32, y: i32) {
            *self.position.lock().expect("lock") = (x, y);
        }

        fn received(&self) -> Vec<Arc<[u8]>> {
            self.inbox.lock().expect("lock").clone()
        }
    }

    impl Player for TestPlayer {
        fn id(&self) -> PlayerId {
            self.id
        }

        fn position(&self) -> (i32, i32) {
            *self.position.lock().expect("lock")
        }

        fn can_modify_world(&self) -> bool {
            self.can_modify
        }

        fn send(&self, message: &Arc<[u8]>) {
            self.inbox.lock().expect("lock").push(Arc::clone(message));
        }
    }

    struct CountingEncoder {
        calls: AtomicUsize,
    }

    impl ChunkEncoder for CountingEncoder {
        fn encode(&self, snapshot: &PixelSnapshot) -> Result<Vec<u8>, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PngChunkEncoder.encode(snapshot)
        }
    }

    struct FailingEncoder;

    impl ChunkEncoder for FailingEncoder {
        fn encode(&self, _snapshot: &PixelSnapshot) -> Result<Vec<u8>, RenderError> {
            Err(RenderError::Encode("disk full".to_string()))
        }
    }

    fn open_with(
        dir: &TempDir,
        settings: WorldSettings,
        encoder: Arc<dyn ChunkEncoder>,
    ) -> (World, RenderPool) {
        let pool = RenderPool::new(2, encoder);
        let world = World::open("test", dir.path(), settings, pool.submitter()).expect("open");
        (world, pool)
    }

    fn open(dir: &TempDir) -> (World, RenderPool) {
        open_with(dir, WorldSettings::default(), Arc::new(PngChunkEncoder))
    }

    fn join(world: &mut World) -> Arc<TestPlayer> {
        let ticket = world.admit_player();
        let player = TestPlayer::new(ticket.id);
        world.player_joined(player.clone());
        player
    }

    fn wait_for_renders(world: &mut World) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while world.in_flight_count() > 0 && Instant::now() < deadline {
            world.poll_renders();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn request(world: &mut World, coord: ChunkCoord) -> (bool, PendingChunk) {
        let (responder, pending) = ChunkRequest::new();
        (world.send_chunk(coord, Box::new(responder)), pending)
    }

    #[test]
    fn test_paint_queues_pixel_update() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        world.flush_updates();

        assert!(world.paint(player.as_ref(), 10, -3, RED));
        assert_eq!(world.pixel(10, -3), Ok(RED));

        let message = world.flush_updates().expect("update");
        let update = WorldUpdate::decode(&message).expect("decode");
        assert_eq!(
            update.pixels,
            vec![PixelUpdate {
                placer: player.id(),
                x: 10,
                y: -3,
                color: RED
            }]
        );
        assert_eq!(player.received().last(), Some(&message));
    }

    #[test]
    fn test_noop_paint_is_allowed_but_silent() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        world.flush_updates();

        assert!(world.paint(player.as_ref(), 0, 0, RED));
        assert!(world.paint(player.as_ref(), 0, 0, RED));
        let update = WorldUpdate::decode(&world.flush_updates().expect("update")).expect("decode");
        assert_eq!(update.pixels.len(), 1);

        assert!(world.paint(player.as_ref(), 0, 0, RED));
        assert!(world.flush_updates().is_none());
    }

    #[test]
    fn test_paint_requires_permission() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let guest = TestPlayer::with_permission(world.admit_player().id, false);
        world.player_joined(guest.clone());

        assert!(!world.paint(guest.as_ref(), 1, 1, RED));
        assert_eq!(world.pixel(1, 1), Ok(Rgb::WHITE));
    }

    #[test]
    fn test_protected_cell_blocks_paint() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        world.flush_updates();

        world
            .get_or_load_chunk(ChunkCoord::new(0, 0))
            .expect("chunk")
            .set_protection_gid(1, 1, 7);

        assert!(!world.paint(player.as_ref(), 16, 16, RED));
        assert_eq!(world.pixel(16, 16), Ok(Rgb::WHITE));
        assert!(world.flush_updates().is_none());

        // Neighbouring cell is open.
        assert!(world.paint(player.as_ref(), 15, 15, RED));
    }

    #[test]
    fn test_set_area_protection_broadcasts() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);

        world.set_area_protection(-1, 40, true).expect("protect");
        assert_eq!(world.area_protection(-1, 40), Ok(PROTECTED));

        let message = player.received().last().cloned().expect("message");
        let update = ProtectionUpdate::decode(&message).expect("decode");
        assert_eq!(message[0], PROTECTION_UPDATE);
        assert_eq!(
            update,
            ProtectionUpdate {
                cell_x: -1,
                cell_y: 40,
                gid: PROTECTED
            }
        );

        assert!(!world.paint(player.as_ref(), -1, 40 * 16 + 3, RED));
        world.set_area_protection(-1, 40, false).expect("clear");
        assert!(world.paint(player.as_ref(), -1, 40 * 16 + 3, RED));
    }

    #[test]
    fn test_out_of_border_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let border = world.geometry().border();

        assert!(matches!(
            world.get_or_load_chunk(ChunkCoord::new(border + 1, 0)),
            Err(WorldError::OutOfBorder { .. })
        ));
        assert!(world.get_or_load_chunk(ChunkCoord::new(!border, border)).is_ok());
        assert!(world.set_area_protection(i32::MAX, 0, true).is_err());

        let (answered, pending) = request(&mut world, ChunkCoord::new(0, border + 1));
        assert!(answered);
        assert_eq!(pending.try_recv(), Some(ChunkResponse::NotFound));
    }

    #[test]
    fn test_flush_respects_caps_and_rearms() {
        let dir = TempDir::new().expect("temp dir");
        let settings = WorldSettings {
            limits: FlushLimits {
                player_updates: 1,
                pixel_updates: 2,
                player_left: 1,
            },
            ..WorldSettings::default()
        };
        let (mut world, _pool) = open_with(&dir, settings, Arc::new(PngChunkEncoder));
        let a = join(&mut world);
        let b = join(&mut world);

        for x in 0..5 {
            world.paint(a.as_ref(), x, 0, RED);
        }

        // One tick carries exactly the cap and leaves the rest queued.
        let first = WorldUpdate::decode(&world.flush_updates().expect("update")).expect("decode");
        assert_eq!(first.pixels.len(), 2);
        assert_eq!(first.players.len(), 1);
        assert!(world.has_pending_updates());

        let mut pixels = first.pixels.len();
        let mut players: BTreeSet<PlayerId> = first.players.iter().map(|p| p.id).collect();
        let mut flushes = 1;
        while let Some(message) = world.flush_updates() {
            let update = WorldUpdate::decode(&message).expect("decode");
            assert!(update.pixels.len() <= 2);
            assert!(update.players.len() <= 1);
            pixels += update.pixels.len();
            players.extend(update.players.iter().map(|p| p.id));
            flushes += 1;
        }
        assert_eq!(pixels, 5);
        assert_eq!(players, BTreeSet::from([a.id(), b.id()]));
        assert_eq!(flushes, 3);
        assert!(!world.has_pending_updates());
    }

    #[test]
    fn test_chunk_size_change_keeps_old_files() {
        let dir = TempDir::new().expect("temp dir");
        let path = {
            let (mut world, _pool) = open(&dir);
            let player = join(&mut world);
            assert!(world.paint(player.as_ref(), 5, 5, RED));
            assert!(!world.save().has_failures());
            assert!(world.props_mut().set_chunk_size(256));
            world.dir().join("r.0.0.png")
        };
        assert!(path.exists());

        let (mut world, _pool) = open(&dir);
        assert_eq!(world.geometry().size(), 256);
        world.get_or_load_chunk(ChunkCoord::new(0, 0)).expect("chunk");
        world.unload_old_chunks(true);
        assert_eq!(world.chunk_count(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_player_lifecycle_messages() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let a = join(&mut world);
        let b = join(&mut world);
        assert_eq!(a.id(), PlayerId::new(1));
        assert_eq!(b.id(), PlayerId::new(2));
        world.flush_updates();

        a.move_to(30, -40);
        world.player_updated(a.id());
        let update = WorldUpdate::decode(&world.flush_updates().expect("update")).expect("decode");
        assert_eq!(
            update.players,
            vec![PlayerPosition {
                id: a.id(),
                x: 30,
                y: -40
            }]
        );

        assert!(world.player_left(a.id()));
        assert!(!world.player_left(a.id()));
        let update = WorldUpdate::decode(&world.flush_updates().expect("update")).expect("decode");
        assert_eq!(update.players_left, vec![a.id()]);

        // Freed id is handed out again.
        assert_eq!(world.admit_player().id, a.id());
    }

    #[test]
    fn test_join_ticket_reflects_props() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        world.props_mut().set_paint_rate(10);
        world.props_mut().set_password(Some("pw".to_string()));

        let ticket = world.admit_player();
        assert_eq!(ticket.spawn, (0, 0));
        assert_eq!(ticket.paint_rate, 10);
        assert!(!ticket.can_modify);
    }

    #[test]
    fn test_last_player_leaving_unloads() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        world.paint(player.as_ref(), 600, 600, RED);
        assert_eq!(world.chunk_count(), 1);

        world.player_left(player.id());
        assert_eq!(world.chunk_count(), 0);
        assert!(world.is_unload_eligible());
        assert!(world.unload_requested());
        assert!(dir.path().join("test").join("r.1.1.png").exists());
    }

    #[test]
    fn test_resident_cap_keeps_new_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let settings = WorldSettings {
            max_resident_chunks: 4,
            ..WorldSettings::default()
        };
        let (mut world, _pool) = open_with(&dir, settings, Arc::new(PngChunkEncoder));

        for x in 0..4 {
            world.get_or_load_chunk(ChunkCoord::new(x, 0)).expect("chunk");
        }
        assert_eq!(world.chunk_count(), 4);

        world.get_or_load_chunk(ChunkCoord::new(9, 9)).expect("chunk");
        assert!(world.chunk_count() <= 4);
        assert!(world.chunk(ChunkCoord::new(9, 9)).is_some());
    }

    #[test]
    fn test_idle_sweep_respects_threshold() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        world.get_or_load_chunk(ChunkCoord::new(0, 0)).expect("chunk");

        assert_eq!(world.unload_old_chunks(false), 0);
        assert_eq!(world.chunk_count(), 1);
        assert_eq!(world.unload_old_chunks(true), 1);
        assert!(world.unload_requested());
    }

    #[test]
    fn test_pinned_chunk_survives_forced_unload() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let coord = ChunkCoord::new(2, 3);

        let (answered, pending) = request(&mut world, coord);
        assert!(!answered);
        assert!(world.chunk(coord).expect("resident").is_pinned());

        world.unload_old_chunks(true);
        assert!(world.chunk(coord).is_some());
        assert!(!world.unload_requested());

        wait_for_renders(&mut world);
        assert!(matches!(pending.try_recv(), Some(ChunkResponse::Image(_))));
        // Render done with nobody joined: the chunk goes and the world asks to unload.
        assert!(world.chunk(coord).is_none());
        assert!(world.unload_requested());
    }

    #[test]
    fn test_concurrent_requests_share_one_encode() {
        let dir = TempDir::new().expect("temp dir");
        let encoder = Arc::new(CountingEncoder {
            calls: AtomicUsize::new(0),
        });
        let (mut world, _pool) = open_with(&dir, WorldSettings::default(), encoder.clone());
        let _player = join(&mut world);
        let coord = ChunkCoord::new(0, 0);

        let (first_answered, first) = request(&mut world, coord);
        let (second_answered, second) = request(&mut world, coord);
        assert!(!first_answered);
        assert!(!second_answered);
        assert_eq!(world.in_flight_count(), 1);

        wait_for_renders(&mut world);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);

        let (Some(ChunkResponse::Image(a)), Some(ChunkResponse::Image(b))) =
            (first.try_recv(), second.try_recv())
        else {
            panic!("both requesters should get an image");
        };
        assert_eq!(a, b);

        let chunk = world.chunk(coord).expect("resident");
        assert!(!chunk.is_pinned());
        assert!(!chunk.is_image_cache_outdated());

        // Fresh cache: answered immediately, no new encode.
        let (answered, third) = request(&mut world, coord);
        assert!(answered);
        assert_eq!(third.try_recv(), Some(ChunkResponse::Image(a)));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_paint_during_render_leaves_cache_stale() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        let coord = ChunkCoord::new(0, 0);

        let (_, pending) = request(&mut world, coord);
        world.paint(player.as_ref(), 1, 1, RED);
        wait_for_renders(&mut world);

        assert!(matches!(pending.try_recv(), Some(ChunkResponse::Image(_))));
        assert!(world.chunk(coord).expect("resident").is_image_cache_outdated());
        let (answered, _next) = request(&mut world, coord);
        assert!(!answered);
    }

    #[test]
    fn test_render_failure_reaches_every_requester() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) =
            open_with(&dir, WorldSettings::default(), Arc::new(FailingEncoder));
        let _player = join(&mut world);
        let coord = ChunkCoord::new(-1, -1);

        let (_, first) = request(&mut world, coord);
        let (_, second) = request(&mut world, coord);
        wait_for_renders(&mut world);

        assert_eq!(first.try_recv(), Some(ChunkResponse::Failed));
        assert_eq!(second.try_recv(), Some(ChunkResponse::Failed));
        assert!(!world.chunk(coord).expect("resident").is_pinned());
    }

    #[test]
    fn test_cancelled_requester_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let _player = join(&mut world);
        let coord = ChunkCoord::new(0, 0);

        let (_, gone) = request(&mut world, coord);
        let (_, kept) = request(&mut world, coord);
        drop(gone);
        wait_for_renders(&mut world);

        assert!(matches!(kept.try_recv(), Some(ChunkResponse::Image(_))));
        assert_eq!(world.in_flight_count(), 0);
    }

    #[test]
    fn test_shut_down_pool_fails_immediately() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, mut pool) = open(&dir);
        pool.shutdown();
        let coord = ChunkCoord::new(0, 0);

        let (answered, pending) = request(&mut world, coord);
        assert!(answered);
        assert_eq!(pending.try_recv(), Some(ChunkResponse::Failed));
        assert!(!world.chunk(coord).expect("resident").is_pinned());
    }

    #[test]
    fn test_save_summary_counts_writes() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        world.paint(player.as_ref(), 0, 0, RED);
        world.paint(player.as_ref(), 1000, 0, RED);
        world.props_mut().set_motd(Some("welcome".to_string()));

        let summary = world.save();
        assert_eq!(summary.chunks_written, 2);
        assert_eq!(summary.props_written, 1);
        assert!(!summary.has_failures());
        assert!(!world.save().wrote_anything());
    }

    #[test]
    fn test_empty_chunk_file_is_removed() {
        let dir = TempDir::new().expect("temp dir");
        let (mut world, _pool) = open(&dir);
        let player = join(&mut world);
        let file = dir.path().join("test").join("r.0.0.png");

        world.paint(player.as_ref(), 5, 5, RED);
        world.save();
        assert!(file.exists());

        world.paint(player.as_ref(), 5, 5, Rgb::WHITE);
        world.unload_old_chunks(true);
        assert!(!file.exists());
    }

    #[test]
    fn test_drop_persists_chunks() {
        let dir = TempDir::new().expect("temp dir");
        {
            let (mut world, _pool) = open(&dir);
            let player = join(&mut world);
            world.paint(player.as_ref(), -700, 300, RED);
            world.set_area_protection(3, 3, true).expect("protect");
        }

        let (mut world, _pool) = open(&dir);
        assert_eq!(world.pixel(-700, 300), Ok(RED));
        assert_eq!(world.area_protection(3, 3), Ok(PROTECTED));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_protected_pixels_never_change(
            protected in proptest::collection::btree_set((0i32..4, 0i32..4), 0..8),
            paints in proptest::collection::vec((0i32..64, 0i32..64), 1..64),
        ) {
            let dir = TempDir::new().expect("temp dir");
            let (mut world, _pool) = open(&dir);
            let player = join(&mut world);
            for &(cx, cy) in &protected {
                world.set_area_protection(cx, cy, true).expect("protect");
            }

            for (x, y) in paints {
                let allowed = world.paint(player.as_ref(), x, y, RED);
                let in_protected = protected.contains(&(x >> 4, y >> 4));
                prop_assert_eq!(allowed, !in_protected);
                if in_protected {
                    prop_assert_eq!(world.pixel(x, y), Ok(Rgb::WHITE));
                }
            }
        }
    }
}
