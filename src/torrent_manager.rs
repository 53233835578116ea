//! Swarm controller: resolves the torrent, keeps the peer set filled and walks
//! the piece state machine until everything is held, then seeds.

use crate::availability::{AvailabilityTracker, Selection};
use crate::choke::ChokePolicy;
use crate::config::{Config, SwarmConfig};
use crate::data_structures::ID;
use crate::metadata_exchange::MetadataExchange;
use crate::peers::connection::connection_manager::{self, refresh_interest, request_metadata};
use crate::peers::connection::message::Message;
use crate::peers::{Peer, SessionContext, SessionEvent, SessionHandle, Sessions};
use crate::piece_store::{PieceStore, StoreError};
use crate::shutdown;
use crate::status::{RateMeter, SwarmState, TorrentStatus};
use crate::tracker::{self, AnnounceContext, Tracker, TrackerStatus};
use crate::transcoding::magnet::MagnetLink;
use crate::transcoding::metainfo::Torrent;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const EVENT_CHANNEL_BUFFER: usize = 1 << 10;
const TRACKER_PEERS_BUFFER: usize = 1 << 4;
const MANAGER_TICK_MILLIS: u64 = 1000;
const MIN_CHOKE_INTERVAL_MILLIS: u64 = 50;

/// Where the torrent descriptor comes from.
#[derive(Debug, Clone)]
pub enum Source {
    Torrent(Torrent),
    Magnet(MagnetLink),
}

impl Source {
    pub fn from_config(config: &Config) -> Result<Self> {
        match (&config.file, &config.magnet) {
            (Some(file), _) => Ok(Source::Torrent(Torrent::from_file(file)?)),
            (None, Some(magnet)) => Ok(Source::Magnet(magnet.parse()?)),
            (None, None) => Err(anyhow!("either a torrent file or a magnet link is needed")),
        }
    }

    pub fn info_hash(&self) -> ID {
        match self {
            Source::Torrent(torrent) => torrent.info_hash,
            Source::Magnet(magnet) => magnet.info_hash,
        }
    }
}

/// Caller's side of a running torrent.
pub struct TorrentHandle {
    status: watch::Receiver<TorrentStatus>,
    shutdown: shutdown::Sender,
    local_addr: SocketAddr,
}

impl TorrentHandle {
    pub fn status(&self) -> TorrentStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TorrentStatus> {
        self.status.clone()
    }

    /// Address the IPv4 listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves with the first status that satisfies `done`.
    pub async fn wait_for<F>(&mut self, done: F) -> Result<TorrentStatus>
    where
        F: Fn(&TorrentStatus) -> bool,
    {
        loop {
            {
                let status = self.status.borrow_and_update();
                if done(&status) {
                    return Ok(status.clone());
                }
            }

            self.status
                .changed()
                .await
                .map_err(|_| anyhow!("torrent stopped"))?;
        }
    }

    /// Stops every worker and waits until all of them are gone.
    pub async fn shutdown(self) {
        self.shutdown.send().wait().await;
    }
}

pub struct TorrentManager;

impl TorrentManager {
    /// Starts the engine for one torrent. Returns once the listeners are bound.
    #[instrument(skip_all, fields(info_hash = %source.info_hash()))]
    pub async fn start(
        source: Source,
        config: SwarmConfig,
        tracker: Arc<dyn Tracker>,
    ) -> Result<TorrentHandle> {
        let config = Arc::new(config);
        let client_id = ID::generate_peer_id();
        let info_hash = source.info_hash();

        let (metadata, store, availability, trackers, name) = match source {
            Source::Torrent(torrent) => {
                let torrent = Arc::new(torrent);
                let store = PieceStore::new(torrent.clone(), config.block_size, config.request_timeout);

                if config.seed {
                    if let Err(e) = store.load_from_disk(&config.download_dir).await {
                        warn!(%e, "can't seed from disk");
                    }
                }

                let availability = AvailabilityTracker::new(
                    &store
                        .local_bitfield()
                        .ok_or_else(|| anyhow!("piece store is not sized"))?,
                );

                (
                    MetadataExchange::resolved(torrent.clone(), config.metadata_piece_size),
                    store,
                    availability,
                    torrent.announce.clone(),
                    Some(torrent.info.name.clone()),
                )
            }
            Source::Magnet(magnet) => (
                MetadataExchange::pending(
                    magnet.info_hash,
                    magnet.trackers.clone(),
                    config.metadata_piece_size,
                ),
                PieceStore::pending(),
                AvailabilityTracker::pending(),
                magnet.trackers,
                magnet.display_name,
            ),
        };

        let listener_v4 = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let local_addr = listener_v4.local_addr()?;
        let mut listeners = vec![listener_v4];

        if config.listen_v6 {
            match TcpListener::bind((Ipv6Addr::UNSPECIFIED, local_addr.port())).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => debug!(%e, "no IPv6 listener"),
            }
        }

        info!(%local_addr, %client_id, "listening");

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (peers_tx, peers_rx) = mpsc::channel(TRACKER_PEERS_BUFFER);

        let state = if metadata.is_resolved() {
            SwarmState::SelectingPiece
        } else {
            SwarmState::AwaitingMetadata
        };
        let (tracker_status_tx, tracker_status_rx) = watch::channel(TrackerStatus::Pending);
        let (completed_tx, completed_rx) = watch::channel(store.is_complete());

        let ctx = SessionContext {
            client_id,
            info_hash,
            config: config.clone(),
            availability,
            store,
            choke: ChokePolicy::new(config.max_unchoked, config.optimistic_rotation_ticks),
            metadata,
            sessions: Sessions::new(),
            events: events_tx,
            shutdown: shutdown_rx.clone(),
        };

        for listener in listeners {
            tokio::spawn(listen(listener, ctx.clone()));
        }

        tokio::spawn(manage_choking(ctx.clone()));

        tracker::spawn_announcers(
            &trackers,
            AnnounceContext {
                tracker,
                info_hash,
                peer_id: client_id,
                port: local_addr.port(),
                store: ctx.store.clone(),
                peers: peers_tx,
                status: Arc::new(tracker_status_tx),
                completed: completed_rx,
                shutdown: shutdown_rx,
            },
        );

        let mut initial = TorrentStatus::new(&info_hash, name, state);
        initial.tracker = tracker_status_rx.borrow().clone();
        if let Some(progress) = ctx.store.progress() {
            initial.apply_progress(progress);
        }
        let (status_tx, status_rx) = watch::channel(initial);

        let swarm = Swarm {
            candidates: config.bootstrap_peers.iter().copied().map(Peer::new).collect(),
            ctx,
            state,
            active: None,
            events: events_rx,
            tracker_peers: peers_rx,
            tracker_status: tracker_status_rx,
            status: status_tx,
            completed: completed_tx,
            rates: RateMeter::default(),
            error: None,
        };

        tokio::spawn(swarm.manage());

        Ok(TorrentHandle {
            status: status_rx,
            shutdown: shutdown_tx,
            local_addr,
        })
    }
}

async fn listen(listener: TcpListener, ctx: SessionContext) {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound connection");
                    connection_manager::accept(stream, addr, ctx.clone());
                }
                Err(e) => warn!(%e, "accept failed"),
            },
            _ = shutdown.recv() => return,
        }
    }
}

/// Periodic choke tick. Only transitions go on the wire.
async fn manage_choking(ctx: SessionContext) {
    let mut shutdown = ctx.shutdown.clone();
    let mut ticker = interval(ctx.config.choke_interval.max(Duration::from_millis(MIN_CHOKE_INTERVAL_MILLIS)));
    ticker.tick().await;

    loop {
        select! {
            _ = ticker.tick() => (),
            _ = shutdown.recv() => return,
        }

        let decision = ctx.choke.tick(ctx.store.is_complete());

        if !decision.unchoke.is_empty() || !decision.choke.is_empty() {
            debug!(unchoke = decision.unchoke.len(), choke = decision.choke.len(), "choke tick");
        }

        for id in decision.unchoke {
            if let Some(handle) = ctx.sessions.get(&id) {
                handle.info.set_am_choking(false);
                handle.try_send(Message::Unchoke);
            }
        }

        for id in decision.choke {
            if let Some(handle) = ctx.sessions.get(&id) {
                handle.info.set_am_choking(true);
                handle.try_send(Message::Choke);
            }
        }
    }
}

/// Piece currently being fetched.
#[derive(Debug)]
struct ActivePiece {
    index: usize,
    holders: Vec<ID>,
    selected_at: Instant,
    last_progress: Instant,
    in_flight: HashMap<ID, usize>,
}

impl ActivePiece {
    fn new(index: usize, holders: Vec<ID>) -> Self {
        let now = Instant::now();

        Self {
            index,
            holders,
            selected_at: now,
            last_progress: now,
            in_flight: HashMap::new(),
        }
    }
}

struct Swarm {
    ctx: SessionContext,
    state: SwarmState,
    active: Option<ActivePiece>,
    candidates: VecDeque<Peer>,
    events: mpsc::Receiver<SessionEvent>,
    tracker_peers: mpsc::Receiver<Vec<Peer>>,
    tracker_status: watch::Receiver<TrackerStatus>,
    status: watch::Sender<TorrentStatus>,
    completed: watch::Sender<bool>,
    rates: RateMeter,
    error: Option<String>,
}

impl Swarm {
    #[instrument(skip_all, fields(info_hash = %self.ctx.info_hash))]
    async fn manage(mut self) {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut ticker = interval(Duration::from_millis(MANAGER_TICK_MILLIS));

        self.fill_peers();

        loop {
            select! {
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Some(peers) = self.tracker_peers.recv() => {
                    self.add_candidates(peers);
                    self.fill_peers();
                }
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.recv() => break,
            }

            self.publish(false);
        }

        info!("shutting down");
        self.ctx.sessions.close_all();
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected(id) => {
                if let Some(handle) = self.ctx.sessions.get(&id) {
                    if self.state == SwarmState::AwaitingMetadata {
                        request_metadata(&handle, &self.ctx.metadata);
                    } else {
                        refresh_interest(&handle, &self.ctx.availability);
                    }
                }
            }
            SessionEvent::Disconnected(id) => {
                if let Some(active) = &mut self.active {
                    active.in_flight.remove(&id);
                }
                self.fill_peers();
                self.dispatch_blocks();
            }
            SessionEvent::Unchoked(id) => {
                let holds_active = self
                    .active
                    .as_ref()
                    .map_or(false, |active| self.ctx.availability.holds(&id, active.index));

                if holds_active && self.state == SwarmState::SelectingPiece {
                    self.state = SwarmState::AwaitingBlocks;
                }
                self.dispatch_blocks();
            }
            SessionEvent::Choked(id) => {
                if let Some(active) = &mut self.active {
                    active.in_flight.remove(&id);
                }
                self.dispatch_blocks();
            }
            SessionEvent::Availability(id) => {
                if self.availability_changed(id) {
                    self.select_piece().await;
                }
            }
            SessionEvent::BlockReceived {
                peer,
                piece,
                piece_complete,
            } => {
                if let Some(active) = self.active.as_mut().filter(|a| a.index == piece) {
                    active.last_progress = Instant::now();
                    if let Some(count) = active.in_flight.get_mut(&peer) {
                        *count = count.saturating_sub(1);
                    }
                }

                if piece_complete {
                    self.complete_piece(piece).await;
                } else {
                    self.dispatch_blocks();
                }
            }
            SessionEvent::MetadataSource(id) => {
                if let Some(handle) = self.ctx.sessions.get(&id) {
                    request_metadata(&handle, &self.ctx.metadata);
                }
            }
            SessionEvent::MetadataResolved => self.metadata_resolved().await,
        }
    }

    async fn tick(&mut self) {
        self.fill_peers();

        // completion whose event never made it through the queue
        let unassembled = self
            .active
            .as_ref()
            .map(|active| active.index)
            .filter(|&idx| !self.ctx.store.has_piece(idx) && self.ctx.store.is_piece_complete(idx));
        if let Some(index) = unassembled {
            debug!(index, "complete piece found on tick");
            self.complete_piece(index).await;
        }

        match self.state {
            SwarmState::AwaitingMetadata => {
                if self.ctx.metadata.is_resolved() {
                    self.metadata_resolved().await;
                } else {
                    self.ctx.metadata.release_expired(self.ctx.config.request_timeout);
                    for handle in self.ctx.sessions.handles() {
                        request_metadata(&handle, &self.ctx.metadata);
                    }
                }
            }
            SwarmState::SelectingPiece => {
                let waited_too_long = self.active.as_ref().map_or(true, |active| {
                    active.selected_at.elapsed() >= self.ctx.config.unchoke_wait
                });

                if waited_too_long {
                    self.active = None;
                    self.select_piece().await;
                }
            }
            SwarmState::AwaitingBlocks => {
                let config = &self.ctx.config;
                let stalled = self.active.as_ref().map_or(true, |active| {
                    active.last_progress.elapsed() >= config.request_timeout
                });
                let unchoked = self.unchoked_holders();

                if unchoked.is_empty() {
                    debug!("no holder unchokes us, selecting again");
                    self.state = SwarmState::SelectingPiece;
                    self.active = None;
                    self.select_piece().await;
                } else {
                    if stalled {
                        if let Some(active) = &mut self.active {
                            active.in_flight.clear();
                            active.last_progress = Instant::now();
                        }
                    }
                    self.dispatch_blocks();
                }
            }
            SwarmState::Seeding | SwarmState::Failed => (),
        }

        self.publish(true);
    }

    fn add_candidates(&mut self, peers: Vec<Peer>) {
        for peer in peers {
            if !self.ctx.sessions.contains(&peer.id()) && !self.candidates.contains(&peer) {
                self.candidates.push_back(peer);
            }
        }
    }

    fn fill_peers(&mut self) {
        if self.ctx.shutdown.is_shutdown() {
            return;
        }

        while self.ctx.sessions.load() < self.ctx.config.max_peers {
            let Some(peer) = self.candidates.pop_front() else {
                break;
            };

            if self.ctx.sessions.reserve(peer.id()) {
                debug!(%peer, "dialing");
                connection_manager::connect(peer, self.ctx.clone());
            }
        }
    }

    async fn metadata_resolved(&mut self) {
        if self.state != SwarmState::AwaitingMetadata {
            return;
        }

        let Some(torrent) = self.ctx.metadata.torrent() else {
            return;
        };

        let config = &self.ctx.config;
        self.ctx
            .store
            .install(torrent.clone(), config.block_size, config.request_timeout);

        if config.seed {
            if let Err(e) = self.ctx.store.load_from_disk(&config.download_dir).await {
                warn!(%e, "can't seed from disk");
            }
        }

        let Some(local) = self.ctx.store.local_bitfield() else {
            return;
        };

        for id in self.ctx.availability.set_piece_count(&local) {
            if let Some(handle) = self.ctx.sessions.get(&id) {
                warn!(peer = %handle.peer, "bitfield does not fit the torrent");
                handle.close();
            }
        }

        info!(name = %torrent.info.name, pieces = local.len(), held = local.weight(), "metadata ready");

        self.status.send_modify(|status| status.name = Some(torrent.info.name.clone()));

        for handle in self.ctx.sessions.handles() {
            // too late for a bitfield
            for idx in local.ones() {
                handle.try_send(Message::Have(idx as u32));
            }
            refresh_interest(&handle, &self.ctx.availability);
        }

        self.state = SwarmState::SelectingPiece;
        self.select_piece().await;
    }

    async fn select_piece(&mut self) {
        match self.ctx.availability.select_rarest_piece() {
            Selection::Done => self.enter_seeding().await,
            Selection::Unavailable => {
                self.state = SwarmState::SelectingPiece;
                self.active = None;
            }
            Selection::Piece { index, holders } => {
                debug!(index, holders = holders.len(), "piece selected");

                for id in &holders {
                    if let Some(handle) = self.ctx.sessions.get(id) {
                        refresh_interest(&handle, &self.ctx.availability);
                    }
                }

                self.active = Some(ActivePiece::new(index, holders));

                if self.unchoked_holders().is_empty() {
                    self.state = SwarmState::SelectingPiece;
                } else {
                    self.state = SwarmState::AwaitingBlocks;
                    self.dispatch_blocks();
                }
            }
        }
    }

    /// Records a new holder of the active piece. True when the controller is
    /// idle and should try selecting again.
    fn availability_changed(&mut self, id: ID) -> bool {
        match &mut self.active {
            Some(active) => {
                if !active.holders.contains(&id) && self.ctx.availability.holds(&id, active.index) {
                    active.holders.push(id);
                }
                false
            }
            None => self.state == SwarmState::SelectingPiece,
        }
    }

    fn unchoked_holders(&self) -> Vec<SessionHandle> {
        let Some(active) = &self.active else {
            return Vec::new();
        };

        active
            .holders
            .iter()
            .filter(|id| self.ctx.availability.holds(id, active.index))
            .filter_map(|id| self.ctx.sessions.get(id))
            .filter(|handle| !handle.info.peer_choking())
            .collect()
    }

    /// Round-robins the active piece's outstanding blocks over the holders
    /// that unchoke us, keeping at most `pipeline_depth` in flight per peer.
    fn dispatch_blocks(&mut self) {
        if self.state != SwarmState::AwaitingBlocks {
            return;
        }

        let peers = self.unchoked_holders();
        let Some(active) = &mut self.active else {
            return;
        };

        if peers.is_empty() {
            return;
        }

        let blocks = match self.ctx.store.begin_piece_request(active.index) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(index = active.index, %e, "can't plan piece");
                return;
            }
        };

        let depth = self.ctx.config.pipeline_depth;
        let mut peers = peers.iter().cycle().take(peers.len() * depth);
        let mut sent = 0;

        'blocks: for block in blocks {
            loop {
                let Some(handle) = peers.next() else {
                    break 'blocks;
                };

                let in_flight = active.in_flight.entry(handle.id()).or_default();
                if *in_flight >= depth {
                    continue;
                }

                if handle.request(&block) {
                    *in_flight += 1;
                    self.ctx.store.mark_requested(&block, handle.id());
                    sent += 1;
                    continue 'blocks;
                }
            }
        }

        if sent > 0 {
            debug!(index = active.index, sent, "blocks requested");
        }
    }

    async fn complete_piece(&mut self, index: usize) {
        match self.ctx.store.assemble_piece(index) {
            Ok(_) => {
                self.ctx.availability.remove_piece(index);
                self.ctx.sessions.broadcast(Message::Have(index as u32));
                debug!(index, "piece complete");

                for handle in self.ctx.sessions.handles() {
                    refresh_interest(&handle, &self.ctx.availability);
                }
            }
            Err(StoreError::HashMismatch(_)) => warn!(index, "piece failed verification"),
            Err(e) => {
                warn!(index, %e, "can't assemble piece");
                return;
            }
        }

        if self.active.as_ref().map_or(false, |a| a.index == index) {
            self.active = None;
            self.state = SwarmState::SelectingPiece;
            self.select_piece().await;
        }
    }

    async fn enter_seeding(&mut self) {
        self.active = None;

        if !self.ctx.store.is_merged() {
            info!(target = %self.ctx.config.download_dir.display(), "all pieces held, writing files");

            match self.ctx.store.merge_to_disk(&self.ctx.config.download_dir).await {
                Ok(()) | Err(StoreError::AlreadyMerged) => (),
                Err(e) => {
                    error!(%e, "writing files failed");
                    self.error = Some(e.to_string());
                    self.state = SwarmState::Failed;
                    return;
                }
            }

            self.completed.send_replace(true);
        }

        info!("seeding");
        self.state = SwarmState::Seeding;

        for handle in self.ctx.sessions.handles() {
            refresh_interest(&handle, &self.ctx.availability);
        }
    }

    fn publish(&mut self, sample_rates: bool) {
        let progress = self.ctx.store.progress();
        let peers = self.ctx.sessions.len();
        let seeds = self.ctx.availability.seeds();
        let tracker = self.tracker_status.borrow().clone();

        if sample_rates {
            let (down, up) = progress
                .as_ref()
                .map_or((0, 0), |p| (p.downloaded, p.uploaded));
            let (download_rate, upload_rate) = self.rates.sample(Instant::now(), down, up);

            self.status.send_modify(|status| {
                status.download_rate = download_rate;
                status.upload_rate = upload_rate;
            });
        }

        self.status.send_if_modified(|status| {
            let before = (
                status.state,
                status.peers,
                status.seeds,
                status.pieces_held,
                status.tracker.clone(),
            );

            status.state = self.state;
            status.peers = peers;
            status.seeds = seeds;
            status.tracker = tracker;
            status.error = self.error.clone();
            if let Some(progress) = progress {
                status.apply_progress(progress);
            }

            before
                != (
                    status.state,
                    status.peers,
                    status.seeds,
                    status.pieces_held,
                    status.tracker.clone(),
                )
        });
    }
}
