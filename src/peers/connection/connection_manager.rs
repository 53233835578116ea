use super::connection_handle::{SessionHandle, MESSAGE_CHANNEL_BUFFER};
use super::extension::{ExtensionHandshake, MetadataMessage, EXTENSION_HANDSHAKE_ID};
use super::handshake::{accept_handshake, initiate_handshake, Handshake};
use super::info::PeerConnectionInfo;
use super::message::{Extended, Message, Piece, Request, BYTES_IN_LEN_PREFIX};
use crate::availability::AvailabilityTracker;
use crate::choke::ChokePolicy;
use crate::config::SwarmConfig;
use crate::constants::{
    CONNECT_TIMEOUT_SECS, KEEP_ALIVE_INTERVAL_SECS, LOCAL_UT_METADATA_ID, MAX_BLOCK_REQUEST,
    MAX_MESSAGE_BYTES,
};
use crate::data_structures::{NoSizeBytes, ID};
use crate::metadata_exchange::MetadataExchange;
use crate::peers::peer::Peer;
use crate::peers::sessions::Sessions;
use crate::piece_store::{BlockOutcome, PieceStore};
use crate::shutdown;
use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, instrument, trace, warn};

/// Wakeups for the swarm controller. Sessions never block on delivering them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(ID),
    Disconnected(ID),
    Unchoked(ID),
    Choked(ID),
    Availability(ID),
    BlockReceived {
        peer: ID,
        piece: usize,
        piece_complete: bool,
    },
    MetadataSource(ID),
    MetadataResolved,
}

/// Everything a session touches besides its own socket.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub client_id: ID,
    pub info_hash: ID,
    pub config: Arc<SwarmConfig>,
    pub availability: AvailabilityTracker,
    pub store: PieceStore,
    pub choke: ChokePolicy,
    pub metadata: MetadataExchange,
    pub sessions: Sessions,
    pub events: mpsc::Sender<SessionEvent>,
    pub shutdown: shutdown::Receiver,
}

impl SessionContext {
    fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!(?e, "controller busy, event dropped");
        }
    }

    /// For events the controller must not miss. Waits for room in the queue.
    async fn report(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            trace!("controller gone");
        }
    }
}

/// Dials `peer` in the background. The caller reserved it in the registry.
pub fn connect(peer: Peer, ctx: SessionContext) {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.clone();

        select! {
            rv = dial(peer, &ctx) => {
                if let Err(e) = rv {
                    debug!(%peer, %e, "outbound session ended");
                }
            }
            _ = shutdown.recv() => (),
        }

        ctx.sessions.unreserve(&peer.id());
    });
}

async fn dial(peer: Peer, ctx: &SessionContext) -> Result<()> {
    let mut stream = timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        TcpStream::connect(peer.addr()),
    )
    .await??;

    let ours = Handshake::new(&ctx.info_hash, &ctx.client_id);
    let theirs = timeout(
        ctx.config.handshake_timeout,
        initiate_handshake(&mut stream, &ours),
    )
    .await??;

    run_session(stream, peer, theirs, ctx.clone()).await
}

/// Answers an inbound connection in the background.
pub fn accept(stream: TcpStream, addr: SocketAddr, ctx: SessionContext) {
    tokio::spawn(async move {
        let peer = Peer::new(addr);
        let mut shutdown = ctx.shutdown.clone();

        select! {
            rv = answer(stream, peer, &ctx) => {
                if let Err(e) = rv {
                    debug!(%peer, %e, "inbound session ended");
                }
            }
            _ = shutdown.recv() => (),
        }
    });
}

async fn answer(mut stream: TcpStream, peer: Peer, ctx: &SessionContext) -> Result<()> {
    if ctx.sessions.load() >= ctx.config.max_peers {
        bail!("peer limit reached");
    }

    let ours = Handshake::new(&ctx.info_hash, &ctx.client_id);
    let theirs = timeout(
        ctx.config.handshake_timeout,
        accept_handshake(&mut stream, &ours),
    )
    .await??;

    run_session(stream, peer, theirs, ctx.clone()).await
}

/// Runs a handshaken connection until either side fails, the controller
/// closes it or the process shuts down. Whatever the peer contributed to
/// shared state is retracted on the way out.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn run_session<S>(stream: S, peer: Peer, theirs: Handshake, ctx: SessionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if theirs.peer_id == ctx.client_id {
        bail!("connected to ourselves");
    }

    let key = peer.id();
    let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_BUFFER);

    let info = PeerConnectionInfo::new();
    info.set_remote_id(theirs.peer_id);
    info.set_supports_extensions(theirs.supports_extensions());

    let handle = SessionHandle::new(peer, theirs.peer_id, info, tx);
    ctx.sessions.register(handle.clone())?;
    ctx.choke.add_peer(key);

    info!(remote_id = %theirs.peer_id, extensions = theirs.supports_extensions(), "connected");

    greet(&handle, &ctx);
    ctx.notify(SessionEvent::Connected(key));

    let (read_half, write_half) = split(stream);
    let mut session = Session {
        key,
        handle: handle.clone(),
        ctx: ctx.clone(),
        bitfield_allowed: true,
    };
    let mut shutdown = ctx.shutdown.clone();

    let rv = select! {
        rv = session_sender(write_half, rx) => rv,
        rv = session.receive(read_half) => rv,
        _ = handle.closed() => Ok(()),
        _ = shutdown.recv() => Ok(()),
    };

    teardown(key, &ctx);

    if let Err(e) = &rv {
        debug!(%e, "session failed");
    }

    rv
}

/// Our bitfield, then our extension handshake if the peer speaks BEP10.
fn greet(handle: &SessionHandle, ctx: &SessionContext) {
    if let Some(bitfield) = ctx.store.local_bitfield() {
        if bitfield.weight() > 0 {
            handle.try_send(Message::Bitfield(NoSizeBytes::from(bitfield.as_bytes())));
        }
    }

    if handle.info.supports_extensions() {
        let ours = ExtensionHandshake {
            ut_metadata: Some(LOCAL_UT_METADATA_ID),
            metadata_size: ctx.metadata.metadata_size(),
        };

        match ours.into_payload() {
            Ok(payload) => {
                handle.try_send(Message::Extended(Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: NoSizeBytes::from(payload),
                }));
            }
            Err(e) => warn!(%e, "can't encode extension handshake"),
        }
    }
}

fn teardown(key: ID, ctx: &SessionContext) {
    ctx.sessions.remove(&key);
    ctx.availability.remove_peer(&key);
    ctx.choke.remove_peer(&key);
    let released = ctx.store.release_peer(&key);
    ctx.metadata.release_peer(&key);

    info!(released, "disconnected");
    ctx.notify(SessionEvent::Disconnected(key));
}

async fn session_sender<W>(mut stream: W, mut rx: mpsc::Receiver<Message>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut keep_alive = interval(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS));
    keep_alive.tick().await;

    loop {
        let message = select! {
            _ = keep_alive.tick() => Message::KeepAlive,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        #[cfg(feature = "verbose")]
        trace!(?message, "send");

        stream.write_all(&message.into_bytes()?).await?;
        keep_alive.reset();
    }
}

/// Reads one length-prefixed frame.
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;

    if len > MAX_MESSAGE_BYTES {
        bail!("frame of {} bytes is over the limit", len);
    }

    let mut buf = vec![0u8; BYTES_IN_LEN_PREFIX + len];
    buf[..BYTES_IN_LEN_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
    stream.read_exact(&mut buf[BYTES_IN_LEN_PREFIX..]).await?;

    Message::from_buf(&buf)
}

/// Sends `interested` or `not interested` when the peer's usefulness changed.
pub fn refresh_interest(handle: &SessionHandle, availability: &AvailabilityTracker) {
    let interesting = availability.is_interesting(&handle.id());

    if interesting != handle.info.am_interested() {
        handle.info.set_am_interested(interesting);
        handle.try_send(if interesting {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }
}

/// Asks the peer for the next metadata piece nobody is fetching.
pub fn request_metadata(handle: &SessionHandle, metadata: &MetadataExchange) -> bool {
    if !handle.info.is_metadata_source() {
        return false;
    }

    let Some(ut_metadata) = handle.info.ut_metadata() else {
        return false;
    };

    let Some(piece) = metadata.next_needed_piece(handle.id()) else {
        return false;
    };

    send_metadata(handle, ut_metadata, MetadataMessage::Request { piece })
}

fn send_metadata(handle: &SessionHandle, ut_metadata: u8, message: MetadataMessage) -> bool {
    match message.into_payload() {
        Ok(payload) => handle.try_send(Message::Extended(Extended {
            id: ut_metadata,
            payload: NoSizeBytes::from(payload),
        })),
        Err(e) => {
            warn!(%e, "can't encode ut_metadata message");
            false
        }
    }
}

struct Session {
    key: ID,
    handle: SessionHandle,
    ctx: SessionContext,
    bitfield_allowed: bool,
}

impl Session {
    async fn receive<R>(&mut self, mut stream: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = read_message(&mut stream).await?;

            #[cfg(feature = "verbose")]
            trace!(?message, "received");

            self.dispatch(message).await?;
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        if let Message::Bitfield(_) = message {
            if !self.bitfield_allowed {
                bail!("bitfield is only valid as the first message");
            }
        }

        if !matches!(message, Message::KeepAlive | Message::Extended(_)) {
            self.bitfield_allowed = false;
        }

        let info = &self.handle.info;

        match message {
            Message::KeepAlive => (),
            Message::Choke => {
                info.set_peer_choking(true);
                let released = self.ctx.store.release_peer(&self.key);
                debug!(released, "choked");
                self.ctx.notify(SessionEvent::Choked(self.key));
            }
            Message::Unchoke => {
                info.set_peer_choking(false);
                debug!("unchoked");
                self.ctx.notify(SessionEvent::Unchoked(self.key));
            }
            Message::Interested => {
                info.set_peer_interested(true);
                self.ctx.choke.set_interested(self.key, true);
                self.answer_interest();
            }
            Message::NotInterested => {
                info.set_peer_interested(false);
                self.ctx.choke.set_interested(self.key, false);
            }
            Message::Have(idx) => {
                let complete = self.ctx.availability.observe_have(self.key, idx)?;
                self.availability_changed(complete);
            }
            Message::Bitfield(bitfield) => {
                let complete = self
                    .ctx
                    .availability
                    .observe_bitfield(self.key, bitfield.as_ref())?;
                self.availability_changed(complete);
            }
            Message::Request(request) => self.serve(request),
            Message::Piece(piece) => self.receive_block(piece).await,
            Message::Cancel(_) | Message::Port(_) => (),
            Message::Extended(extended) => {
                if !info.supports_extensions() {
                    bail!("extension message from a peer without BEP10 support");
                }
                self.extended(extended).await?
            }
        }

        Ok(())
    }

    fn answer_interest(&self) {
        let unchoked = self.ctx.choke.is_unchoked(&self.key);
        self.handle.info.set_am_choking(!unchoked);

        self.handle.try_send(if unchoked {
            Message::Unchoke
        } else {
            Message::Choke
        });
    }

    fn availability_changed(&self, complete: bool) {
        if complete {
            self.ctx.choke.set_finished(self.key);
        }

        refresh_interest(&self.handle, &self.ctx.availability);
        self.ctx.notify(SessionEvent::Availability(self.key));
    }

    fn serve(&self, request: Request) {
        let info = &self.handle.info;

        if request.length as usize > MAX_BLOCK_REQUEST || info.am_choking() || !info.peer_interested()
        {
            debug!(?request, "request ignored");
            return;
        }

        match self.ctx.store.get_block(
            request.index as usize,
            request.begin as usize,
            request.length as usize,
        ) {
            Some(block) => {
                self.handle
                    .try_send(Message::Piece(Piece::new(request.index, request.begin, &block)));
            }
            None => debug!(?request, "request for data we don't hold"),
        }
    }

    async fn receive_block(&self, piece: Piece) {
        let length = piece.len() as u64;
        let idx = piece.index as usize;

        match self.ctx.store.add_block(
            &self.key,
            idx,
            piece.begin as usize,
            piece.block.into_bytes(),
        ) {
            Ok(BlockOutcome::Accepted { piece_complete }) => {
                self.ctx.choke.record_contribution(self.key, length);
                self.ctx
                    .report(SessionEvent::BlockReceived {
                        peer: self.key,
                        piece: idx,
                        piece_complete,
                    })
                    .await;
            }
            Ok(outcome) => trace!(idx, begin = piece.begin, ?outcome, "block dropped"),
            Err(e) => debug!(idx, begin = piece.begin, %e, "block dropped"),
        }
    }

    async fn extended(&self, extended: Extended) -> Result<()> {
        let info = &self.handle.info;

        match extended.id {
            EXTENSION_HANDSHAKE_ID => {
                let theirs = ExtensionHandshake::from_payload(extended.payload.as_ref())?;
                debug!(?theirs, "extension handshake");
                info.set_extension_handshake(theirs.ut_metadata, theirs.metadata_size);

                if let (Some(_), Some(size)) = (theirs.ut_metadata, theirs.metadata_size) {
                    if self.ctx.metadata.offer_size(size) {
                        self.ctx.notify(SessionEvent::MetadataSource(self.key));
                        request_metadata(&self.handle, &self.ctx.metadata);
                    }
                }
            }
            LOCAL_UT_METADATA_ID => {
                match MetadataMessage::from_payload(extended.payload.as_ref())? {
                    MetadataMessage::Request { piece } => {
                        if let Some(ut_metadata) = info.ut_metadata() {
                            send_metadata(
                                &self.handle,
                                ut_metadata,
                                self.ctx.metadata.serve_piece(piece),
                            );
                        }
                    }
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        data,
                    } => match self
                        .ctx
                        .metadata
                        .store_piece(&self.key, piece, total_size, data)
                    {
                        Ok(Some(_)) => self.ctx.report(SessionEvent::MetadataResolved).await,
                        Ok(None) => {
                            request_metadata(&self.handle, &self.ctx.metadata);
                        }
                        Err(e) => {
                            warn!(piece, %e, "metadata piece dropped");
                            request_metadata(&self.handle, &self.ctx.metadata);
                        }
                    },
                    MetadataMessage::Reject { piece } => {
                        debug!(piece, "metadata request rejected");
                        info.set_metadata_rejected();
                        self.ctx.metadata.reject(piece);
                    }
                }
            }
            unknown => trace!(id = unknown, "unsupported extension message"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{read_message, run_session, SessionContext, SessionEvent};
    use crate::availability::AvailabilityTracker;
    use crate::choke::ChokePolicy;
    use crate::config::SwarmConfig;
    use crate::constants::BLOCK_SIZE;
    use crate::data_structures::{NoSizeBytes, ID};
    use crate::metadata_exchange::MetadataExchange;
    use crate::peers::connection::handshake::Handshake;
    use crate::peers::connection::message::{Extended, Message, Piece, Request};
    use crate::peers::peer::Peer;
    use crate::peers::sessions::Sessions;
    use crate::piece_store::PieceStore;
    use crate::shutdown;
    use crate::transcoding::metainfo::tests::info_for;
    use crate::transcoding::metainfo::Torrent;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    struct Harness {
        ctx: SessionContext,
        events: mpsc::Receiver<SessionEvent>,
        peer: Peer,
        content: Vec<u8>,
        _shutdown: shutdown::Sender,
    }

    fn harness() -> Harness {
        let content: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let info = info_for("session", BLOCK_SIZE as u64, &[("f", &content)]);
        let torrent = Arc::new(Torrent::from_info(&info, Vec::new()).unwrap());
        let config = Arc::new(SwarmConfig::default());

        let store = PieceStore::new(torrent.clone(), BLOCK_SIZE, config.request_timeout);
        let availability = AvailabilityTracker::new(&store.local_bitfield().unwrap());
        let (events_tx, events) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = shutdown::channel();

        let ctx = SessionContext {
            client_id: ID::new([0xAA; 20]),
            info_hash: torrent.info_hash,
            availability,
            store,
            choke: ChokePolicy::new(config.max_unchoked, config.optimistic_rotation_ticks),
            metadata: MetadataExchange::resolved(torrent, config.metadata_piece_size),
            sessions: Sessions::new(),
            events: events_tx,
            shutdown: shutdown_rx,
            config,
        };

        Harness {
            ctx,
            events,
            peer: Peer::new("10.0.0.2:6881".parse().unwrap()),
            content,
            _shutdown: shutdown_tx,
        }
    }

    fn spawn_session(h: &Harness, remote_id: ID) -> (JoinHandle<anyhow::Result<()>>, DuplexStream) {
        let (ours, theirs) = duplex(1 << 16);
        let handshake = Handshake {
            reserved: [0; 8],
            info_hash: h.ctx.info_hash,
            peer_id: remote_id,
        };

        let session = tokio::spawn(run_session(ours, h.peer, handshake, h.ctx.clone()));

        (session, theirs)
    }

    async fn send(stream: &mut DuplexStream, message: Message) {
        stream
            .write_all(&message.into_bytes().unwrap())
            .await
            .unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> Message {
        tokio::time::timeout(Duration::from_secs(5), read_message(stream))
            .await
            .unwrap()
            .unwrap()
    }

    fn hold_everything(h: &Harness) {
        let peer = ID::new([9; 20]);

        for idx in 0..2 {
            for block in h.ctx.store.begin_piece_request(idx).unwrap() {
                let start = idx * BLOCK_SIZE + block.begin;
                let data = Bytes::copy_from_slice(&h.content[start..start + block.length]);
                h.ctx.store.add_block(&peer, idx, block.begin, data).unwrap();
            }
            h.ctx.store.assemble_piece(idx).unwrap();
            h.ctx.availability.remove_piece(idx);
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn leecher_side() {
        let mut h = harness();
        let (session, mut remote) = spawn_session(&h, ID::new([1; 20]));
        let key = h.peer.id();

        send(&mut remote, Message::Bitfield(NoSizeBytes::from(&[0b1100_0000u8][..]))).await;
        assert_eq!(Message::Interested, recv(&mut remote).await);

        assert_eq!(Some(1), h.ctx.availability.count(0));
        assert!(h.ctx.sessions.contains(&key));

        // choked peers get nothing, the next frame is the answer to interested
        send(
            &mut remote,
            Message::Request(Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE as u32,
            }),
        )
        .await;
        send(&mut remote, Message::Interested).await;
        assert_eq!(Message::Choke, recv(&mut remote).await);

        send(&mut remote, Message::Unchoke).await;
        let blocks = h.ctx.store.begin_piece_request(0).unwrap();
        h.ctx.sessions.get(&key).unwrap().request(&blocks[0]);
        assert_eq!(
            Message::Request(Request {
                index: 0,
                begin: 0,
                length: BLOCK_SIZE as u32,
            }),
            recv(&mut remote).await
        );

        send(
            &mut remote,
            Message::Piece(Piece::new(0, 0, &h.content[..BLOCK_SIZE])),
        )
        .await;

        drop(remote);
        assert!(session.await.unwrap().is_err());

        assert!(h.ctx.store.is_piece_complete(0));
        assert_eq!(Some(0), h.ctx.availability.count(0));
        assert!(h.ctx.sessions.is_empty());

        let mut events = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            events.push(event);
        }
        assert_eq!(Some(&SessionEvent::Connected(key)), events.first());
        assert!(events.contains(&SessionEvent::Unchoked(key)));
        assert!(events.contains(&SessionEvent::BlockReceived {
            peer: key,
            piece: 0,
            piece_complete: true,
        }));
        assert_eq!(Some(&SessionEvent::Disconnected(key)), events.last());
    }

    #[tokio::test]
    async fn seeder_side() {
        let h = harness();
        hold_everything(&h);
        let key = h.peer.id();

        h.ctx.choke.set_interested(key, true);
        h.ctx.choke.tick(false);

        let (session, mut remote) = spawn_session(&h, ID::new([1; 20]));

        assert_eq!(
            Message::Bitfield(NoSizeBytes::from(&[0b1100_0000u8][..])),
            recv(&mut remote).await
        );

        send(&mut remote, Message::Interested).await;
        assert_eq!(Message::Unchoke, recv(&mut remote).await);

        send(
            &mut remote,
            Message::Request(Request {
                index: 1,
                begin: 0,
                length: BLOCK_SIZE as u32,
            }),
        )
        .await;
        assert_eq!(
            Message::Piece(Piece::new(1, 0, &h.content[BLOCK_SIZE..])),
            recv(&mut remote).await
        );
        assert_eq!(
            BLOCK_SIZE as u64,
            h.ctx.store.progress().unwrap().uploaded
        );

        h.ctx.sessions.get(&key).unwrap().close();
        assert!(session.await.unwrap().is_ok());
        assert!(h.ctx.sessions.is_empty());
    }

    #[tokio::test]
    async fn late_bitfield_is_a_violation() {
        let h = harness();
        let (session, mut remote) = spawn_session(&h, ID::new([1; 20]));

        send(&mut remote, Message::Have(0)).await;
        send(&mut remote, Message::Bitfield(NoSizeBytes::from(&[0b1000_0000u8][..]))).await;

        assert!(session.await.unwrap().is_err());
        assert!(h.ctx.sessions.is_empty());
        assert_eq!(Some(0), h.ctx.availability.count(0));
    }

    #[tokio::test]
    async fn extension_messages_need_bep10() {
        let h = harness();
        let (session, mut remote) = spawn_session(&h, ID::new([1; 20]));

        send(
            &mut remote,
            Message::Extended(Extended {
                id: 0,
                payload: NoSizeBytes::from(&b"d1:md11:ut_metadatai3eee"[..]),
            }),
        )
        .await;

        assert!(session.await.unwrap().is_err());
        assert!(h.ctx.sessions.is_empty());
    }

    #[tokio::test]
    async fn oversized_frames_end_the_session() {
        let h = harness();
        let (session, mut remote) = spawn_session(&h, ID::new([1; 20]));

        remote.write_all(&(1u32 << 20).to_be_bytes()).await.unwrap();

        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn refuses_self_and_duplicates() {
        let h = harness();

        let (session, _remote) = spawn_session(&h, h.ctx.client_id);
        assert!(session.await.unwrap().is_err());
        assert!(h.ctx.sessions.is_empty());

        let (first, _first_remote) = spawn_session(&h, ID::new([1; 20]));
        while h.ctx.sessions.is_empty() {
            tokio::task::yield_now().await;
        }

        let (second, _second_remote) = spawn_session(&h, ID::new([1; 20]));
        assert!(second.await.unwrap().is_err());
        assert_eq!(1, h.ctx.sessions.len());

        h.ctx.sessions.close_all();
        assert!(first.await.unwrap().is_ok());
    }
}
