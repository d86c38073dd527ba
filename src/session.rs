use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::downloader::BlockDownloader;
use crate::error::ApplicationError;
use crate::framer::{Framer, Recv};
use crate::peer::{Peer, PeerState};
use crate::piece::PieceStatus;
use crate::protocol::{Handshake, InfoHash, Message, PeerId};
use crate::registry::PieceRegistry;
use crate::scheduler;
use crate::store::PieceStore;
use crate::torrent::Metadata;

/// State shared by every session of one download: torrent layout, piece
/// registry and the backing store. Owned by the caller and lent to each
/// session.
pub struct SessionContext {
    pub info_hash:    InfoHash,
    pub our_peer_id:  PeerId,
    pub piece_length: usize,
    pub piece_hashes: Vec<[u8; 20]>,
    pub registry:     PieceRegistry,
    pub store:        PieceStore,
    pub config:       Config,
}

impl SessionContext {
    /// Allocates the registry and pre-sizes the store at `config.output`.
    pub async fn new(metadata: &Metadata, config: Config) -> Result<Self, ApplicationError> {
        let store = PieceStore::create(
            &config.output,
            metadata.num_of_pieces,
            metadata.piece_length,
        )
        .await?;

        Ok(Self {
            info_hash: metadata.info_hash,
            our_peer_id: metadata.our_peer_id,
            piece_length: metadata.piece_length,
            piece_hashes: metadata.piece_hashes.clone(),
            registry: PieceRegistry::new(metadata.num_of_pieces),
            store,
            config,
        })
    }

    pub fn num_of_pieces(&self) -> usize {
        self.registry.len()
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.registry, self.info_hash)
    }

    pub fn completed(&self) -> usize {
        self.registry.count(PieceStatus::Complete)
    }
}

/// Reads and dispatches messages until the peer unchokes us. Silence is
/// fatal here: the peer already knows we are waiting.
pub(crate) async fn await_unchoke<S>(
    framer: &mut Framer<S>,
    dispatcher: &Dispatcher<'_>,
    peer: &mut PeerState,
) -> Result<(), ApplicationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while !peer.unchoked {
        match framer.read_message().await? {
            Recv::Timeout => {
                return Err(ApplicationError::Timeout(
                    "peer did not unchoke us".into(),
                ));
            }
            Recv::Data(frame) => dispatcher.dispatch(&frame, false, peer)?,
        }
    }
    Ok(())
}

/// Connects to `peer` and runs one session over TCP.
///
/// Returns the index of the piece that was downloaded and verified.
#[tracing::instrument(name = "session", skip_all, fields(peer = %peer))]
pub async fn run(ctx: &SessionContext, peer: &Peer) -> Result<usize, ApplicationError> {
    let stream = timeout(ctx.config.connect_timeout, TcpStream::connect(peer.addr()))
        .await
        .map_err(|_| ApplicationError::ConnectionError("connect timed out".into()))?
        .map_err(|e| ApplicationError::ConnectionError(format!("connect: {}", e)))?;

    info!("connected");
    PeerSession::new(stream, ctx).run().await
}

/// One peer's lifecycle: handshake, drain the initial burst, declare
/// interest, wait for unchoke, download a single piece.
pub struct PeerSession<'a, S> {
    framer:     Framer<S>,
    ctx:        &'a SessionContext,
    dispatcher: Dispatcher<'a>,
    state:      PeerState,
}

impl<'a, S> PeerSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ctx: &'a SessionContext) -> Self {
        Self {
            framer: Framer::new(stream, ctx.config.read_timeout),
            ctx,
            dispatcher: ctx.dispatcher(),
            state: PeerState::new(),
        }
    }

    pub async fn run(mut self) -> Result<usize, ApplicationError> {
        self.handshake().await?;
        self.drain_burst().await?;

        if !self.state.has_pieces {
            return Err(ApplicationError::PeerError(
                "peer advertised no pieces".into(),
            ));
        }

        self.framer.send(&Message::Interested.encode()).await?;
        debug!("sent interested");
        await_unchoke(&mut self.framer, &self.dispatcher, &mut self.state).await?;
        info!("unchoked");

        let index = scheduler::choose_piece_for(&self.ctx.registry, self.state.peer_id)
            .ok_or_else(|| {
                ApplicationError::PeerError("no available piece to download".into())
            })?;

        BlockDownloader::new(
            &mut self.framer,
            &self.dispatcher,
            &mut self.state,
            self.ctx,
            index,
        )
        .run()
        .await?;

        Ok(index)
    }

    async fn handshake(&mut self) -> Result<(), ApplicationError> {
        let hs = Handshake::new(self.ctx.info_hash, self.ctx.our_peer_id);
        self.framer.send(&hs.encode()).await?;
        debug!("sent handshake");

        match self.framer.read_handshake().await? {
            Recv::Timeout => Err(ApplicationError::Timeout(
                "no handshake from peer".into(),
            )),
            Recv::Data(record) => self.dispatcher.dispatch(&record, true, &mut self.state),
        }
    }

    /// Absorbs whatever the peer sends right after the handshake
    /// (typically a bitfield and some haves) until it goes quiet.
    async fn drain_burst(&mut self) -> Result<(), ApplicationError> {
        while let Recv::Data(frame) = self.framer.read_message().await? {
            self.dispatcher.dispatch(&frame, false, &mut self.state)?;
        }
        debug!(has_pieces = self.state.has_pieces, "peer went quiet");
        Ok(())
    }
}
