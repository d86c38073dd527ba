use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace};

use crate::dispatcher::Dispatcher;
use crate::error::ApplicationError;
use crate::framer::{FrameHeader, Framer, Recv};
use crate::peer::PeerState;
use crate::piece::{self, Block, BlockState};
use crate::protocol::{Message, PIECE_ID};
use crate::session::{SessionContext, await_unchoke};

/// Most Request messages in flight at once
pub const MAX_REQUESTS: usize = 3;

/// Piece payloads are moved from socket to disk this many bytes at a time
const CHUNK_LEN: usize = 4096;

/// Up to `max` not-yet-downloaded blocks that are not already
/// `in_flight`, lowest offset first.
pub fn next_batch(blocks: &[Block], in_flight: &[usize], max: usize) -> Vec<usize> {
    blocks
        .iter()
        .enumerate()
        .filter(|(i, b)| b.state == BlockState::NotDownloaded && !in_flight.contains(i))
        .map(|(i, _)| i)
        .take(max)
        .collect()
}

/// Request messages for `batch`, concatenated for a single write.
pub fn encode_requests(index: usize, blocks: &[Block], batch: &[usize]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17 * batch.len());
    for &b in batch {
        Message::Request {
            index:  index as u32,
            begin:  blocks[b].offset as u32,
            length: blocks[b].length as u32,
        }
        .encode_into(&mut buf);
    }
    buf
}

/// Downloads one piece from an unchoked peer, block by block, straight
/// into the store.
pub struct BlockDownloader<'a, S> {
    framer:     &'a mut Framer<S>,
    dispatcher: &'a Dispatcher<'a>,
    peer:       &'a mut PeerState,
    ctx:        &'a SessionContext,
    index:      usize,
    blocks:     Vec<Block>,
    /// Requested blocks the peer still owes us
    in_flight:  Vec<usize>,
    chunk:      Vec<u8>,
}

impl<'a, S> BlockDownloader<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        framer: &'a mut Framer<S>,
        dispatcher: &'a Dispatcher<'a>,
        peer: &'a mut PeerState,
        ctx: &'a SessionContext,
        index: usize,
    ) -> Self {
        Self {
            framer,
            dispatcher,
            peer,
            ctx,
            index,
            blocks: piece::partition(ctx.piece_length),
            in_flight: Vec::with_capacity(MAX_REQUESTS),
            chunk: vec![0u8; CHUNK_LEN],
        }
    }

    /// Claims the piece, fetches every block and checks the piece hash.
    /// A failed attempt hands the piece back to the registry; bytes already
    /// written stay in the store but count for nothing.
    pub async fn run(mut self) -> Result<(), ApplicationError> {
        if !self.ctx.registry.claim(self.index)? {
            return Err(ApplicationError::PeerError(format!(
                "piece {} is not available",
                self.index
            )));
        }

        match self.fetch().await {
            Ok(()) => {
                self.ctx.registry.complete(self.index)?;
                info!(index = self.index, "piece complete");
                Ok(())
            }
            Err(e) => {
                self.ctx.registry.release(self.index)?;
                debug!(index = self.index, error = %e, "piece attempt failed");
                Err(e)
            }
        }
    }

    async fn fetch(&mut self) -> Result<(), ApplicationError> {
        info!(index = self.index, blocks = self.blocks.len(), "downloading piece");

        loop {
            if !self.peer.unchoked {
                await_unchoke(self.framer, self.dispatcher, self.peer).await?;
            }

            // Unanswered requests still count against the window.
            let free = MAX_REQUESTS.saturating_sub(self.in_flight.len());
            let batch = next_batch(&self.blocks, &self.in_flight, free);
            if batch.is_empty() && self.in_flight.is_empty() {
                break;
            }

            if !batch.is_empty() {
                self.framer
                    .send(&encode_requests(self.index, &self.blocks, &batch))
                    .await?;
                trace!(?batch, in_flight = ?self.in_flight, "sent requests");
                self.in_flight.extend(batch);
            }

            let received = self.collect().await?;
            if received == 0 && self.peer.unchoked {
                return Err(ApplicationError::Timeout(format!(
                    "no blocks of piece {} arrived",
                    self.index
                )));
            }
        }

        self.verify().await
    }

    /// Reads until every in-flight block has arrived, the peer goes quiet,
    /// or it chokes us. Returns how many new blocks were stored.
    async fn collect(&mut self) -> Result<usize, ApplicationError> {
        let mut received = 0;

        while !self.in_flight.is_empty() {
            let header = match self.framer.read_header().await? {
                Recv::Timeout => break,
                Recv::Data(header) => header,
            };

            if header.id != Some(PIECE_ID) {
                let frame = self.framer.read_body(header).await?;
                self.dispatcher.dispatch(&frame, false, self.peer)?;
                if !self.peer.unchoked {
                    // A choking peer drops every request it holds.
                    debug!("choked during download");
                    self.in_flight.clear();
                    break;
                }
                continue;
            }

            if let Some(block) = self.receive_block(header).await? {
                self.in_flight.retain(|&b| b != block);
                received += 1;
            }
        }

        Ok(received)
    }

    /// Streams one Piece payload into the store. Returns the block's
    /// position, or `None` for a duplicate that was read and dropped.
    async fn receive_block(&mut self, header: FrameHeader) -> Result<Option<usize>, ApplicationError> {
        let payload = header.payload_len();
        if payload < 8 {
            return Err(ApplicationError::protocol(format!(
                "piece message with {} byte payload",
                payload
            )));
        }

        let piece_index = self.framer.read_u32().await? as usize;
        if piece_index != self.index {
            return Err(ApplicationError::protocol(format!(
                "expected piece {}, peer sent piece {}",
                self.index, piece_index
            )));
        }

        let begin = self.framer.read_u32().await? as usize;
        let length = payload - 8;

        let slot = self
            .blocks
            .iter()
            .position(|b| b.offset == begin && b.length == length)
            .ok_or_else(|| {
                ApplicationError::protocol(format!(
                    "unrequested block {}+{} of piece {}",
                    begin, length, self.index
                ))
            })?;

        if self.blocks[slot].state == BlockState::Downloaded {
            self.discard(length).await?;
            debug!(begin, "dropped duplicate block");
            return Ok(None);
        }

        let mut writer = self.ctx.store.block_writer(self.index, begin, length)?;
        let mut remaining = length;
        while remaining > 0 {
            let n = remaining.min(CHUNK_LEN);
            self.framer.read_rest(&mut self.chunk[..n]).await?;
            writer.write(&self.chunk[..n]).await?;
            remaining -= n;
        }
        drop(writer);

        self.blocks[slot].state = BlockState::Downloaded;
        trace!(begin, length, "stored block");
        Ok(Some(slot))
    }

    async fn discard(&mut self, mut remaining: usize) -> Result<(), ApplicationError> {
        while remaining > 0 {
            let n = remaining.min(CHUNK_LEN);
            self.framer.read_rest(&mut self.chunk[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    async fn verify(&self) -> Result<(), ApplicationError> {
        let expected = self.ctx.piece_hashes.get(self.index).ok_or_else(|| {
            ApplicationError::ResourceError(format!("no hash for piece {}", self.index))
        })?;

        self.ctx.store.flush().await?;
        let actual = self.ctx.store.hash_piece(self.index).await?;
        if actual != *expected {
            return Err(ApplicationError::protocol(format!(
                "piece {} failed hash check: expected {}, got {}",
                self.index,
                hex::encode(expected),
                hex::encode(actual)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::piece::{BLOCK_LEN, PieceStatus};
    use crate::protocol::{InfoHash, PeerId};
    use crate::torrent::Metadata;
    use sha1::{Digest, Sha1};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::time::timeout;

    const PIECE_LEN: usize = 100_000;
    const HASH: InfoHash = InfoHash([5; 20]);
    const THEM: PeerId = PeerId([6; 20]);

    #[derive(Default, Clone, Copy)]
    struct Script {
        wrong_index:     bool,
        bad_offset:      bool,
        duplicate_first: bool,
        choke_once:      bool,
        have_first:      Option<u32>,
    }

    fn content() -> Vec<u8> {
        (0..PIECE_LEN as u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    async fn context(dir: &tempfile::TempDir, hash: [u8; 20]) -> SessionContext {
        let metadata = Metadata {
            info_hash:     HASH,
            our_peer_id:   PeerId([1; 20]),
            num_of_pieces: 2,
            piece_length:  PIECE_LEN,
            piece_hashes:  vec![[0; 20], hash],
            peers:         vec![],
        };
        let config = Config {
            output: dir.path().join("store.bin"),
            read_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let ctx = SessionContext::new(&metadata, config).await.unwrap();
        ctx.registry.mark_available(1, Some(THEM)).unwrap();
        ctx
    }

    fn unchoked() -> PeerState {
        PeerState {
            unchoked:   true,
            has_pieces: true,
            peer_id:    Some(THEM),
        }
    }

    async fn send(theirs: &mut DuplexStream, msg: Message) -> bool {
        theirs.write_all(&msg.encode()).await.is_ok()
    }

    /// Answers request batches from `data`. Returns the most requests it
    /// ever saw outstanding at once.
    async fn serve(mut theirs: DuplexStream, data: Vec<u8>, script: Script) -> usize {
        let mut most = 0;
        let mut choked = false;
        let mut first = true;
        let mut first_answer = true;

        loop {
            let mut req = [0u8; 17];
            if theirs.read_exact(&mut req).await.is_err() {
                return most;
            }
            let mut batch = vec![req];
            while let Ok(Ok(_)) =
                timeout(Duration::from_millis(20), theirs.read_exact(&mut req)).await
            {
                batch.push(req);
            }
            most = most.max(batch.len());

            if script.choke_once && !choked {
                choked = true;
                send(&mut theirs, Message::Choke).await;
                tokio::time::sleep(Duration::from_millis(30)).await;
                send(&mut theirs, Message::Unchoke).await;
                continue;
            }

            if first {
                first = false;
                if let Some(h) = script.have_first {
                    send(&mut theirs, Message::Have(h)).await;
                }
            }

            let mut duplicate = script.duplicate_first && first_answer;
            first_answer = false;

            for r in batch {
                let Ok(Message::Request {
                    index,
                    begin,
                    length,
                }) = Message::read_from(&mut &r[..])
                else {
                    panic!("expected a request");
                };
                let (b, l) = (begin as usize, length as usize);
                let index = if script.wrong_index { index + 1 } else { index };
                let piece = Message::Piece {
                    index,
                    begin: if script.bad_offset { begin + 1 } else { begin },
                    block: data[b..b + l].to_vec(),
                };
                if duplicate {
                    duplicate = false;
                    if !send(&mut theirs, piece.clone()).await {
                        return most;
                    }
                }
                if !send(&mut theirs, piece).await {
                    return most;
                }
            }
        }
    }

    async fn answer(theirs: &mut DuplexStream, data: &[u8], req: [u8; 17]) -> bool {
        let Ok(Message::Request {
            index,
            begin,
            length,
        }) = Message::read_from(&mut &req[..])
        else {
            panic!("expected a request");
        };
        let (b, l) = (begin as usize, length as usize);
        let piece = Message::Piece {
            index,
            begin,
            block: data[b..b + l].to_vec(),
        };
        send(theirs, piece).await
    }

    /// Answers the first request it gets, then says nothing for `stall`
    /// before serving everything it holds. Returns the most requests it
    /// ever held unanswered.
    async fn serve_after_stall(mut theirs: DuplexStream, data: Vec<u8>, stall: Duration) -> usize {
        let mut held: VecDeque<[u8; 17]> = VecDeque::new();
        let mut most = 0;
        let mut stalled = false;
        let mut req = [0u8; 17];

        loop {
            if held.is_empty() {
                if theirs.read_exact(&mut req).await.is_err() {
                    return most;
                }
                held.push_back(req);
            }
            while let Ok(Ok(_)) =
                timeout(Duration::from_millis(20), theirs.read_exact(&mut req)).await
            {
                held.push_back(req);
            }
            most = most.max(held.len());

            if !stalled {
                stalled = true;
                if let Some(r) = held.pop_front() {
                    if !answer(&mut theirs, &data, r).await {
                        return most;
                    }
                }
                tokio::time::sleep(stall).await;
                continue;
            }

            while let Some(r) = held.pop_front() {
                if !answer(&mut theirs, &data, r).await {
                    return most;
                }
            }
        }
    }

    async fn attempt(
        ctx: &SessionContext,
        data: Vec<u8>,
        script: Script,
    ) -> (Result<(), ApplicationError>, usize) {
        let (ours, theirs) = duplex(64 * 1024);
        let peer = tokio::spawn(serve(theirs, data, script));

        let mut framer = Framer::new(ours, ctx.config.read_timeout);
        let dispatcher = ctx.dispatcher();
        let mut state = unchoked();
        let result = BlockDownloader::new(&mut framer, &dispatcher, &mut state, ctx, 1)
            .run()
            .await;
        drop(framer);

        (result, peer.await.unwrap())
    }

    #[test]
    fn batches_cover_every_block_in_order() {
        let mut blocks = piece::partition(1_000_000);
        let mut seen = Vec::new();

        loop {
            let batch = next_batch(&blocks, &[], MAX_REQUESTS);
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() <= MAX_REQUESTS);
            for &b in &batch {
                blocks[b].state = BlockState::Downloaded;
            }
            seen.extend(batch);
        }

        assert_eq!(seen, (0..61).collect::<Vec<_>>());
    }

    #[test]
    fn unfinished_blocks_are_requested_again() {
        let mut blocks = piece::partition(5 * BLOCK_LEN);
        blocks[0].state = BlockState::Downloaded;
        blocks[2].state = BlockState::Downloaded;
        assert_eq!(next_batch(&blocks, &[], MAX_REQUESTS), vec![1, 3, 4]);
        // Blocks already requested are not asked for twice.
        assert_eq!(next_batch(&blocks, &[1, 3], 1), vec![4]);
    }

    #[test]
    fn requests_are_concatenated() {
        let blocks = piece::partition(40_000);
        let buf = encode_requests(9, &blocks, &[1, 2]);
        assert_eq!(buf.len(), 34);

        let mut cursor = buf.as_slice();
        assert_eq!(
            Message::read_from(&mut cursor).unwrap(),
            Message::Request {
                index:  9,
                begin:  16384,
                length: 16384,
            }
        );
        assert_eq!(
            Message::read_from(&mut cursor).unwrap(),
            Message::Request {
                index:  9,
                begin:  32768,
                length: 40_000 - 32768,
            }
        );
    }

    #[tokio::test]
    async fn downloads_and_verifies_a_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let script = Script {
            have_first: Some(0),
            ..Script::default()
        };
        let (result, most) = attempt(&ctx, data.clone(), script).await;

        result.unwrap();
        assert!(most <= MAX_REQUESTS);
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Complete));
        // The have that arrived mid-download was applied.
        assert_eq!(ctx.registry.status(0), Some(PieceStatus::Available));

        let stored = std::fs::read(dir.path().join("store.bin")).unwrap();
        assert_eq!(&stored[PIECE_LEN..], &data[..]);
    }

    #[tokio::test]
    async fn choke_pauses_and_unchoke_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let script = Script {
            choke_once: true,
            ..Script::default()
        };
        let (result, _) = attempt(&ctx, data, script).await;

        result.unwrap();
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Complete));
    }

    #[tokio::test]
    async fn wrong_piece_index_aborts_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let script = Script {
            wrong_index: true,
            ..Script::default()
        };
        let (result, _) = attempt(&ctx, data, script).await;

        assert!(matches!(result, Err(ApplicationError::ProtocolError(_))));
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Available));
    }

    #[tokio::test]
    async fn window_holds_after_a_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let (ours, theirs) = duplex(64 * 1024);
        let stall = ctx.config.read_timeout + Duration::from_millis(100);
        let peer = tokio::spawn(serve_after_stall(theirs, data.clone(), stall));

        let mut framer = Framer::new(ours, ctx.config.read_timeout);
        let dispatcher = ctx.dispatcher();
        let mut state = unchoked();
        let result = BlockDownloader::new(&mut framer, &dispatcher, &mut state, &ctx, 1)
            .run()
            .await;
        drop(framer);
        let most = peer.await.unwrap();

        result.unwrap();
        assert!(most <= MAX_REQUESTS, "peer held {} requests", most);
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Complete));
        let stored = std::fs::read(dir.path().join("store.bin")).unwrap();
        assert_eq!(&stored[PIECE_LEN..], &data[..]);
    }

    #[tokio::test]
    async fn block_matching_no_request_aborts_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let script = Script {
            bad_offset: true,
            ..Script::default()
        };
        let (result, _) = attempt(&ctx, data, script).await;

        match result {
            Err(ApplicationError::ProtocolError(m)) => assert!(m.contains("unrequested")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Available));
    }

    #[tokio::test]
    async fn duplicate_block_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, Sha1::digest(&data).into()).await;

        let script = Script {
            duplicate_first: true,
            ..Script::default()
        };
        let (result, most) = attempt(&ctx, data.clone(), script).await;

        result.unwrap();
        assert!(most <= MAX_REQUESTS);
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Complete));
        let stored = std::fs::read(dir.path().join("store.bin")).unwrap();
        assert_eq!(&stored[PIECE_LEN..], &data[..]);
    }

    #[tokio::test]
    async fn corrupt_piece_fails_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let data = content();
        let ctx = context(&dir, [0xee; 20]).await;

        let (result, _) = attempt(&ctx, data, Script::default()).await;

        match result {
            Err(ApplicationError::ProtocolError(m)) => assert!(m.contains("hash")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(ctx.registry.status(1), Some(PieceStatus::Available));
    }

    #[tokio::test]
    async fn unavailable_piece_is_not_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, [0; 20]).await;

        let (ours, _theirs) = duplex(1024);
        let mut framer = Framer::new(ours, ctx.config.read_timeout);
        let dispatcher = ctx.dispatcher();
        let mut state = unchoked();

        let err = BlockDownloader::new(&mut framer, &dispatcher, &mut state, &ctx, 0)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::PeerError(_)));
        assert_eq!(ctx.registry.status(0), Some(PieceStatus::NotAvailable));
    }
}
