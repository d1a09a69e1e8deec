//! Session lifecycle: handshake, encrypted messaging and file transfers

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use crypto_session::{
    ChannelReceiver, ChannelSender, IdentityKeyPair, PUBLIC_KEY_SIZE, SecureChannel, SessionKeys,
    begin_handshake, complete_handshake, fingerprint,
};
use net_transport::{FramedTransport, Transport, TransportStats};
use parking_lot::RwLock;
use shared_protocol::{
    CloseMessage, FileChunk, Frame, FrameCodec, FrameKind, HandshakeMessage, ProtocolError,
    SessionId, SessionState, TransferManifest,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    InboundTransfer, OutboundTransfer, ProgressRegistry, SessionConfig, SessionError,
    SessionResult, TransferDirection, TransferProgress, TransferStatus,
};

/// Sequence number of the handshake hello frame
const HELLO_SEQUENCE: u64 = 0;

/// Sequence number of the key confirmation frame
const CONFIRM_SEQUENCE: u64 = 1;

/// Failed transfer ids remembered so their trailing chunks can be ignored
const FAILED_TRANSFER_MEMORY: usize = 256;

/// Event surfaced by [`Session::receive_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Application message
    Message(Bytes),
    /// Peer announced a file
    TransferStarted(TransferManifest),
    /// A file was received and verified
    TransferCompleted { transfer_id: u64, path: PathBuf },
    /// Peer closed the session
    PeerClosed { reason: String },
}

/// Session statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub transfers_sent: u64,
    pub transfers_received: u64,
    pub transport: TransportStats,
}

/// State observable from outside the session
struct SessionShared {
    state: RwLock<SessionState>,
    stats: RwLock<SessionStats>,
    close_requested: AtomicBool,
    close_notify: Notify,
}

/// Cloneable observer of a session, usable from other tasks
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.read()
    }

    /// Ask the session to close.
    ///
    /// The owner of the session performs the close at its next suspension
    /// point: between two chunks of an outgoing file, while waiting for
    /// inbound frames, or at the start of the next operation.
    pub fn request_close(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.shared.close_notify.notify_one();
    }

    pub fn is_close_requested(&self) -> bool {
        self.shared.close_requested.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// One encrypted connection to a peer
pub struct Session<T> {
    id: SessionId,
    config: SessionConfig,
    transport: FramedTransport<T>,
    shared: Arc<SessionShared>,
    sender: Option<ChannelSender>,
    receiver: Option<ChannelReceiver>,
    remote_identity: Option<[u8; PUBLIC_KEY_SIZE]>,
    inbound: HashMap<u64, InboundTransfer>,
    /// Transfers that failed locally; their remaining chunks are ignored
    failed_transfers: HashSet<u64>,
    /// Insertion order of `failed_transfers`, oldest first
    failed_order: VecDeque<u64>,
    pending_events: VecDeque<SessionEvent>,
    progress: ProgressRegistry,
    next_transfer_id: u64,
}

/// Open a session over `transport` and run the handshake
pub async fn connect<T: Transport>(
    transport: T,
    local_identity: Option<&IdentityKeyPair>,
    config: SessionConfig,
) -> SessionResult<Session<T>> {
    let mut session = Session::new(transport, config)?;
    session.connect(local_identity).await?;
    Ok(session)
}

fn late_handshake(frame: &Frame) -> SessionError {
    SessionError::MalformedFrame(format!(
        "handshake frame {} after the session was established",
        frame.sequence()
    ))
}

fn draw_transfer_id() -> u64 {
    rand::random::<u64>().max(1)
}

impl<T: Transport> Session<T> {
    /// Wrap a transport; the session starts Disconnected
    pub fn new(transport: T, config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        let codec = FrameCodec::new(config.max_frame_size);

        Ok(Self {
            id: SessionId::new(),
            transport: FramedTransport::with_codec(transport, codec),
            config,
            shared: Arc::new(SessionShared {
                state: RwLock::new(SessionState::Disconnected),
                stats: RwLock::new(SessionStats::default()),
                close_requested: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
            sender: None,
            receiver: None,
            remote_identity: None,
            inbound: HashMap::new(),
            failed_transfers: HashSet::new(),
            failed_order: VecDeque::new(),
            pending_events: VecDeque::new(),
            progress: ProgressRegistry::new(),
            next_transfer_id: draw_transfer_id(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.read()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            shared: self.shared.clone(),
        }
    }

    /// Verified Ed25519 identity of the peer, if it presented one
    pub fn remote_identity(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.remote_identity.as_ref()
    }

    /// Id the next [`Session::send_file`] call will use
    pub fn next_transfer_id(&self) -> u64 {
        self.next_transfer_id
    }

    /// Register a callback for one transfer, in either direction
    pub fn on_progress<F>(&self, transfer_id: u64, callback: F)
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress.register(transfer_id, Arc::new(callback));
    }

    /// Register a callback for every transfer of this session
    pub fn on_any_progress<F>(&self, callback: F)
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.progress.register_global(Arc::new(callback));
    }

    fn transition(&self, next: SessionState) -> SessionResult<()> {
        let mut state = self.shared.state.write();
        if !state.can_transition_to(next) {
            return Err(ProtocolError::InvalidStateTransition {
                from: *state,
                to: next,
            }
            .into());
        }
        debug!("[{}] {} -> {}", self.id.short(), *state, next);
        *state = next;
        Ok(())
    }

    fn require_established(&self, operation: &'static str) -> SessionResult<()> {
        match self.state() {
            SessionState::Established => Ok(()),
            SessionState::Closed => Err(SessionError::SessionClosed),
            state => Err(SessionError::InvalidState { operation, state }),
        }
    }

    fn close_requested(&self) -> bool {
        self.shared.close_requested.load(Ordering::SeqCst)
    }

    fn sync_transport_stats(&self) {
        self.shared.stats.write().transport = self.transport.stats();
    }

    /// Run the handshake: Disconnected -> Handshaking -> Established.
    ///
    /// Any failure, including the handshake timeout, leaves the session
    /// Closed. There is no retry.
    pub async fn connect(&mut self, local_identity: Option<&IdentityKeyPair>) -> SessionResult<()> {
        match self.state() {
            SessionState::Disconnected => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "connect",
                    state,
                });
            }
        }
        self.transition(SessionState::Handshaking)?;
        info!("[{}] Starting handshake", self.id.short());

        let timeout = self.config.handshake_timeout();
        let result = match tokio::time::timeout(timeout, self.run_handshake(local_identity)).await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeFailed(format!(
                "no response within {} ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(keys) => {
                let (sender, receiver) = SecureChannel::new(&keys).split();
                self.sender = Some(sender);
                self.receiver = Some(receiver);
                self.remote_identity = keys.remote_identity().copied();
                self.transition(SessionState::Established)?;
                self.sync_transport_stats();

                match &self.remote_identity {
                    Some(identity) => info!(
                        "[{}] Session established with {}",
                        self.id.short(),
                        fingerprint(identity)
                    ),
                    None => info!(
                        "[{}] Session established (peer unauthenticated)",
                        self.id.short()
                    ),
                }
                Ok(())
            }
            Err(e) => {
                warn!("[{}] Handshake failed: {}", self.id.short(), e);
                self.force_close().await;
                Err(e)
            }
        }
    }

    async fn run_handshake(
        &mut self,
        local_identity: Option<&IdentityKeyPair>,
    ) -> SessionResult<SessionKeys> {
        let policy = self.config.peer_policy()?;
        let (hello, secret) = begin_handshake(local_identity);
        let hello_bytes = hello.to_bytes().map_err(ProtocolError::from)?;
        self.transport
            .send_frame(&Frame::handshake(HELLO_SEQUENCE, hello_bytes))
            .await?;

        let payload = self.read_handshake_frame(HELLO_SEQUENCE).await?;
        let remote = HandshakeMessage::from_bytes(&payload).map_err(|e| {
            SessionError::HandshakeFailed(format!("unreadable handshake message: {}", e))
        })?;
        let keys = complete_handshake(secret, &remote, &policy)?;

        self.transport
            .send_frame(&Frame::handshake(
                CONFIRM_SEQUENCE,
                keys.confirmation_tag().to_vec(),
            ))
            .await?;
        let tag = self.read_handshake_frame(CONFIRM_SEQUENCE).await?;
        keys.verify_confirmation(&tag)?;

        Ok(keys)
    }

    async fn read_handshake_frame(&mut self, sequence: u64) -> SessionResult<Bytes> {
        let frame = self.transport.read_frame().await?;
        if frame.kind() != FrameKind::Handshake || frame.sequence() != sequence {
            return Err(SessionError::HandshakeFailed(format!(
                "expected handshake frame {}, got {} frame {}",
                sequence,
                frame.kind(),
                frame.sequence()
            )));
        }
        if !frame.verify_integrity() {
            return Err(SessionError::HandshakeFailed(format!(
                "handshake frame {} failed its integrity check",
                sequence
            )));
        }
        Ok(frame.payload().clone())
    }

    /// Send one application message
    pub async fn send(&mut self, message: &[u8]) -> SessionResult<()> {
        self.require_established("send")?;
        if self.close_requested() {
            self.close_on_request().await;
            return Err(SessionError::SessionClosed);
        }

        let max = self.config.max_message_size();
        if message.len() > max {
            return Err(SessionError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }

        match self.send_sealed(FrameKind::Data, message, true).await {
            Ok(()) => {
                self.shared.stats.write().messages_sent += 1;
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn send_sealed(
        &mut self,
        kind: FrameKind,
        plaintext: &[u8],
        flush: bool,
    ) -> SessionResult<()> {
        let sender = self.sender.as_mut().ok_or(SessionError::SessionClosed)?;
        let frame = sender.seal(kind, plaintext)?;
        if flush {
            self.transport.send_frame(&frame).await?;
        } else {
            self.transport.write_frame(&frame).await?;
        }
        self.sync_transport_stats();
        Ok(())
    }

    /// Wait for the next application message.
    ///
    /// File frames are handled internally; a peer close surfaces as
    /// [`SessionError::SessionClosed`].
    pub async fn receive(&mut self) -> SessionResult<Bytes> {
        loop {
            match self.receive_event().await? {
                SessionEvent::Message(message) => return Ok(message),
                SessionEvent::PeerClosed { reason } => {
                    debug!("[{}] receive() ended by peer: {}", self.id.short(), reason);
                    return Err(SessionError::SessionClosed);
                }
                SessionEvent::TransferStarted(_) | SessionEvent::TransferCompleted { .. } => {}
            }
        }
    }

    /// Wait for the next inbound event
    pub async fn receive_event(&mut self) -> SessionResult<SessionEvent> {
        loop {
            if let Some(event) = self.pending_events.pop_front() {
                return Ok(event);
            }
            self.require_established("receive")?;
            if self.close_requested() {
                self.close_on_request().await;
                return Err(SessionError::SessionClosed);
            }

            let shared = self.shared.clone();
            let frame = tokio::select! {
                frame = self.transport.read_frame() => Some(frame),
                _ = shared.close_notify.notified() => None,
            };
            let Some(frame) = frame else {
                continue;
            };
            self.sync_transport_stats();

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e.into()).await),
            };

            match self.dispatch(frame).await {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(e) => return Err(self.fail(e).await),
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> SessionResult<Option<SessionEvent>> {
        if frame.kind() == FrameKind::Handshake {
            return Err(late_handshake(&frame));
        }

        let receiver = self.receiver.as_mut().ok_or(SessionError::SessionClosed)?;
        let plaintext = Bytes::from(receiver.open(&frame)?);

        match frame.kind() {
            FrameKind::Data => {
                self.shared.stats.write().messages_received += 1;
                Ok(Some(SessionEvent::Message(plaintext)))
            }
            FrameKind::FileManifest => {
                let manifest =
                    TransferManifest::from_bytes(&plaintext).map_err(ProtocolError::from)?;
                self.start_inbound(manifest).await
            }
            FrameKind::FileChunk => {
                let chunk = FileChunk::decode(plaintext)?;
                self.accept_chunk(chunk).await
            }
            FrameKind::Close => {
                let reason = CloseMessage::from_bytes(&plaintext)
                    .map(|close| close.reason)
                    .unwrap_or_else(|_| "unspecified".to_string());
                info!("[{}] Peer closed the session: {}", self.id.short(), reason);
                self.transition(SessionState::Closing)?;
                self.abort_inbound().await;
                self.finish_close().await;
                Ok(Some(SessionEvent::PeerClosed { reason }))
            }
            FrameKind::Handshake => Err(late_handshake(&frame)),
        }
    }

    async fn start_inbound(
        &mut self,
        manifest: TransferManifest,
    ) -> SessionResult<Option<SessionEvent>> {
        let transfer_id = manifest.transfer_id;
        if self.inbound.contains_key(&transfer_id) {
            return Err(ProtocolError::InvalidManifest(format!(
                "transfer {:016x} is already in progress",
                transfer_id
            ))
            .into());
        }
        let limit = self.config.max_inbound_transfers;
        let accepted = if self.inbound.len() >= limit {
            Err(ProtocolError::InvalidManifest(format!(
                "{} inbound transfers already in progress",
                limit
            )))
        } else {
            manifest.validate(self.config.max_chunk_size(), self.config.max_transfer_size)
        };
        if let Err(e) = accepted {
            warn!(
                "[{}] Rejecting transfer {:016x}: {}",
                self.id.short(),
                transfer_id,
                e
            );
            self.mark_failed(transfer_id);
            return Err(e.into());
        }

        let transfer = match InboundTransfer::create(manifest.clone(), &self.config.download_dir)
            .await
        {
            Ok(transfer) => transfer,
            Err(e) => {
                self.mark_failed(transfer_id);
                return Err(e);
            }
        };
        info!(
            "[{}] Receiving {} ({} bytes) as transfer {:016x}",
            self.id.short(),
            manifest.filename,
            manifest.total_size,
            transfer_id
        );
        self.progress
            .notify(&transfer.progress(TransferStatus::Started));

        if transfer.is_complete() {
            self.inbound.insert(transfer_id, transfer);
            let completed = self.complete_inbound(transfer_id).await?;
            self.pending_events.push_back(completed);
        } else {
            self.inbound.insert(transfer_id, transfer);
        }
        Ok(Some(SessionEvent::TransferStarted(manifest)))
    }

    fn mark_failed(&mut self, transfer_id: u64) {
        if !self.failed_transfers.insert(transfer_id) {
            return;
        }
        self.failed_order.push_back(transfer_id);
        if self.failed_order.len() > FAILED_TRANSFER_MEMORY {
            if let Some(oldest) = self.failed_order.pop_front() {
                self.failed_transfers.remove(&oldest);
            }
        }
    }

    async fn accept_chunk(&mut self, chunk: FileChunk) -> SessionResult<Option<SessionEvent>> {
        let transfer_id = chunk.transfer_id;
        let Some(transfer) = self.inbound.get_mut(&transfer_id) else {
            if self.failed_transfers.contains(&transfer_id) {
                debug!(
                    "[{}] Ignoring chunk {} of failed transfer {:016x}",
                    self.id.short(),
                    chunk.index,
                    transfer_id
                );
                return Ok(None);
            }
            return Err(ProtocolError::InvalidChunk(format!(
                "chunk for unknown transfer {:016x}",
                transfer_id
            ))
            .into());
        };

        match transfer.accept_chunk(&chunk).await {
            Ok(true) => {
                let progress = transfer.progress(TransferStatus::InProgress);
                let complete = transfer.is_complete();
                self.progress.notify(&progress);
                if complete {
                    return self.complete_inbound(transfer_id).await.map(Some);
                }
                Ok(None)
            }
            Ok(false) => Ok(None),
            Err(e) => {
                if let Some(mut transfer) = self.inbound.remove(&transfer_id) {
                    transfer.abort().await;
                    self.progress
                        .notify(&transfer.progress(TransferStatus::Failed));
                }
                self.mark_failed(transfer_id);
                Err(e)
            }
        }
    }

    async fn complete_inbound(&mut self, transfer_id: u64) -> SessionResult<SessionEvent> {
        let Some(mut transfer) = self.inbound.remove(&transfer_id) else {
            return Err(SessionError::TransferAborted { transfer_id });
        };

        match transfer.finish().await {
            Ok(path) => {
                info!(
                    "[{}] Transfer {:016x} complete: {}",
                    self.id.short(),
                    transfer_id,
                    path.display()
                );
                self.shared.stats.write().transfers_received += 1;
                self.progress
                    .notify(&transfer.progress(TransferStatus::Completed));
                Ok(SessionEvent::TransferCompleted { transfer_id, path })
            }
            Err(e) => {
                self.mark_failed(transfer_id);
                self.progress
                    .notify(&transfer.progress(TransferStatus::Failed));
                Err(e)
            }
        }
    }

    async fn abort_inbound(&mut self) {
        for (transfer_id, mut transfer) in self.inbound.drain() {
            debug!(
                "[{}] Aborting inbound transfer {:016x}",
                self.id.short(),
                transfer_id
            );
            transfer.abort().await;
            self.progress
                .notify(&transfer.progress(TransferStatus::Aborted));
        }
    }

    /// Send a file and return its transfer id.
    ///
    /// Returns once the last chunk has been written to the transport. A close
    /// requested through a [`SessionHandle`] while the file is being sent
    /// aborts the transfer with [`SessionError::TransferAborted`] and closes
    /// the session.
    pub async fn send_file(&mut self, path: impl AsRef<Path>) -> SessionResult<u64> {
        self.require_established("send_file")?;
        if self.close_requested() {
            self.close_on_request().await;
            return Err(SessionError::SessionClosed);
        }

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id = draw_transfer_id();

        let path = path.as_ref();
        let mut transfer =
            match OutboundTransfer::open(path, transfer_id, self.config.chunk_size).await {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!(
                        "[{}] Cannot send {}: {}",
                        self.id.short(),
                        path.display(),
                        e
                    );
                    self.progress.notify(&TransferProgress {
                        transfer_id,
                        direction: TransferDirection::Outbound,
                        filename: path
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        status: TransferStatus::Failed,
                        bytes_done: 0,
                        bytes_total: 0,
                        chunks_done: 0,
                        chunks_total: 0,
                    });
                    return Err(e);
                }
            };
        let manifest = transfer.manifest().to_bytes().map_err(ProtocolError::from)?;
        if let Err(e) = self
            .send_sealed(FrameKind::FileManifest, &manifest, true)
            .await
        {
            return Err(self.fail(e).await);
        }
        info!(
            "[{}] Sending {} ({} bytes) as transfer {:016x}",
            self.id.short(),
            transfer.manifest().filename,
            transfer.manifest().total_size,
            transfer_id
        );
        self.progress
            .notify(&transfer.progress(TransferStatus::Started));

        loop {
            if self.close_requested() {
                info!(
                    "[{}] Transfer {:016x} aborted by close request",
                    self.id.short(),
                    transfer_id
                );
                self.progress
                    .notify(&transfer.progress(TransferStatus::Aborted));
                drop(transfer);
                self.close_on_request().await;
                return Err(SessionError::TransferAborted { transfer_id });
            }

            let chunk = match transfer.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "[{}] Reading transfer {:016x} failed: {}",
                        self.id.short(),
                        transfer_id,
                        e
                    );
                    self.progress
                        .notify(&transfer.progress(TransferStatus::Failed));
                    return Err(e);
                }
            };

            if let Err(e) = self
                .send_sealed(FrameKind::FileChunk, &chunk.encode(), false)
                .await
            {
                self.progress
                    .notify(&transfer.progress(TransferStatus::Failed));
                return Err(self.fail(e).await);
            }
            self.progress
                .notify(&transfer.progress(TransferStatus::InProgress));
        }

        if let Err(e) = self.transport.flush().await {
            self.progress
                .notify(&transfer.progress(TransferStatus::Failed));
            return Err(self.fail(e.into()).await);
        }
        self.shared.stats.write().transfers_sent += 1;
        self.progress
            .notify(&transfer.progress(TransferStatus::Completed));
        Ok(transfer_id)
    }

    /// Close the session: Closing, then Closed.
    ///
    /// Inbound transfers are aborted and, if the session was established, a
    /// Close frame is sent before the transport is shut down.
    pub async fn close(&mut self) -> SessionResult<()> {
        self.close_with_reason("session closed").await
    }

    pub async fn close_with_reason(&mut self, reason: &str) -> SessionResult<()> {
        let previous = self.state();
        if previous.is_terminal() {
            return Err(SessionError::SessionClosed);
        }
        self.transition(SessionState::Closing)?;
        info!("[{}] Closing session: {}", self.id.short(), reason);

        self.abort_inbound().await;

        if previous.is_established() {
            let notice = CloseMessage::new(reason)
                .to_bytes()
                .map_err(ProtocolError::from);
            let sent = match notice {
                Ok(notice) => self.send_sealed(FrameKind::Close, &notice, true).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                warn!("[{}] Could not send close notice: {}", self.id.short(), e);
            }
        }

        self.finish_close().await;
        Ok(())
    }

    async fn close_on_request(&mut self) {
        if let Err(e) = self.close_with_reason("close requested").await {
            debug!("[{}] Close request ignored: {}", self.id.short(), e);
        }
    }

    /// Shut down the transport, drop the keys and enter Closed
    async fn finish_close(&mut self) {
        if let Err(e) = self.transport.shutdown().await {
            debug!("[{}] Transport shutdown failed: {}", self.id.short(), e);
        }
        self.sender = None;
        self.receiver = None;
        self.sync_transport_stats();

        let mut state = self.shared.state.write();
        if !state.is_terminal() {
            *state = SessionState::Closed;
        }
        drop(state);
        info!("[{}] Session closed", self.id.short());
    }

    /// Tear the session down without a Close notice
    async fn force_close(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.abort_inbound().await;
        self.finish_close().await;
    }

    /// Close the session if `err` is fatal, then hand the error back
    async fn fail(&mut self, err: SessionError) -> SessionError {
        if err.is_fatal() {
            warn!("[{}] Fatal session error: {}", self.id.short(), err);
            self.force_close().await;
        } else {
            debug!("[{}] Recoverable session error: {}", self.id.short(), err);
        }
        err
    }
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.shared.state.read())
            .field("inbound_transfers", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_protocol::encode_frame;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    fn test_config() -> SessionConfig {
        SessionConfig {
            handshake_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    async fn established_pair() -> (Session<DuplexStream>, Session<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let (alice, bob) = tokio::join!(
            connect(a, None, test_config()),
            connect(b, None, test_config())
        );
        (alice.unwrap(), bob.unwrap())
    }

    #[tokio::test]
    async fn test_operations_gated_on_state() {
        let (a, _b) = duplex(1024);
        let mut session = Session::new(a, test_config()).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert!(matches!(
            session.send(b"early").await,
            Err(SessionError::InvalidState {
                operation: "send",
                state: SessionState::Disconnected
            })
        ));
        assert!(matches!(
            session.receive().await,
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            session.send_file("/nonexistent").await,
            Err(SessionError::InvalidState { .. })
        ));

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.send(b"late").await,
            Err(SessionError::SessionClosed)
        ));
        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::SessionClosed)
        ));
        assert!(matches!(
            session.close().await,
            Err(SessionError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (a, _b) = duplex(1024);
        let config = SessionConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Session::new(a, config),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_establishes_both_sides() {
        let (alice, bob) = established_pair().await;
        assert_eq!(alice.state(), SessionState::Established);
        assert_eq!(bob.state(), SessionState::Established);
        assert!(alice.remote_identity().is_none());
        assert_ne!(alice.id(), bob.id());
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let (mut alice, _bob) = established_pair().await;
        assert!(matches!(
            alice.connect(None).await,
            Err(SessionError::InvalidState {
                operation: "connect",
                state: SessionState::Established
            })
        ));
        assert_eq!(alice.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_identity_pinning() {
        let alice_id = IdentityKeyPair::generate();
        let bob_id = IdentityKeyPair::generate();
        let stranger = IdentityKeyPair::generate();

        let (a, b) = duplex(64 * 1024);
        let alice_config = test_config().with_expected_peer(bob_id.public_key_bytes());
        let bob_config = test_config().with_expected_peer(alice_id.public_key_bytes());
        let (alice, bob) = tokio::join!(
            connect(a, Some(&alice_id), alice_config),
            connect(b, Some(&bob_id), bob_config)
        );
        let (alice, bob) = (alice.unwrap(), bob.unwrap());
        assert_eq!(alice.remote_identity(), Some(&bob_id.public_key_bytes()));
        assert_eq!(bob.remote_identity(), Some(&alice_id.public_key_bytes()));

        let (a, b) = duplex(64 * 1024);
        let mut alice = Session::new(
            a,
            test_config().with_expected_peer(bob_id.public_key_bytes()),
        )
        .unwrap();
        let mut impostor = Session::new(b, test_config()).unwrap();
        let (alice_result, _) =
            tokio::join!(alice.connect(Some(&alice_id)), impostor.connect(Some(&stranger)));

        assert!(matches!(
            alice_result,
            Err(SessionError::AuthenticationFailed(_))
        ));
        assert_eq!(alice.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unsigned_peer_rejected_when_pinned() {
        let bob_id = IdentityKeyPair::generate();
        let (a, b) = duplex(64 * 1024);
        let mut alice = Session::new(
            a,
            test_config().with_expected_peer(bob_id.public_key_bytes()),
        )
        .unwrap();
        let mut bob = Session::new(b, test_config()).unwrap();

        let (alice_result, _) = tokio::join!(alice.connect(None), bob.connect(None));
        assert!(matches!(
            alice_result,
            Err(SessionError::AuthenticationFailed(_))
        ));
        assert_eq!(alice.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_handshake_closes_session() {
        let (a, mut raw) = duplex(64 * 1024);
        let mut session = Session::new(a, test_config()).unwrap();

        let garbage = Frame::handshake(HELLO_SEQUENCE, vec![0xEE; 7]);
        raw.write_all(&encode_frame(&garbage).unwrap()).await.unwrap();

        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::HandshakeFailed(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_corrupted_handshake_frame_rejected() {
        let (a, mut raw) = duplex(64 * 1024);
        let mut session = Session::new(a, test_config()).unwrap();

        let (hello, _secret) = begin_handshake(None);
        let frame = Frame::handshake(HELLO_SEQUENCE, hello.to_bytes().unwrap());
        let mut bytes = encode_frame(&frame).unwrap().to_vec();
        bytes[20] ^= 0x80;
        raw.write_all(&bytes).await.unwrap();

        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::HandshakeFailed(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, _silent) = duplex(64 * 1024);
        let config = SessionConfig {
            handshake_timeout_ms: 200,
            ..Default::default()
        };
        let mut session = Session::new(a, config).unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::HandshakeFailed(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_message_too_large_is_recoverable() {
        let (a, b) = duplex(64 * 1024);
        let config = SessionConfig {
            max_frame_size: 1024,
            chunk_size: 512,
            ..test_config()
        };
        let (alice, bob) = tokio::join!(
            connect(a, None, config.clone()),
            connect(b, None, config)
        );
        let (mut alice, mut bob) = (alice.unwrap(), bob.unwrap());

        let too_big = vec![0u8; 2048];
        assert!(matches!(
            alice.send(&too_big).await,
            Err(SessionError::MessageTooLarge { size: 2048, .. })
        ));
        assert_eq!(alice.state(), SessionState::Established);

        alice.send(b"still fine").await.unwrap();
        assert_eq!(bob.receive().await.unwrap(), Bytes::from_static(b"still fine"));
    }

    #[tokio::test]
    async fn test_handle_observes_session() {
        let (mut alice, mut bob) = established_pair().await;
        let handle = alice.handle();
        assert_eq!(handle.session_id(), alice.id());
        assert_eq!(handle.state(), SessionState::Established);
        assert!(!handle.is_close_requested());

        alice.send(b"one").await.unwrap();
        bob.receive().await.unwrap();
        assert_eq!(handle.stats().messages_sent, 1);
        assert!(handle.stats().transport.frames_written >= 3);

        alice.close().await.unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_request_close_wakes_receiver() {
        let (mut alice, _bob) = established_pair().await;
        let handle = alice.handle();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.request_close();
        });

        assert!(matches!(
            alice.receive_event().await,
            Err(SessionError::SessionClosed)
        ));
        assert_eq!(alice.state(), SessionState::Closed);
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_transfer_memory_is_bounded() {
        let (a, _b) = duplex(1024);
        let mut session = Session::new(a, test_config()).unwrap();

        for transfer_id in 0..(FAILED_TRANSFER_MEMORY as u64 + 10) {
            session.mark_failed(transfer_id);
        }
        session.mark_failed(FAILED_TRANSFER_MEMORY as u64 + 9);

        assert_eq!(session.failed_transfers.len(), FAILED_TRANSFER_MEMORY);
        assert_eq!(session.failed_order.len(), FAILED_TRANSFER_MEMORY);
        assert!(!session.failed_transfers.contains(&0));
        assert!(session.failed_transfers.contains(&10));
    }

    #[tokio::test]
    async fn test_handshake_frame_after_establishment_is_fatal() {
        let (a, b) = duplex(64 * 1024);
        let (alice, bob) = tokio::join!(
            connect(a, None, test_config()),
            connect(b, None, test_config())
        );
        let mut alice = alice.unwrap();
        let bob = bob.unwrap();

        let mut raw = FramedTransport::new(bob.transport.into_inner());
        raw.send_frame(&Frame::handshake(2, b"again".to_vec()))
            .await
            .unwrap();

        assert!(matches!(
            alice.receive_event().await,
            Err(SessionError::MalformedFrame(_))
        ));
        assert_eq!(alice.state(), SessionState::Closed);
    }
}
