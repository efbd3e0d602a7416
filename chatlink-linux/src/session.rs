//! Session controller: listener and dialer tasks, the peer registry, relay to
//! every other peer, history replay for new joiners, and failure recovery.
//!
//! All registry, history and state mutations happen under one async mutex.
//! Worker tasks call back through [`PeerHooks`], which holds only a weak
//! reference so closed workers never keep the session alive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chatlink_core::session::{file_received_text, TOAST_CONNECTION_LOST, TOAST_CONNECT_FAILED};
use chatlink_core::{
    encode_message, integrity, FrameEvent, HistoryBuffer, Message, ReceivedFile, SessionEvent,
    SessionState,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::FileStore;
use crate::transport::{Connection, Listener, Transport};
use crate::worker::{ConnectionWorker, PeerEvents, WorkerSettings};

/// Toast shown when a local file cannot be read for sending.
pub const TOAST_FILE_UNREADABLE: &str = "Unable to read file";
/// Toast shown when a received file cannot be written to the download directory.
pub const TOAST_FILE_SAVE_FAILED: &str = "Unable to save file";
/// Toast shown when the listener cannot be bound or stops accepting.
pub const TOAST_LISTEN_FAILED: &str = "Unable to listen for devices";

/// Session-wide settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Author name on locally sent messages and files.
    pub display_name: String,
    pub worker: WorkerSettings,
}

/// Payload for [`SessionController::broadcast`].
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Encoded before sending; TEXT messages are also kept for replay.
    Message(Message),
    /// Forwarded verbatim, never kept.
    Raw(Bytes),
}

struct PeerConnection {
    display_name: String,
    worker: ConnectionWorker,
}

struct ListenerTask {
    id: u64,
    task: JoinHandle<()>,
}

struct PendingDial {
    id: u64,
    target: String,
    task: JoinHandle<()>,
}

struct Session {
    state: SessionState,
    is_server: bool,
    listener: Option<ListenerTask>,
    dial: Option<PendingDial>,
    peers: HashMap<String, PeerConnection>,
    history: HistoryBuffer,
    next_id: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::None,
            is_server: true,
            listener: None,
            dial: None,
            peers: HashMap::new(),
            history: HistoryBuffer::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current_dial(&self, id: u64) -> bool {
        self.dial.as_ref().map(|d| d.id) == Some(id)
    }

    fn is_current_listener(&self, id: u64) -> bool {
        self.listener.as_ref().map(|l| l.id) == Some(id)
    }
}

struct Shared<T: Transport> {
    transport: T,
    store: FileStore,
    settings: SessionSettings,
    events: mpsc::UnboundedSender<SessionEvent>,
    session: Mutex<Session>,
    me: Weak<Shared<T>>,
}

/// Owns the session. Cheap to clone; clones share state.
pub struct SessionController<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for SessionController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> SessionController<T> {
    pub fn new(
        transport: T,
        store: FileStore,
        settings: SessionSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            transport,
            store,
            settings,
            events,
            session: Mutex::new(Session::new()),
            me: me.clone(),
        });
        Self { shared }
    }

    /// Enter server mode and listen. Idempotent.
    pub async fn start(&self) {
        self.set_server(true).await;
    }

    /// Cancel listener and dial, close every peer, clear history, go to NONE.
    pub async fn stop(&self) {
        let (listener, dial, peers) = {
            let mut s = self.shared.session.lock().await;
            let listener = s.listener.take();
            let dial = s.dial.take();
            let peers: Vec<PeerConnection> = s.peers.drain().map(|(_, p)| p).collect();
            // Abort under the lock so no task can act on the old session afterwards.
            if let Some(l) = &listener {
                l.task.abort();
            }
            if let Some(d) = &dial {
                d.task.abort();
            }
            for p in &peers {
                p.worker.close();
            }
            s.history.clear();
            self.shared.set_state(&mut s, SessionState::None);
            (listener, dial, peers)
        };
        info!(peers = peers.len(), "session stopped");
        if let Some(l) = listener {
            let _ = l.task.await;
        }
        if let Some(d) = dial {
            let _ = d.task.await;
        }
        for p in peers {
            p.worker.join().await;
        }
    }

    /// Server mode keeps a listener running. Leaving it discards the replay
    /// history; existing peers stay connected.
    pub async fn set_server(&self, on: bool) {
        let mut s = self.shared.session.lock().await;
        s.is_server = on;
        if on {
            self.shared.ensure_listener(&mut s);
            if s.state == SessionState::None {
                self.shared.set_state(&mut s, SessionState::Listening);
            }
        } else {
            s.history.clear();
        }
    }

    /// Dial one target. A dial still in flight is cancelled first and can never register.
    pub async fn connect_to(&self, target: &str) {
        let mut s = self.shared.session.lock().await;
        if let Some(prev) = s.dial.take() {
            info!(target = %prev.target, "cancelling previous dial");
            prev.task.abort();
        }
        let id = s.next_id();
        let shared = self.shared.clone();
        let owned = target.to_string();
        let task = tokio::spawn(async move { shared.dial(id, owned).await });
        s.dial = Some(PendingDial {
            id,
            target: target.to_string(),
            task,
        });
        info!(target, "dialing");
        self.shared.set_state(&mut s, SessionState::Connecting);
    }

    /// Register an established connection (last connection per address wins)
    /// and replay the history to it.
    pub async fn register_connection(&self, conn: Connection) {
        let mut s = self.shared.session.lock().await;
        self.shared.register(&mut s, conn);
    }

    /// Send to every peer except `origin`. `None` sends to all.
    pub async fn broadcast(&self, payload: Outgoing, origin: Option<&str>) {
        let mut s = self.shared.session.lock().await;
        self.shared.broadcast_locked(&mut s, payload, origin);
    }

    /// Drop one peer. Returns false if it was not registered.
    pub async fn disconnect_peer(&self, address: &str) -> bool {
        let mut s = self.shared.session.lock().await;
        let Some(peer) = s.peers.remove(address) else {
            return false;
        };
        info!(peer = %address, name = %peer.display_name, "disconnecting peer");
        peer.worker.close();
        if s.peers.is_empty() {
            self.shared.relisten(&mut s);
        }
        true
    }

    /// Send a chat line authored locally to every peer.
    pub async fn send_message(&self, text: &str) {
        let msg = Message::text(
            self.shared.settings.display_name.clone(),
            local_time(),
            text,
        );
        let mut s = self.shared.session.lock().await;
        if let Some(bytes) = self.shared.broadcast_locked(&mut s, Outgoing::Message(msg), None) {
            self.shared.notify(SessionEvent::OutboundEcho(bytes.to_vec()));
        }
    }

    /// Send a local file to every peer.
    pub async fn send_file(&self, path: &Path) {
        let file = match self.shared.store.load(path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read file to send");
                self.shared
                    .notify(SessionEvent::Toast(TOAST_FILE_UNREADABLE.to_string()));
                return;
            }
        };
        let header = Message::file_start(
            self.shared.settings.display_name.clone(),
            file.name.clone(),
            file.contents.len() as u64,
        );
        let s = self.shared.session.lock().await;
        for peer in s.peers.values() {
            peer.worker.send_file(&header, file.contents.clone());
        }
        info!(file = %file.name, bytes = file.contents.len(), peers = s.peers.len(), "file sent");
    }

    pub async fn state(&self) -> SessionState {
        self.shared.session.lock().await.state
    }

    pub async fn is_server(&self) -> bool {
        self.shared.session.lock().await.is_server
    }

    /// Registered peers as (address, display name), sorted by address.
    pub async fn peers(&self) -> Vec<(String, String)> {
        let s = self.shared.session.lock().await;
        let mut out: Vec<(String, String)> = s
            .peers
            .iter()
            .map(|(a, p)| (a.clone(), p.display_name.clone()))
            .collect();
        out.sort();
        out
    }

    /// Replay history, oldest first.
    pub async fn history(&self) -> Vec<Message> {
        self.shared.session.lock().await.history.snapshot()
    }
}

impl<T: Transport> Shared<T> {
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, s: &mut Session, state: SessionState) {
        if s.state == state {
            return;
        }
        debug!(from = %s.state, to = %state, "state change");
        s.state = state;
        self.notify(SessionEvent::StateChanged(state));
    }

    fn ensure_listener(&self, s: &mut Session) {
        let alive = s.listener.as_ref().is_some_and(|l| !l.task.is_finished());
        if alive {
            return;
        }
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        let id = s.next_id();
        s.listener = Some(ListenerTask {
            id,
            task: tokio::spawn(shared.listen_loop(id)),
        });
    }

    /// After a failed dial or a lost peer: listen again if serving, otherwise
    /// fall back to NONE once nobody is left.
    fn relisten(&self, s: &mut Session) {
        if s.is_server {
            self.ensure_listener(s);
            self.set_state(s, SessionState::Listening);
        } else if s.peers.is_empty() {
            self.set_state(s, SessionState::None);
        } else {
            self.set_state(s, SessionState::Connected);
        }
    }

    fn register(&self, s: &mut Session, conn: Connection) {
        let id = s.next_id();
        let address = conn.address.clone();
        let display_name = conn.name.clone();
        let hooks: Arc<dyn PeerEvents> = Arc::new(PeerHooks {
            shared: self.me.clone(),
        });
        let worker = ConnectionWorker::spawn(id, conn, self.settings.worker, hooks);
        info!(peer = %address, name = %display_name, "peer connected");

        let history = s.history.snapshot();
        let replaced = s.peers.insert(
            address.clone(),
            PeerConnection {
                display_name: display_name.clone(),
                worker,
            },
        );
        if let Some(old) = replaced {
            info!(peer = %address, "replacing existing connection");
            old.worker.close();
        }
        self.notify(SessionEvent::DeviceConnected(display_name));
        self.set_state(s, SessionState::Connected);
        if let Some(peer) = s.peers.get(&address) {
            peer.worker.send_history(&history);
        }
    }

    /// Returns the bytes sent, or `None` if the message could not be encoded.
    fn broadcast_locked(
        &self,
        s: &mut Session,
        payload: Outgoing,
        origin: Option<&str>,
    ) -> Option<Bytes> {
        let bytes = match payload {
            Outgoing::Message(msg) => {
                let bytes = match encode_message(&msg) {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        warn!(error = %e, "failed to encode message");
                        return None;
                    }
                };
                if msg.is_text() {
                    s.history.push(msg);
                }
                bytes
            }
            Outgoing::Raw(bytes) => bytes,
        };
        for (address, peer) in &s.peers {
            if Some(address.as_str()) == origin {
                continue;
            }
            peer.worker.send(bytes.clone());
        }
        Some(bytes)
    }

    async fn listen_loop(self: Arc<Self>, id: u64) {
        let mut listener = match self.transport.listen().await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "listen failed");
                self.listener_failed(id).await;
                return;
            }
        };
        info!("listening for peers");
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let mut s = self.session.lock().await;
                    self.register(&mut s, conn);
                }
                Err(e) => {
                    error!(error = %e, "accept failed; listener stopped");
                    self.listener_failed(id).await;
                    return;
                }
            }
        }
    }

    /// The listener is gone: stop advertising LISTENING. A later
    /// `set_server(true)` or recovery starts a fresh one.
    async fn listener_failed(&self, id: u64) {
        let mut s = self.session.lock().await;
        if !s.is_current_listener(id) {
            return;
        }
        s.listener = None;
        self.notify(SessionEvent::Toast(TOAST_LISTEN_FAILED.to_string()));
        if s.state == SessionState::Listening {
            let next = if s.peers.is_empty() {
                SessionState::None
            } else {
                SessionState::Connected
            };
            self.set_state(&mut s, next);
        }
    }

    async fn dial(self: Arc<Self>, id: u64, target: String) {
        self.transport.cancel_discovery();
        match self.transport.dial(&target).await {
            Ok(conn) => {
                let mut s = self.session.lock().await;
                if !s.is_current_dial(id) {
                    debug!(target = %target, "superseded dial completed; closing it");
                    return;
                }
                s.dial = None;
                self.register(&mut s, conn);
            }
            Err(e) => {
                warn!(target = %target, error = %e, "dial failed");
                let mut s = self.session.lock().await;
                if !s.is_current_dial(id) {
                    return;
                }
                s.dial = None;
                self.notify(SessionEvent::Toast(TOAST_CONNECT_FAILED.to_string()));
                self.relisten(&mut s);
            }
        }
    }

    async fn connection_lost(&self, worker_id: u64, address: &str) {
        let mut s = self.session.lock().await;
        let registered = s
            .peers
            .get(address)
            .is_some_and(|p| p.worker.id() == worker_id);
        if !registered {
            debug!(peer = %address, "closed worker was already unregistered");
            return;
        }
        if let Some(peer) = s.peers.remove(address) {
            peer.worker.close();
        }
        warn!(peer = %address, remaining = s.peers.len(), "connection lost");
        self.notify(SessionEvent::Toast(TOAST_CONNECTION_LOST.to_string()));
        self.relisten(&mut s);
    }

    async fn file_received(&self, origin: &str, file: ReceivedFile) {
        let digest = integrity::digest_hex(&file.data);
        match self.store.save(&file.file_name, &file.data).await {
            Ok(path) => {
                info!(
                    peer = %origin,
                    path = %path.display(),
                    bytes = file.data.len(),
                    sha256 = %digest,
                    "file saved"
                );
                self.notify(SessionEvent::MessageReceived(Message::text(
                    file.author.clone(),
                    local_time(),
                    file_received_text(&file.file_name),
                )));
            }
            Err(e) => {
                error!(peer = %origin, file = %file.file_name, error = %e, "failed to save file");
                self.notify(SessionEvent::Toast(TOAST_FILE_SAVE_FAILED.to_string()));
            }
        }

        // Other peers get the file whether or not it landed on local disk.

        let s = self.session.lock().await;
        if s.peers.len() > 1 {
            let header = Message::file_start(file.author, file.file_name, file.data.len() as u64);
            let contents = Bytes::from(file.data);
            for (address, peer) in &s.peers {
                if address != origin {
                    peer.worker.send_file(&header, contents.clone());
                }
            }
        }
    }
}

/// Worker callbacks into the session.
struct PeerHooks<T: Transport> {
    shared: Weak<Shared<T>>,
}

#[async_trait]
impl<T: Transport> PeerEvents for PeerHooks<T> {
    async fn on_frame(&self, _worker_id: u64, address: &str, event: FrameEvent) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match event {
            FrameEvent::Message(msg) => {
                debug!(peer = %address, author = %msg.author, "message received");
                shared.notify(SessionEvent::MessageReceived(msg.clone()));
                let mut s = shared.session.lock().await;
                shared.broadcast_locked(&mut s, Outgoing::Message(msg), Some(address));
            }
            FrameEvent::FileStarted {
                file_name,
                author,
                expected_size,
            } => {
                info!(peer = %address, file = %file_name, author = %author, expected_size, "receiving file");
            }
            FrameEvent::FileReceived(file) => shared.file_received(address, file).await,
            FrameEvent::Relay(bytes) => {
                let mut s = shared.session.lock().await;
                shared.broadcast_locked(&mut s, Outgoing::Raw(Bytes::from(bytes)), Some(address));
            }
        }
    }

    async fn on_closed(&self, worker_id: u64, address: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.connection_lost(worker_id, address).await;
        }
    }
}

fn local_time() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use chatlink_core::{Framing, MessageKind, HISTORY_CAPACITY};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Instant};

    type PendingDials = Arc<std::sync::Mutex<HashMap<String, oneshot::Receiver<io::Result<Connection>>>>>;

    struct MockTransport {
        inbound: Arc<Mutex<mpsc::UnboundedReceiver<Connection>>>,
        dials: PendingDials,
        listen_fails: Arc<AtomicBool>,
    }

    struct MockListener {
        inbound: Arc<Mutex<mpsc::UnboundedReceiver<Connection>>>,
    }

    #[async_trait]
    impl Listener for MockListener {
        async fn accept(&mut self) -> io::Result<Connection> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "inbound closed"))
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Listener = MockListener;

        async fn listen(&self) -> io::Result<MockListener> {
            if self.listen_fails.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
            }
            Ok(MockListener {
                inbound: self.inbound.clone(),
            })
        }

        async fn dial(&self, target: &str) -> io::Result<Connection> {
            let pending = self.dials.lock().unwrap().remove(target);
            match pending {
                Some(rx) => rx.await.unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::ConnectionAborted, "dial dropped"))
                }),
                None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no such peer")),
            }
        }
    }

    struct Harness {
        controller: SessionController<MockTransport>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        inbound: mpsc::UnboundedSender<Connection>,
        dials: PendingDials,
        listen_fails: Arc<AtomicBool>,
        dir: tempfile::TempDir,
    }

    const SPACING: Duration = Duration::from_millis(100);

    fn harness() -> Harness {
        harness_with_downloads(|dir| dir.to_path_buf())
    }

    fn harness_with_downloads(downloads: impl FnOnce(&Path) -> std::path::PathBuf) -> Harness {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let dials = PendingDials::default();
        let listen_fails = Arc::new(AtomicBool::new(false));
        let transport = MockTransport {
            inbound: Arc::new(Mutex::new(inbound_rx)),
            dials: dials.clone(),
            listen_fails: listen_fails.clone(),
        };
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            display_name: "local".into(),
            worker: WorkerSettings {
                framing: Framing::Legacy,
                read_chunk_size: 1024,
                file_start_delay: SPACING,
                history_spacing: SPACING,
            },
        };
        let (tx, events) = mpsc::unbounded_channel();
        let store = FileStore::new(downloads(dir.path()));
        let controller = SessionController::new(transport, store, settings, tx);
        Harness {
            controller,
            events,
            inbound,
            dials,
            listen_fails,
            dir,
        }
    }

    impl Harness {
        async fn next_event(&mut self) -> SessionEvent {
            timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
            loop {
                let ev = self.next_event().await;
                if pred(&ev) {
                    return ev;
                }
            }
        }

        /// Deliver an inbound peer and wait until it is registered.
        async fn accept(&mut self, address: &str, name: &str) -> DuplexStream {
            let (conn, remote) = pipe(address, name);
            self.inbound.send(conn).unwrap();
            let expected = SessionEvent::DeviceConnected(name.to_string());
            self.wait_for(|e| *e == expected).await;
            remote
        }

        fn pending_dial(&self, target: &str) -> oneshot::Sender<io::Result<Connection>> {
            let (tx, rx) = oneshot::channel();
            self.dials.lock().unwrap().insert(target.to_string(), rx);
            tx
        }

        fn ready_dial(&self, target: &str, conn: Connection) {
            let _ = self.pending_dial(target).send(Ok(conn));
        }
    }

    fn pipe(address: &str, name: &str) -> (Connection, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        (Connection::new(address, name, local), remote)
    }

    async fn read_message(remote: &mut DuplexStream) -> Message {
        let mut buf = vec![0u8; 4096];
        let n = timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .expect("timed out waiting for bytes")
            .unwrap();
        Message::decode(&buf[..n])
    }

    async fn assert_silent(remote: &mut DuplexStream) {
        let mut buf = [0u8; 256];
        let res = timeout(Duration::from_millis(500), remote.read(&mut buf)).await;
        assert!(res.is_err(), "peer unexpectedly received {:?}", res);
    }

    async fn write_message(remote: &mut DuplexStream, msg: &Message) {
        remote.write_all(&encode_message(msg).unwrap()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bind_leaves_listening_and_can_retry() {
        let mut h = harness();
        h.listen_fails.store(true, Ordering::SeqCst);
        h.controller.start().await;
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        assert_eq!(
            h.next_event().await,
            SessionEvent::Toast(TOAST_LISTEN_FAILED.to_string())
        );
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::None));
        assert_eq!(h.controller.state().await, SessionState::None);

        h.listen_fails.store(false, Ordering::SeqCst);
        h.controller.start().await;
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        h.accept("B", "bob").await;
        assert_eq!(h.controller.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bind_with_peers_stays_connected() {
        let mut h = harness();
        h.controller.set_server(false).await;
        let (conn, _a) = pipe("A", "alice");
        h.controller.register_connection(conn).await;
        h.wait_for(|e| *e == SessionEvent::StateChanged(SessionState::Connected)).await;

        h.listen_fails.store(true, Ordering::SeqCst);
        h.controller.set_server(true).await;
        assert_eq!(
            h.next_event().await,
            SessionEvent::Toast(TOAST_LISTEN_FAILED.to_string())
        );
        assert!(timeout(Duration::from_millis(200), h.events.recv()).await.is_err());
        assert_eq!(h.controller.state().await, SessionState::Connected);
        assert_eq!(h.controller.peers().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_skips_origin_or_reaches_all() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let mut c = h.accept("C", "carol").await;

        h.controller
            .broadcast(Outgoing::Raw(Bytes::from_static(b"\x01\x02opaque")), Some("B"))
            .await;
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"\x01\x02opaque");
        assert_silent(&mut b).await;

        let note = Message::text("local", "08:00:00", "to everyone");
        h.controller.broadcast(Outgoing::Message(note.clone()), None).await;
        assert_eq!(read_message(&mut b).await, note);
        assert_eq!(read_message(&mut c).await, note);
        assert_eq!(h.controller.history().await, vec![note]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let mut h = harness();
        h.controller.start().await;
        h.controller.start().await;
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        assert!(timeout(Duration::from_millis(200), h.events.recv()).await.is_err());
        assert_eq!(h.controller.state().await, SessionState::Listening);
        assert!(h.controller.is_server().await);
    }

    #[tokio::test(start_paused = true)]
    async fn registering_outside_listener_connects_and_replays() {
        let mut h = harness();
        h.controller.set_server(false).await;
        let (conn, mut a) = pipe("A", "alice");
        h.controller.register_connection(conn).await;
        assert_eq!(h.next_event().await, SessionEvent::DeviceConnected("alice".into()));
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Connected));

        let hello = Message::text("alice", "10:00:00", "hello");
        write_message(&mut a, &hello).await;
        h.wait_for(|e| matches!(e, SessionEvent::MessageReceived(_))).await;

        let (conn, mut b) = pipe("B", "bob");
        h.controller.register_connection(conn).await;
        assert_eq!(read_message(&mut b).await, hello);
        assert_eq!(h.controller.peers().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_skips_origin_and_loss_keeps_survivors() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let mut c = h.accept("C", "carol").await;
        assert_eq!(h.controller.state().await, SessionState::Connected);

        let hi = Message::text("bob", "12:00:00", "hi");
        write_message(&mut b, &hi).await;
        assert_eq!(
            h.wait_for(|e| matches!(e, SessionEvent::MessageReceived(_))).await,
            SessionEvent::MessageReceived(hi.clone())
        );
        assert_eq!(read_message(&mut c).await, hi);
        assert_silent(&mut b).await;
        assert_eq!(h.controller.history().await, vec![hi]);

        drop(b);
        assert_eq!(
            h.next_event().await,
            SessionEvent::Toast(TOAST_CONNECTION_LOST.to_string())
        );
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        assert_eq!(
            h.controller.peers().await,
            vec![("C".to_string(), "carol".to_string())]
        );

        h.controller.send_message("still here").await;
        assert_eq!(read_message(&mut c).await.text, "still here");
    }

    #[tokio::test(start_paused = true)]
    async fn raw_bytes_are_relayed_but_not_kept() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let mut c = h.accept("C", "carol").await;
        let mut d = h.accept("D", "dave").await;

        b.write_all(b"\x01\x02opaque").await.unwrap();
        for remote in [&mut c, &mut d] {
            let mut buf = [0u8; 64];
            let n = timeout(Duration::from_secs(5), remote.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"\x01\x02opaque");
        }
        assert_silent(&mut b).await;
        assert!(h.controller.history().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_peer_gets_history_in_order_and_spaced() {
        let mut h = harness();
        h.controller.start().await;
        for i in 0..5 {
            h.controller.send_message(&format!("m{}", i)).await;
        }
        let mut d = h.accept("D", "dave").await;

        let mut stamps = Vec::new();
        for i in 0..5 {
            let msg = read_message(&mut d).await;
            assert_eq!(msg.text, format!("m{}", i));
            assert_eq!(msg.author, "local");
            assert_eq!(msg.kind, MessageKind::Text);
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= SPACING);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let h = harness();
        for i in 0..(HISTORY_CAPACITY + 2) {
            h.controller.send_message(&i.to_string()).await;
        }
        let history = h.controller.history().await;
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].text, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn local_send_echoes_and_reaches_all() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        h.controller.send_message("hello").await;
        let echo = h
            .wait_for(|e| matches!(e, SessionEvent::OutboundEcho(_)))
            .await;
        let SessionEvent::OutboundEcho(bytes) = echo else {
            unreachable!()
        };
        assert_eq!(Message::decode(&bytes).text, "hello");
        assert_eq!(read_message(&mut b).await.text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_any_state_ends_in_none() {
        let mut h = harness();
        h.controller.stop().await;
        assert_eq!(h.controller.state().await, SessionState::None);

        h.controller.start().await;
        h.controller.send_message("kept").await;
        let mut b = h.accept("B", "bob").await;
        assert_eq!(read_message(&mut b).await.text, "kept");

        let late_tx = h.pending_dial("late");
        h.controller.connect_to("late").await;
        assert_eq!(h.controller.state().await, SessionState::Connecting);

        h.controller.stop().await;
        assert_eq!(h.controller.state().await, SessionState::None);
        assert!(h.controller.peers().await.is_empty());
        assert!(h.controller.history().await.is_empty());
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);

        let (late, _remote) = pipe("L", "late");
        let _ = late_tx.send(Ok(late));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.controller.peers().await.is_empty());
        assert_eq!(h.controller.state().await, SessionState::None);

        h.controller.stop().await;
        assert_eq!(h.controller.state().await, SessionState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_dial_supersedes_first() {
        let mut h = harness();
        h.controller.start().await;
        let slow_tx = h.pending_dial("slow");
        h.controller.connect_to("slow").await;
        assert_eq!(
            h.wait_for(|e| matches!(e, SessionEvent::StateChanged(_))).await,
            SessionEvent::StateChanged(SessionState::Listening)
        );
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Connecting));

        let (fast, _fast_remote) = pipe("F", "fast");
        h.ready_dial("fast", fast);
        h.controller.connect_to("fast").await;
        assert_eq!(h.next_event().await, SessionEvent::DeviceConnected("fast".into()));
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Connected));

        let (slow, _slow_remote) = pipe("S", "slow");
        let _ = slow_tx.send(Ok(slow));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            h.controller.peers().await,
            vec![("F".to_string(), "fast".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dial_toasts_and_relistens() {
        let mut h = harness();
        h.controller.start().await;
        h.controller.connect_to("nowhere").await;
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Connecting));
        assert_eq!(
            h.next_event().await,
            SessionEvent::Toast(TOAST_CONNECT_FAILED.to_string())
        );
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));

        // The listener survived: inbound peers still register.
        h.accept("B", "bob").await;
    }

    #[tokio::test(start_paused = true)]
    async fn client_role_falls_back_to_none() {
        let mut h = harness();
        h.controller.set_server(false).await;
        let (peer, remote) = pipe("P", "pat");
        h.ready_dial("pat", peer);
        h.controller.connect_to("pat").await;
        h.wait_for(|e| *e == SessionEvent::StateChanged(SessionState::Connected))
            .await;

        drop(remote);
        h.wait_for(|e| matches!(e, SessionEvent::Toast(_))).await;
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::None));
        assert!(h.controller.peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_server_mode_clears_history_only() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        h.controller.send_message("x").await;
        read_message(&mut b).await;

        h.controller.set_server(false).await;
        assert!(h.controller.history().await.is_empty());
        assert_eq!(h.controller.peers().await.len(), 1);
        assert_eq!(h.controller.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn same_address_replaces_previous_connection() {
        let mut h = harness();
        h.controller.start().await;
        let mut first = h.accept("B", "bob").await;
        let _second = h.accept("B", "bob-again").await;
        assert_eq!(
            h.controller.peers().await,
            vec![("B".to_string(), "bob-again".to_string())]
        );
        let mut buf = [0u8; 16];
        assert_eq!(first.read(&mut buf).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.controller.peers().await.len(), 1);
        assert_eq!(h.controller.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_of_last_peer_relistens() {
        let mut h = harness();
        h.controller.start().await;
        let _b = h.accept("B", "bob").await;
        assert!(h.controller.disconnect_peer("B").await);
        assert!(!h.controller.disconnect_peer("B").await);
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Connected));
        assert_eq!(h.next_event().await, SessionEvent::StateChanged(SessionState::Listening));
        assert!(h.controller.peers().await.is_empty());
    }

    #[tokio::test]
    async fn received_file_is_saved_announced_and_relayed() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let mut c = h.accept("C", "carol").await;

        write_message(&mut b, &Message::file_start("bob", "notes.txt", 10)).await;
        b.write_all(b"0123456789").await.unwrap();

        let announced = h
            .wait_for(|e| matches!(e, SessionEvent::MessageReceived(_)))
            .await;
        let SessionEvent::MessageReceived(notice) = announced else {
            unreachable!()
        };
        assert_eq!(notice.author, "bob");
        assert_eq!(notice.text, "file notes.txt sent");
        let saved = tokio::fs::read(h.dir.path().join("notes.txt")).await.unwrap();
        assert_eq!(saved, b"0123456789");

        let header = read_message(&mut c).await;
        assert_eq!(header.kind, MessageKind::FileStart);
        assert_eq!(header.text, "notes.txt");
        assert_eq!(header.declared_size(), Some(10));
        let mut data = [0u8; 10];
        timeout(Duration::from_secs(5), c.read_exact(&mut data))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data, b"0123456789");
        assert_silent(&mut b).await;
        assert!(h.controller.history().await.is_empty());
    }

    #[tokio::test]
    async fn unsaved_file_is_not_announced_but_still_relayed() {
        let mut h = harness_with_downloads(|dir| dir.join("blocked"));
        std::fs::write(h.dir.path().join("blocked"), b"not a directory").unwrap();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let mut c = h.accept("C", "carol").await;

        write_message(&mut b, &Message::file_start("bob", "notes.txt", 4)).await;
        b.write_all(b"abcd").await.unwrap();

        let ev = h
            .wait_for(|e| matches!(e, SessionEvent::Toast(_) | SessionEvent::MessageReceived(_)))
            .await;
        assert_eq!(ev, SessionEvent::Toast(TOAST_FILE_SAVE_FAILED.to_string()));

        let header = read_message(&mut c).await;
        assert_eq!(header, Message::file_start("bob", "notes.txt", 4));
        let mut data = [0u8; 4];
        timeout(Duration::from_secs(5), c.read_exact(&mut data))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data, b"abcd");
        while let Ok(ev) = h.events.try_recv() {
            assert!(!matches!(ev, SessionEvent::MessageReceived(_)), "{:?}", ev);
        }
    }

    #[tokio::test]
    async fn local_file_goes_to_every_peer() {
        let mut h = harness();
        h.controller.start().await;
        let mut b = h.accept("B", "bob").await;
        let path = h.dir.path().join("out.bin");
        tokio::fs::write(&path, b"payload").await.unwrap();

        h.controller.send_file(&path).await;
        let header = read_message(&mut b).await;
        assert_eq!(header, Message::file_start("local", "out.bin", 7));
        let mut data = [0u8; 7];
        timeout(Duration::from_secs(5), b.read_exact(&mut data))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data, b"payload");

        h.controller.send_file(&h.dir.path().join("missing")).await;
        assert_eq!(
            h.wait_for(|e| matches!(e, SessionEvent::Toast(_))).await,
            SessionEvent::Toast(TOAST_FILE_UNREADABLE.to_string())
        );
    }
}
