//! Bridge coordinator: the client-side control plane of bridge mode.
//!
//! A relay peer (normally a browser tab) opens two WebSockets to the client:
//! `ctrl`, carrying [`CtrlMessage`]s, and `data`, carrying tunnel payload.
//! The coordinator owns both channel slots and the [`BridgeStatus`]:
//!
//! | State               | Event                          | New state  |
//! |---------------------|--------------------------------|------------|
//! | Preparing           | ctrl and data both open        | Waiting    |
//! | Waiting             | ctrl receives `connected`      | Connected  |
//! | Waiting / Connected | ctrl or data closes            | Preparing  |
//!
//! A new channel of a role closes the previous one before it is installed.
//! All of this state lives in one `watch` channel; only the handlers in this
//! module modify it, everyone else reads snapshots.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::address::{encode, resolve_auto};
use crate::protocol::CtrlMessage;
use crate::relay::{ByteRelay, WsByteStream, BUFFER_SIZE};

/// Interval between bridge checks in [`BridgeCoordinator::auto_open_bridge`]
pub const AUTO_OPEN_INTERVAL: Duration = Duration::from_millis(100);

const CTRL_QUEUE: usize = 16;
const DATA_BUFFER: usize = 4 * BUFFER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeStatus {
    #[default]
    Preparing,
    Waiting,
    Connected,
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeStatus::Preparing => write!(f, "preparing"),
            BridgeStatus::Waiting => write!(f, "waiting"),
            BridgeStatus::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Ctrl,
    Data,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Ctrl => "ctrl",
            ChannelRole::Data => "data",
        }
    }
}

/// Live ctrl channel: outgoing messages are queued to its socket task
#[derive(Debug)]
pub(crate) struct CtrlHandle {
    id: u64,
    tx: mpsc::Sender<CtrlMessage>,
    cancel: CancellationToken,
}

/// Live data channel, claimable by exactly one session
#[derive(Debug)]
pub(crate) struct DataHandle {
    id: u64,
    claim: Option<oneshot::Sender<DuplexStream>>,
    cancel: CancellationToken,
}

/// Coordinator state, observed through [`BridgeCoordinator::subscribe`]
#[derive(Debug, Default)]
pub struct BridgeState {
    status: BridgeStatus,
    ctrl: Option<CtrlHandle>,
    data: Option<DataHandle>,
    origin: Option<String>,
}

impl BridgeState {
    pub fn status(&self) -> BridgeStatus {
        self.status
    }

    pub fn ctrl_id(&self) -> Option<u64> {
        self.ctrl.as_ref().map(|c| c.id)
    }

    pub fn data_id(&self) -> Option<u64> {
        self.data.as_ref().map(|d| d.id)
    }

    /// Data channel is open and not yet claimed by a session
    pub fn data_ready(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.claim.is_some())
    }

    /// `Origin` header the current ctrl channel was opened with
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn promote(&mut self) {
        if self.status == BridgeStatus::Preparing && self.ctrl.is_some() && self.data.is_some() {
            self.status = BridgeStatus::Waiting;
        }
    }
}

/// Opens a URL in a browser for [`BridgeCoordinator::auto_open_bridge`]
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// The desktop's default browser
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Remote side of a completed bridge handshake
#[derive(Debug)]
pub struct BridgeLink {
    pub stream: DuplexStream,
    pub conn_str: String,
}

pub struct BridgeCoordinator {
    state: watch::Sender<BridgeState>,
    next_id: AtomicU64,
    handshake: Mutex<()>,
    opener: Arc<dyn BrowserOpener>,
}

impl BridgeCoordinator {
    pub fn new(opener: Arc<dyn BrowserOpener>) -> Self {
        let (state, _) = watch::channel(BridgeState::default());
        Self {
            state,
            next_id: AtomicU64::new(1),
            handshake: Mutex::new(()),
            opener,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.state.borrow().status
    }

    pub fn is_bridge_opened(&self) -> bool {
        self.status() != BridgeStatus::Preparing
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Wait up to `retries` intervals for the relay peer to show up; if it
    /// does not, open `url` in a browser once. Returns whether it fired.
    pub async fn auto_open_bridge(&self, url: &str, retries: u32) -> bool {
        let mut rx = self.subscribe();
        let opened = tokio::time::timeout(
            AUTO_OPEN_INTERVAL * retries,
            rx.wait_for(|s| s.status != BridgeStatus::Preparing),
        )
        .await
        .is_ok_and(|r| r.is_ok());

        if opened {
            return false;
        }

        info!("Bridge not opened yet, opening {} in browser", url);
        if let Err(e) = self.opener.open(url) {
            warn!("Could not open browser automatically: {}", e);
        }
        true
    }

    /// Run the bridge handshake for one session and return the remote stream.
    ///
    /// Handshakes are serialized: the ctrl protocol has no correlation id, so
    /// only one `connect` may be outstanding at a time. Without a `budget`
    /// the waits are unbounded.
    pub async fn open_remote(
        &self,
        server: &str,
        target: &str,
        budget: Option<Duration>,
    ) -> Result<BridgeLink> {
        let _turn = self.handshake.lock().await;
        let mut rx = self.subscribe();

        info!("Waiting for bridge ctrl and data tunnel...");
        let (ctrl_id, origin) = within(
            budget,
            "waiting for bridge channels",
            rx.wait_for(|s| s.ctrl.is_some() && s.data_ready()),
        )
        .await?
        .map(|s| (s.ctrl_id(), s.origin().map(str::to_string)))
        .map_err(|_| TunnelError::BridgeClosed("ctrl"))?;
        let ctrl_id = ctrl_id.ok_or(TunnelError::BridgeClosed("ctrl"))?;
        info!("Bridge ctrl and data tunnel ready");

        let (server, target) = resolve_auto(server, target, origin.as_deref())?;
        let conn_str = encode(&server, &target)?;

        // Claim before asking for the dial so early remote bytes are buffered
        let (stream, data_id) = self.claim_data()?;
        self.send_ctrl(ctrl_id, CtrlMessage::connect(&conn_str)).await?;
        info!("Connecting to remote target: {}", conn_str);

        within(
            budget,
            "waiting for the relay to connect",
            rx.wait_for(|s| {
                s.status == BridgeStatus::Connected
                    || s.ctrl_id() != Some(ctrl_id)
                    || s.data_id() != Some(data_id)
            }),
        )
        .await?
        .map(|s| {
            if s.ctrl_id() != Some(ctrl_id) {
                Err(TunnelError::BridgeClosed("ctrl"))
            } else if s.data_id() != Some(data_id) {
                Err(TunnelError::BridgeClosed("data"))
            } else {
                Ok(())
            }
        })
        .map_err(|_| TunnelError::BridgeClosed("ctrl"))??;

        Ok(BridgeLink { stream, conn_str })
    }

    fn claim_data(&self) -> Result<(DuplexStream, u64)> {
        let (near, far) = tokio::io::duplex(DATA_BUFFER);
        let mut claimed = None;

        self.state.send_modify(|state| {
            if let Some(data) = state.data.as_mut() {
                if let Some(claim) = data.claim.take() {
                    if claim.send(far).is_ok() {
                        claimed = Some(data.id);
                    }
                }
            }
        });

        claimed
            .map(|id| (near, id))
            .ok_or(TunnelError::BridgeClosed("data"))
    }

    async fn send_ctrl(&self, ctrl_id: u64, msg: CtrlMessage) -> Result<()> {
        let tx = self
            .state
            .borrow()
            .ctrl
            .as_ref()
            .filter(|c| c.id == ctrl_id)
            .map(|c| c.tx.clone())
            .ok_or(TunnelError::BridgeClosed("ctrl"))?;

        tx.send(msg)
            .await
            .map_err(|_| TunnelError::BridgeClosed("ctrl"))
    }

    fn next_channel_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn install_ctrl(&self, handle: CtrlHandle, origin: Option<String>) {
        self.state.send_modify(|state| {
            if let Some(old) = state.ctrl.take() {
                info!("Replacing bridge ctrl tunnel {}", old.id);
                old.cancel.cancel();
                state.status = BridgeStatus::Preparing;
            }
            info!("Bridge ctrl tunnel {} connected", handle.id);
            state.ctrl = Some(handle);
            state.origin = origin;
            state.promote();
        });
    }

    pub(crate) fn install_data(&self, handle: DataHandle) {
        self.state.send_modify(|state| {
            if let Some(old) = state.data.take() {
                info!("Replacing bridge data tunnel {}", old.id);
                old.cancel.cancel();
                state.status = BridgeStatus::Preparing;
            }
            info!("Bridge data tunnel {} connected", handle.id);
            state.data = Some(handle);
            state.promote();
        });
    }

    pub(crate) fn on_ctrl_message(&self, ctrl_id: u64, msg: CtrlMessage) {
        match msg {
            CtrlMessage::Connected => {
                let changed = self.state.send_if_modified(|state| {
                    if state.ctrl_id() == Some(ctrl_id) && state.status == BridgeStatus::Waiting {
                        state.status = BridgeStatus::Connected;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    info!("Target tunnel connected");
                } else {
                    debug!("Ignoring connected message on ctrl tunnel {}", ctrl_id);
                }
            }
            CtrlMessage::Connect { .. } => {
                warn!("Unexpected connect message from relay on ctrl tunnel {}", ctrl_id);
            }
        }
    }

    pub(crate) fn channel_closed(&self, role: ChannelRole, id: u64) {
        let cleared = self.state.send_if_modified(|state| {
            let slot = match role {
                ChannelRole::Ctrl => state.ctrl_id(),
                ChannelRole::Data => state.data_id(),
            };
            if slot != Some(id) {
                return false;
            }
            match role {
                ChannelRole::Ctrl => state.ctrl = None,
                ChannelRole::Data => state.data = None,
            }
            state.status = BridgeStatus::Preparing;
            true
        });

        if cleared {
            info!("Bridge {} tunnel {} disconnected", role.as_str(), id);
        }
    }
}

async fn within<F: Future>(budget: Option<Duration>, stage: &'static str, fut: F) -> Result<F::Output> {
    match budget {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(stage)),
        None => Ok(fut.await),
    }
}

/// Serve one accepted ctrl WebSocket until it closes or is replaced
pub(crate) async fn run_ctrl_channel<S>(
    coordinator: Arc<BridgeCoordinator>,
    ws: WebSocketStream<S>,
    origin: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = coordinator.next_channel_id();
    let (tx, mut rx) = mpsc::channel(CTRL_QUEUE);
    let cancel = CancellationToken::new();
    coordinator.install_ctrl(
        CtrlHandle {
            id,
            tx,
            cancel: cancel.clone(),
        },
        origin,
    );

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(msg) = rx.recv() => {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode ctrl message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    debug!("Bridge ctrl tunnel {} send error: {}", id, e);
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match CtrlMessage::from_json(&text) {
                    Ok(msg) => coordinator.on_ctrl_message(id, msg),
                    Err(e) => warn!("Ignoring malformed ctrl message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Bridge ctrl tunnel {} read error: {}", id, e);
                    break;
                }
            },
        }
    }

    coordinator.channel_closed(ChannelRole::Ctrl, id);
}

enum DataIdle {
    Claimed(DuplexStream),
    Replaced,
    Closed,
}

/// Serve one accepted data WebSocket: idle until a session claims it, then
/// relay it against that session's stream
pub(crate) async fn run_data_channel<S>(coordinator: Arc<BridgeCoordinator>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = coordinator.next_channel_id();
    let (claim_tx, mut claim_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    coordinator.install_data(DataHandle {
        id,
        claim: Some(claim_tx),
        cancel: cancel.clone(),
    });

    let mut ws = ws;
    let idle = loop {
        tokio::select! {
            _ = cancel.cancelled() => break DataIdle::Replaced,
            claimed = &mut claim_rx => match claimed {
                Ok(session) => break DataIdle::Claimed(session),
                Err(_) => break DataIdle::Replaced,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break DataIdle::Closed,
                Some(Ok(_)) => debug!("Discarding frame on idle bridge data tunnel {}", id),
            },
        }
    };

    match idle {
        DataIdle::Claimed(session) => {
            debug!("Bridge data tunnel {} claimed by a session", id);
            tokio::select! {
                _ = cancel.cancelled() => debug!("Bridge data tunnel {} replaced while in use", id),
                report = ByteRelay::new(WsByteStream::new(ws), session).run() => {
                    debug!(
                        "Bridge data tunnel {} finished ({} bytes in, {} bytes out)",
                        id, report.a_to_b, report.b_to_a
                    );
                }
            }
        }
        DataIdle::Replaced => {
            let _ = ws.close(None).await;
        }
        DataIdle::Closed => {}
    }

    coordinator.channel_closed(ChannelRole::Data, id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_pending, assert_ready, task};

    #[derive(Default)]
    struct CountingOpener {
        opened: AtomicUsize,
    }

    impl BrowserOpener for CountingOpener {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn coordinator() -> Arc<BridgeCoordinator> {
        Arc::new(BridgeCoordinator::new(Arc::new(CountingOpener::default())))
    }

    fn open_ctrl(coord: &BridgeCoordinator) -> (u64, mpsc::Receiver<CtrlMessage>, CancellationToken) {
        let id = coord.next_channel_id();
        let (tx, rx) = mpsc::channel(CTRL_QUEUE);
        let cancel = CancellationToken::new();
        coord.install_ctrl(
            CtrlHandle {
                id,
                tx,
                cancel: cancel.clone(),
            },
            None,
        );
        (id, rx, cancel)
    }

    fn open_data(coord: &BridgeCoordinator) -> (u64, oneshot::Receiver<DuplexStream>, CancellationToken) {
        let id = coord.next_channel_id();
        let (claim, claim_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        coord.install_data(DataHandle {
            id,
            claim: Some(claim),
            cancel: cancel.clone(),
        });
        (id, claim_rx, cancel)
    }

    #[test]
    fn test_status_transitions() {
        let coord = coordinator();
        assert_eq!(coord.status(), BridgeStatus::Preparing);

        let (ctrl_id, _ctrl_rx, _) = open_ctrl(&coord);
        assert_eq!(coord.status(), BridgeStatus::Preparing);
        assert!(!coord.is_bridge_opened());

        let (data_id, _claim_rx, _) = open_data(&coord);
        assert_eq!(coord.status(), BridgeStatus::Waiting);
        assert!(coord.is_bridge_opened());

        coord.on_ctrl_message(ctrl_id, CtrlMessage::Connected);
        assert_eq!(coord.status(), BridgeStatus::Connected);

        coord.channel_closed(ChannelRole::Data, data_id);
        assert_eq!(coord.status(), BridgeStatus::Preparing);
        assert_eq!(coord.subscribe().borrow().data_id(), None);
        assert_eq!(coord.subscribe().borrow().ctrl_id(), Some(ctrl_id));
    }

    #[test]
    fn test_ctrl_close_resets_status() {
        let coord = coordinator();
        let (ctrl_id, _ctrl_rx, _) = open_ctrl(&coord);
        let (_data_id, _claim_rx, _) = open_data(&coord);
        assert_eq!(coord.status(), BridgeStatus::Waiting);

        coord.channel_closed(ChannelRole::Ctrl, ctrl_id);
        assert_eq!(coord.status(), BridgeStatus::Preparing);
        assert_eq!(coord.subscribe().borrow().ctrl_id(), None);
    }

    #[test]
    fn test_connected_only_from_waiting() {
        let coord = coordinator();
        let (ctrl_id, _ctrl_rx, _) = open_ctrl(&coord);

        coord.on_ctrl_message(ctrl_id, CtrlMessage::Connected);
        assert_eq!(coord.status(), BridgeStatus::Preparing);
    }

    #[test]
    fn test_replacement_closes_old_channel() {
        let coord = coordinator();
        let (old_ctrl, _old_rx, old_cancel) = open_ctrl(&coord);
        let (_data_id, _claim_rx, _) = open_data(&coord);
        coord.on_ctrl_message(old_ctrl, CtrlMessage::Connected);
        assert_eq!(coord.status(), BridgeStatus::Connected);

        let (new_ctrl, _new_rx, new_cancel) = open_ctrl(&coord);
        assert!(old_cancel.is_cancelled());
        assert!(!new_cancel.is_cancelled());
        assert_eq!(coord.status(), BridgeStatus::Waiting);

        // The replaced channel's close must not clear its successor
        coord.channel_closed(ChannelRole::Ctrl, old_ctrl);
        assert_eq!(coord.subscribe().borrow().ctrl_id(), Some(new_ctrl));
        assert_eq!(coord.status(), BridgeStatus::Waiting);

        // Neither may its late messages
        coord.on_ctrl_message(old_ctrl, CtrlMessage::Connected);
        assert_eq!(coord.status(), BridgeStatus::Waiting);
    }

    #[tokio::test]
    async fn test_open_remote_handshake() {
        let coord = coordinator();
        let handshake = {
            let coord = coord.clone();
            async move {
                coord
                    .open_remote("ws://127.0.0.1:7800", "127.0.0.1:22", None)
                    .await
            }
        };
        let mut handshake = task::spawn(handshake);

        // No channels yet: the session waits
        assert_pending!(handshake.poll());

        let (ctrl_id, mut ctrl_rx, _) = open_ctrl(&coord);
        assert_pending!(handshake.poll());
        let (_data_id, mut claim_rx, _) = open_data(&coord);

        // Both open: connect is sent and the data channel claimed
        assert!(handshake.is_woken());
        assert_pending!(handshake.poll());
        assert_eq!(
            ctrl_rx.try_recv().unwrap(),
            CtrlMessage::connect("ws://127.0.0.1:7800/tunnel?target=127.0.0.1%3A22")
        );
        let mut relay_side = claim_rx.try_recv().unwrap();
        assert!(!coord.subscribe().borrow().data_ready());

        coord.on_ctrl_message(ctrl_id, CtrlMessage::Connected);
        assert!(handshake.is_woken());
        let mut link = assert_ready!(handshake.poll()).unwrap();
        assert_eq!(
            link.conn_str,
            "ws://127.0.0.1:7800/tunnel?target=127.0.0.1%3A22"
        );

        relay_side.write_all(b"X").await.unwrap();
        let mut buf = [0u8; 1];
        link.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"X");
    }

    #[tokio::test]
    async fn test_open_remote_abandoned_when_data_closes() {
        let coord = coordinator();
        let (_ctrl_id, _ctrl_rx, _) = open_ctrl(&coord);
        let (data_id, _claim_rx, _) = open_data(&coord);

        let mut handshake = task::spawn({
            let coord = coord.clone();
            async move { coord.open_remote("ws://127.0.0.1:7800", "127.0.0.1:22", None).await }
        });
        assert_pending!(handshake.poll());

        coord.channel_closed(ChannelRole::Data, data_id);
        let result = assert_ready!(handshake.poll());
        assert!(matches!(result, Err(TunnelError::BridgeClosed("data"))));
    }

    #[tokio::test]
    async fn test_open_remote_abandoned_when_ctrl_closes() {
        let coord = coordinator();
        let (ctrl_id, mut ctrl_rx, _) = open_ctrl(&coord);
        let (_data_id, _claim_rx, _) = open_data(&coord);

        let mut handshake = task::spawn({
            let coord = coord.clone();
            async move { coord.open_remote("ws://127.0.0.1:7800", "127.0.0.1:22", None).await }
        });
        assert_pending!(handshake.poll());
        assert!(matches!(ctrl_rx.try_recv(), Ok(CtrlMessage::Connect { .. })));

        coord.channel_closed(ChannelRole::Ctrl, ctrl_id);
        let result = assert_ready!(handshake.poll());
        assert!(matches!(result, Err(TunnelError::BridgeClosed("ctrl"))));
    }

    #[tokio::test]
    async fn test_open_remote_abandoned_when_ctrl_replaced() {
        let coord = coordinator();
        let (_old_ctrl, mut old_rx, _) = open_ctrl(&coord);
        let (_data_id, _claim_rx, _) = open_data(&coord);

        let mut handshake = task::spawn({
            let coord = coord.clone();
            async move { coord.open_remote("ws://127.0.0.1:7800", "127.0.0.1:22", None).await }
        });
        assert_pending!(handshake.poll());
        assert!(matches!(old_rx.try_recv(), Ok(CtrlMessage::Connect { .. })));

        // The successor never saw this connect, so its `connected` must not count
        let (new_ctrl, mut new_rx, _) = open_ctrl(&coord);
        coord.on_ctrl_message(new_ctrl, CtrlMessage::Connected);

        let result = assert_ready!(handshake.poll());
        assert!(matches!(result, Err(TunnelError::BridgeClosed("ctrl"))));
        assert!(new_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_remote_budget() {
        let coord = coordinator();
        let result = coord
            .open_remote("ws://127.0.0.1:7800", "127.0.0.1:22", Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(TunnelError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_auto_open_fires_once_when_closed() {
        let opener = Arc::new(CountingOpener::default());
        let coord = BridgeCoordinator::new(opener.clone());

        assert!(coord.auto_open_bridge("http://127.0.0.1:7900", 1).await);
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auto_open_skipped_when_opened() {
        let opener = Arc::new(CountingOpener::default());
        let coord = BridgeCoordinator::new(opener.clone());
        let (_ctrl_id, _ctrl_rx, _) = open_ctrl(&coord);
        let (_data_id, _claim_rx, _) = open_data(&coord);

        assert!(!coord.auto_open_bridge("http://127.0.0.1:7900", 3).await);
        assert_eq!(opener.opened.load(Ordering::SeqCst), 0);
    }
}
