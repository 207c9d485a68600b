//! The collaboration hub.
//!
//! Routes every inbound message to the document store, the session registry,
//! the presence relay, or the image pipeline, and fans results back out to
//! the right connections. The document is single-writer: patch acceptance
//! and broadcast dispatch share one critical section so every peer observes
//! accepted patches in the same global order. That lock is never held across
//! disk I/O or image work.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::doc::{ApplyOutcome, DocSaver, DocumentStore};
use crate::media::{self, ImageLimits};

use super::presence::CursorFrame;
use super::protocol::{ClientMessage, ServerMessage};
use super::registry::{Identity, Outbound, OutboundSender, SessionRegistry};

/// How often the stale-session sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle time after which a session is reaped. Transport ping/pong catches
/// dead sockets much sooner; this is the backstop.
const SESSION_TIMEOUT: Duration = Duration::from_secs(300);

pub struct CollabServer {
    config: Arc<Config>,
    store: Arc<DocumentStore>,
    saver: Arc<DocSaver>,
    registry: SessionRegistry,
    /// Serializes patch acceptance with broadcast dispatch.
    patch_order: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CollabServer {
    pub fn new(config: Arc<Config>, store: Arc<DocumentStore>, saver: Arc<DocSaver>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            saver,
            registry: SessionRegistry::new(),
            patch_order: Mutex::new(()),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Dispatch one decoded frame from a connection.
    pub fn handle_message(&self, conn_id: &str, tx: &OutboundSender, msg: ClientMessage) {
        match msg {
            ClientMessage::UserJoined {
                user_id,
                name,
                color,
            } => self.handle_identify(conn_id, tx, user_id, name, color),
            ClientMessage::ApplyPatch { patch } => self.handle_patch(conn_id, patch),
            ClientMessage::UploadImage {
                placeholder_id,
                base64_data,
            } => self.handle_upload(conn_id, tx, placeholder_id, base64_data),
            ClientMessage::CursorMove {
                x,
                y,
                height,
                is_image,
            } => self.handle_cursor(conn_id, x, y, height, is_image),
            ClientMessage::RequestFullSync { reason } => {
                self.handle_full_sync(conn_id, tx, reason)
            }
        }
    }

    /// A socket went away; remove its session unless a takeover already did.
    pub fn handle_disconnect(&self, conn_id: &str) {
        if let Some(user_id) = self.registry.on_disconnect(conn_id) {
            self.registry
                .broadcast_all(ServerMessage::UserLeft { user_id });
        }
    }

    fn handle_identify(
        &self,
        conn_id: &str,
        tx: &OutboundSender,
        user_id: Option<String>,
        name: Option<String>,
        color: Option<String>,
    ) {
        let identity = match Identity::validate(user_id, name, color) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(%conn_id, "rejecting identification: {e}");
                let _ = tx.send(Outbound::Close);
                return;
            }
        };

        let joined = ServerMessage::UserJoined {
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            color: identity.color.clone(),
        };
        let user_id = identity.user_id.clone();
        self.registry.identify(conn_id, identity, tx.clone());

        let users = self.registry.list_others(&user_id);
        let _ = tx.send(Outbound::Message(ServerMessage::Init {
            content: self.store.snapshot(),
            users,
        }));
        self.registry.broadcast_others(&user_id, joined);
    }

    fn handle_patch(&self, conn_id: &str, patch: Option<String>) {
        let Some(user_id) = self.registry.resolve(conn_id) else {
            debug!(%conn_id, "patch from unidentified connection, dropping");
            return;
        };
        // An empty diff between identical states serializes to an empty
        // patch text; it flows through apply as a NoChange so the submitter
        // still gets its acknowledgement. Only a missing field is dropped.
        let Some(patch) = patch else {
            debug!(%user_id, "missing patch payload, dropping");
            return;
        };
        self.registry.touch(&user_id);

        let outcome = {
            let _order = self.patch_order.lock();
            let outcome = self.store.apply_patch(&patch);
            if matches!(outcome, ApplyOutcome::Applied(_)) {
                self.registry.broadcast_others(
                    &user_id,
                    ServerMessage::ApplyPatch {
                        patch,
                        sender_id: user_id.clone(),
                    },
                );
            }
            outcome
        };

        match outcome {
            ApplyOutcome::Applied(size) => {
                debug!(%user_id, bytes = size, "patch applied");
                self.registry
                    .send_to(&user_id, ServerMessage::ContentAcknowledged);
                self.saver.request_save();
            }
            ApplyOutcome::NoChange => {
                self.registry
                    .send_to(&user_id, ServerMessage::ContentAcknowledged);
            }
            ApplyOutcome::Failed(reason) => {
                warn!(%user_id, %reason, "patch did not apply, requesting resync");
                self.registry
                    .send_to(&user_id, ServerMessage::RequestFullSync { reason });
            }
            ApplyOutcome::Rejected(reason) => {
                warn!(%user_id, %reason, "patch rejected");
                self.registry
                    .send_to(&user_id, ServerMessage::PatchRejected { reason });
            }
        }
    }

    fn handle_cursor(&self, conn_id: &str, x: f64, y: f64, height: f64, is_image: bool) {
        let Some(user_id) = self.registry.resolve(conn_id) else {
            return;
        };
        let Some(frame) = CursorFrame::validate(x, y, height, is_image) else {
            debug!(%user_id, "non-finite cursor frame, dropping");
            return;
        };
        self.registry.touch(&user_id);
        let Some(who) = self.registry.summary(&user_id) else {
            return;
        };
        self.registry
            .broadcast_others(&user_id, frame.annotate(&user_id, &who));
    }

    fn handle_upload(
        &self,
        conn_id: &str,
        tx: &OutboundSender,
        placeholder_id: String,
        base64_data: String,
    ) {
        let Some(user_id) = self.registry.resolve(conn_id) else {
            let _ = tx.send(Outbound::Message(ServerMessage::ImageProcessed {
                placeholder_id,
                optimized_base64: None,
                error: Some("unidentified".to_string()),
            }));
            return;
        };
        self.registry.touch(&user_id);

        let limits = ImageLimits {
            max_payload_bytes: self.config.max_image_bytes,
            max_dimension: self.config.image_max_dimension,
            jpeg_quality: self.config.image_jpeg_quality,
        };
        let reply = tx.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || media::optimize_data_url(&base64_data, &limits))
                    .await;
            let msg = match result {
                Ok(Ok(optimized)) => ServerMessage::ImageProcessed {
                    placeholder_id,
                    optimized_base64: Some(optimized),
                    error: None,
                },
                Ok(Err(e)) => {
                    debug!(%user_id, "image processing failed: {e}");
                    ServerMessage::ImageProcessed {
                        placeholder_id,
                        optimized_base64: None,
                        error: Some(e.to_string()),
                    }
                }
                Err(e) => {
                    error!(%user_id, "image task failed: {e}");
                    ServerMessage::ImageProcessed {
                        placeholder_id,
                        optimized_base64: None,
                        error: Some("image processing failed".to_string()),
                    }
                }
            };
            // The submitter may be gone by now; a dead channel is fine.
            let _ = reply.send(Outbound::Message(msg));
        });
    }

    fn handle_full_sync(&self, conn_id: &str, tx: &OutboundSender, reason: Option<String>) {
        let Some(user_id) = self.registry.resolve(conn_id) else {
            return;
        };
        info!(
            %user_id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "full sync requested"
        );
        self.registry.touch(&user_id);

        let users = self.registry.list_others(&user_id);
        let _ = tx.send(Outbound::Message(ServerMessage::Init {
            content: self.store.snapshot(),
            users,
        }));
        let _ = tx.send(Outbound::Message(ServerMessage::ContentAcknowledged));
    }

    /// Periodic stale-session sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for user_id in hub.registry.reap_stale(SESSION_TIMEOUT) {
                            info!(%user_id, "reaped stale session");
                            hub.registry.broadcast_all(ServerMessage::UserLeft { user_id });
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("cleanup loop stopped");
        })
    }

    /// Stop background loops owned by the hub.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Tell every client the server is going away, then close their sockets.
    pub fn broadcast_shutdown(&self, message: &str) {
        self.registry.broadcast_all(ServerMessage::ServerShutdown {
            message: message.to_string(),
        });
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::store::DEFAULT_CONTENT;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use diff_match_patch_rs::{DiffMatchPatch, Efficient, PatchInput};
    use tokio::sync::mpsc;

    fn test_config(dir: &tempfile::TempDir, max_doc_bytes: usize) -> Config {
        Config {
            port: 0,
            doc_path: dir.path().join("doc.html"),
            save_interval: Duration::from_secs(3600),
            max_doc_bytes,
            max_image_bytes: 250 * 1024,
            image_max_dimension: 400,
            image_jpeg_quality: 40,
            cursor_timeout: Duration::from_millis(30_000),
        }
    }

    fn test_hub_with(config: Config) -> Arc<CollabServer> {
        let config = Arc::new(config);
        let store = Arc::new(DocumentStore::new(
            config.doc_path.clone(),
            config.max_doc_bytes,
        ));
        let saver = Arc::new(DocSaver::new(Arc::clone(&store), config.save_interval));
        Arc::new(CollabServer::new(config, store, saver))
    }

    fn test_hub(dir: &tempfile::TempDir) -> Arc<CollabServer> {
        test_hub_with(test_config(dir, 50 * 1024 * 1024))
    }

    fn connect(
        hub: &CollabServer,
        conn_id: &str,
        user_id: &str,
        name: &str,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.handle_message(
            conn_id,
            &tx,
            ClientMessage::UserJoined {
                user_id: Some(user_id.to_string()),
                name: Some(name.to_string()),
                color: Some("#f00".to_string()),
            },
        );
        rx
    }

    fn recv_msg(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerMessage {
        match rx.try_recv().expect("expected a pending message") {
            Outbound::Message(msg) => msg,
            Outbound::Close => panic!("unexpected close"),
        }
    }

    fn make_patch(old: &str, new: &str) -> String {
        let dmp = DiffMatchPatch::new();
        let diffs = dmp.diff_main::<Efficient>(old, new).unwrap();
        let patches = dmp.patch_make(PatchInput::new_diffs(&diffs)).unwrap();
        dmp.patch_to_text(&patches)
    }

    fn send_patch(hub: &CollabServer, conn_id: &str, patch: &str) {
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.handle_message(
            conn_id,
            &tx,
            ClientMessage::ApplyPatch {
                patch: Some(patch.to_string()),
            },
        );
    }

    #[tokio::test]
    async fn identify_replies_init_and_broadcasts_join() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        match recv_msg(&mut rx1) {
            ServerMessage::Init { content, users } => {
                assert_eq!(content, DEFAULT_CONTENT);
                assert!(users.is_empty());
            }
            other => panic!("expected init, got {other:?}"),
        }

        let mut rx2 = connect(&hub, "c2", "u00002", "Bob");
        match recv_msg(&mut rx2) {
            ServerMessage::Init { users, .. } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users["u00001"].name, "Alice");
            }
            other => panic!("expected init, got {other:?}"),
        }
        match recv_msg(&mut rx1) {
            ServerMessage::UserJoined { user_id, name, .. } => {
                assert_eq!(user_id, "u00002");
                assert_eq!(name, "Bob");
            }
            other => panic!("expected userJoined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_identify_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::UserJoined {
                user_id: Some("u1".to_string()),
                name: Some("Alice".to_string()),
                color: Some("#f00".to_string()),
            },
        );
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close));
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn two_client_edit_fans_out_with_sender_id() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        let mut rx2 = connect(&hub, "c2", "u00002", "Bob");
        let _ = recv_msg(&mut rx1); // init
        let _ = recv_msg(&mut rx1); // u00002 joined
        let _ = recv_msg(&mut rx2); // init

        let target = "<p>hi!</p>";
        send_patch(&hub, "c1", &make_patch(DEFAULT_CONTENT, target));

        match recv_msg(&mut rx2) {
            ServerMessage::ApplyPatch { sender_id, patch } => {
                assert_eq!(sender_id, "u00001");
                assert!(!patch.is_empty());
            }
            other => panic!("expected applyPatch, got {other:?}"),
        }
        match recv_msg(&mut rx1) {
            ServerMessage::ContentAcknowledged => {}
            other => panic!("expected ack, got {other:?}"),
        }
        // No echo back to the submitter.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_patch_is_acknowledged_as_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        let mut rx2 = connect(&hub, "c2", "u00002", "Bob");
        let _ = recv_msg(&mut rx1); // init
        let _ = recv_msg(&mut rx1); // u00002 joined
        let _ = recv_msg(&mut rx2); // init

        // A diff between identical states serializes to an empty patch text.
        let patch = make_patch(DEFAULT_CONTENT, DEFAULT_CONTENT);
        assert!(patch.is_empty());
        send_patch(&hub, "c1", &patch);

        assert!(matches!(
            recv_msg(&mut rx1),
            ServerMessage::ContentAcknowledged
        ));
        // Nothing changed, so peers see no broadcast.
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_patch_requests_resync_for_submitter_only() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        let mut rx2 = connect(&hub, "c2", "u00002", "Bob");
        let _ = recv_msg(&mut rx1);
        let _ = recv_msg(&mut rx1);
        let _ = recv_msg(&mut rx2);

        send_patch(&hub, "c1", "definitely not a patch");

        match recv_msg(&mut rx1) {
            ServerMessage::RequestFullSync { .. } => {}
            other => panic!("expected requestFullSync, got {other:?}"),
        }
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversize_patch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let max = DEFAULT_CONTENT.len() + 16;
        let hub = test_hub_with(test_config(&dir, max));

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        let _ = recv_msg(&mut rx1);

        send_patch(&hub, "c1", &make_patch(DEFAULT_CONTENT, &"a".repeat(max + 1)));

        match recv_msg(&mut rx1) {
            ServerMessage::PatchRejected { reason } => assert!(reason.contains("size")),
            other => panic!("expected patchRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unidentified_patch_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        send_patch(&hub, "ghost", &make_patch(DEFAULT_CONTENT, "<p>x</p>"));
        // Document untouched: a real session still sees the default content.
        let mut rx = connect(&hub, "c1", "u00001", "Alice");
        match recv_msg(&mut rx) {
            ServerMessage::Init { content, .. } => assert_eq!(content, DEFAULT_CONTENT),
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cursor_fanout_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx1 = connect(&hub, "c1", "u00001", "Alice");
        let mut rx2 = connect(&hub, "c2", "u00002", "Bob");
        let _ = recv_msg(&mut rx1);
        let _ = recv_msg(&mut rx1);
        let _ = recv_msg(&mut rx2);

        let (tx, _rx) = mpsc::unbounded_channel();
        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::CursorMove {
                x: 10.0,
                y: 20.0,
                height: 18.0,
                is_image: false,
            },
        );

        match recv_msg(&mut rx2) {
            ServerMessage::CursorMove {
                user_id,
                name,
                color,
                x,
                ..
            } => {
                assert_eq!(user_id, "u00001");
                assert_eq!(name, "Alice");
                assert_eq!(color, "#f00");
                assert_eq!(x, 10.0);
            }
            other => panic!("expected cursorMove, got {other:?}"),
        }
        assert!(rx1.try_recv().is_err());

        // Non-finite frames go nowhere.
        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::CursorMove {
                x: f64::NAN,
                y: 0.0,
                height: 18.0,
                is_image: false,
            },
        );
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_takeover_without_spurious_user_left() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let mut rx_old = connect(&hub, "c1", "u00001", "Alice");
        let _ = recv_msg(&mut rx_old);
        let mut rx_peer = connect(&hub, "c2", "u00002", "Bob");
        let _ = recv_msg(&mut rx_old); // u00002 joined
        let _ = recv_msg(&mut rx_peer); // init

        // Same user reconnects on a new socket.
        let mut rx_new = connect(&hub, "c3", "u00001", "Alice");
        assert!(matches!(rx_old.try_recv().unwrap(), Outbound::Close));
        match recv_msg(&mut rx_new) {
            ServerMessage::Init { users, .. } => assert_eq!(users.len(), 1),
            other => panic!("expected init, got {other:?}"),
        }

        // The displaced socket tears down: the peer must not see userLeft.
        hub.handle_disconnect("c1");
        match recv_msg(&mut rx_peer) {
            // The takeover re-announced the user; a join is fine, a leave is not.
            ServerMessage::UserJoined { user_id, .. } => assert_eq!(user_id, "u00001"),
            other => panic!("unexpected message after takeover: {other:?}"),
        }
        assert!(rx_peer.try_recv().is_err());
        assert_eq!(
            hub.registry().resolve("c3"),
            Some("u00001".to_string())
        );
    }

    #[tokio::test]
    async fn full_sync_replies_init_and_ack() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::UserJoined {
                user_id: Some("u00001".to_string()),
                name: Some("Alice".to_string()),
                color: Some("#f00".to_string()),
            },
        );
        let _ = recv_msg(&mut rx); // init

        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::RequestFullSync {
                reason: Some("desync".to_string()),
            },
        );
        assert!(matches!(recv_msg(&mut rx), ServerMessage::Init { .. }));
        assert!(matches!(
            recv_msg(&mut rx),
            ServerMessage::ContentAcknowledged
        ));
    }

    #[tokio::test]
    async fn unidentified_image_submission_gets_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_message(
            "ghost",
            &tx,
            ClientMessage::UploadImage {
                placeholder_id: "p1".to_string(),
                base64_data: "data:image/png;base64,xxxx".to_string(),
            },
        );
        match recv_msg(&mut rx) {
            ServerMessage::ImageProcessed {
                placeholder_id,
                error,
                optimized_base64,
            } => {
                assert_eq!(placeholder_id, "p1");
                assert_eq!(error.as_deref(), Some("unidentified"));
                assert!(optimized_base64.is_none());
            }
            other => panic!("expected imageProcessed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_upload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hub = test_hub(&dir);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::UserJoined {
                user_id: Some("u00001".to_string()),
                name: Some("Alice".to_string()),
                color: Some("#f00".to_string()),
            },
        );
        let _ = recv_msg(&mut rx); // init

        let img = image::RgbImage::from_pixel(600, 500, image::Rgb([10, 200, 30]));
        let mut png = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let data_url = format!("data:image/png;base64,{}", BASE64.encode(png.get_ref()));

        hub.handle_message(
            "c1",
            &tx,
            ClientMessage::UploadImage {
                placeholder_id: "p1".to_string(),
                base64_data: data_url,
            },
        );

        let reply = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("image reply timed out")
            .expect("channel closed");
        match reply {
            Outbound::Message(ServerMessage::ImageProcessed {
                placeholder_id,
                optimized_base64,
                error,
            }) => {
                assert_eq!(placeholder_id, "p1");
                assert!(error.is_none());
                let data_url = optimized_base64.unwrap();
                let payload = data_url
                    .strip_prefix("data:image/jpeg;base64,")
                    .expect("jpeg data url");
                let decoded = image::load_from_memory(&BASE64.decode(payload).unwrap()).unwrap();
                assert!(decoded.width() <= 400 && decoded.height() <= 400);
            }
            other => panic!("expected imageProcessed, got {other:?}"),
        }
    }
}
