//! Unix-socket control server
//!
//! Each accepted stream opens one [`ControlChannel`] on the served adapter.
//! Requests run as their own tasks so a consumer blocked in
//! `REQUEST_UPDATE` can still answer display-control requests; a single
//! writer task owns the write half.

use crate::control::{Access, ControlChannel};
use crate::device::DeviceManager;
use crate::wire::{self, Frame};
use anyhow::{Context, Result};
use std::future::Future;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};

pub const DEFAULT_SOCKET: &str = "/tmp/vdisplay.sock";

/// Frames queued for a peer that is slow to read
const OUTBOX_DEPTH: usize = 32;
/// Requests running at once per stream; the reader waits beyond this
const MAX_IN_FLIGHT: usize = 32;

/// Maps a peer uid to the access it gets
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    pub owner_uid: Option<u32>,
    pub allowed: Vec<u32>,
}

impl AccessPolicy {
    pub fn access_for(&self, uid: Option<u32>) -> Access {
        match uid {
            Some(0) => Access::Render,
            Some(uid) if self.owner_uid == Some(uid) || self.allowed.contains(&uid) => {
                Access::Render
            }
            _ => Access::Unprivileged,
        }
    }
}

pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    manager: Arc<DeviceManager>,
    index: u32,
    policy: AccessPolicy,
}

impl Server {
    /// Bind `path`, replacing a stale socket file. The socket owner is
    /// always granted render access on top of `allowed`.
    pub fn bind(
        path: impl AsRef<Path>,
        manager: Arc<DeviceManager>,
        index: u32,
        allowed: Vec<u32>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        let owner_uid = std::fs::metadata(&path).ok().map(|m| m.uid());
        tracing::info!(socket = %path.display(), card = index, ?owner_uid, "listening");
        Ok(Self {
            listener,
            path,
            manager,
            index,
            policy: AccessPolicy { owner_uid, allowed },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        static CONN_COUNTER: AtomicU32 = AtomicU32::new(0);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let id = CONN_COUNTER.fetch_add(1, Ordering::SeqCst);
                    let uid = stream.peer_cred().ok().map(|c| c.uid());
                    let access = self.policy.access_for(uid);
                    tracing::info!(conn = id, ?uid, ?access, "client connected");
                    let manager = Arc::clone(&self.manager);
                    let index = self.index;
                    tokio::spawn(async move {
                        if let Err(e) = handle_stream(stream, manager, index, access, id, uid).await {
                            tracing::warn!(conn = id, error = %e, "client error");
                        }
                        tracing::info!(conn = id, "client disconnected");
                    });
                }
                _ = &mut shutdown => break,
            }
        }
        tracing::info!(socket = %self.path.display(), "shutting down");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_stream(
    stream: UnixStream,
    manager: Arc<DeviceManager>,
    index: u32,
    access: Access,
    id: u32,
    uid: Option<u32>,
) -> Result<()> {
    let opener = match uid {
        Some(uid) => format!("uid {uid} (conn {id})"),
        None => format!("conn {id}"),
    };
    let chan = Arc::new(ControlChannel::open(&manager, index, access, opener)?);
    let (mut rd, mut wr) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOX_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if wire::write_frame(&mut wr, &frame).await.is_err() {
                break;
            }
        }
    });

    let events = {
        let chan = Arc::clone(&chan);
        let tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = chan.next_event().await {
                if tx.send(wire::encode_event(&event)).await.is_err() {
                    break;
                }
            }
        })
    };

    let result = read_requests(&mut rd, &chan, &out_tx, id).await;

    // wakes any request still suspended on the binding
    chan.close();
    events.abort();
    drop(out_tx);
    let _ = writer.await;
    result
}

async fn read_requests(
    rd: &mut tokio::net::unix::OwnedReadHalf,
    chan: &Arc<ControlChannel>,
    out: &mpsc::Sender<Frame>,
    id: u32,
) -> Result<()> {
    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    while let Some(frame) = wire::read_frame(rd).await? {
        let (seq, request) = wire::decode_request(&frame)?;
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(conn = id, seq, error = %e, "bad request");
                let _ = out.send(wire::encode_response(seq, Err(e))).await;
                continue;
            }
        };
        let permit = Arc::clone(&in_flight).acquire_owned().await?;
        let chan = Arc::clone(chan);
        let out = out.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = chan.call(request).await;
            if let Err(e) = &result {
                tracing::debug!(conn = id, seq, error = %e, "request failed");
            }
            let _ = out.send(wire::encode_response(seq, result)).await;
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Consumer;
    use crate::config::DriverConfig;
    use crate::damage::Rect;
    use crate::error::Error;
    use crate::host::Headless;
    use crate::painter::{Capabilities, ConsumerEvent, GrabHint, UpdateStatus};
    use crate::registry::{Mode, PixelFormat};
    use std::time::Duration;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vdisplay-{}-{}.sock", std::process::id(), name))
    }

    fn start(name: &str) -> (Arc<DeviceManager>, PathBuf) {
        let config = DriverConfig::default().with_display_control_timeout(Duration::from_secs(5));
        let manager = Arc::new(DeviceManager::new(Arc::new(config), Arc::new(Headless)));
        manager.create("socket").unwrap();
        let path = socket_path(name);
        let server = Server::bind(&path, Arc::clone(&manager), 0, Vec::new()).unwrap();
        tokio::spawn(server.serve());
        (manager, path)
    }

    #[test]
    fn test_access_policy() {
        let policy = AccessPolicy {
            owner_uid: Some(1000),
            allowed: vec![1001],
        };
        assert_eq!(policy.access_for(Some(0)), Access::Render);
        assert_eq!(policy.access_for(Some(1000)), Access::Render);
        assert_eq!(policy.access_for(Some(1001)), Access::Render);
        assert_eq!(policy.access_for(Some(1002)), Access::Unprivileged);
        assert_eq!(policy.access_for(None), Access::Unprivileged);
    }

    #[tokio::test]
    async fn test_session_over_socket() {
        let (manager, path) = start("session");
        let display = manager.get(0).unwrap();
        let consumer = Consumer::connect(&path).await.unwrap();

        let mode = Mode::new(16, 8, 60);
        consumer
            .bind(mode, PixelFormat::Xrgb8888, Capabilities::CURSOR_EVENTS)
            .await
            .unwrap();
        assert!(display.painter().is_connected());

        let first = consumer.grab(GrabHint::default()).await.unwrap();
        assert_eq!(first.rects, vec![mode.bounds()]);
        assert_eq!(first.pixels.len(), 16 * 8 * 4);

        display
            .scanout()
            .unwrap()
            .fill_rect(&Rect::new(1, 1, 3, 2), 0x00112233);
        display.mark_dirty(Rect::new(1, 1, 3, 2)).unwrap();
        assert_eq!(
            consumer
                .request_update(Duration::from_secs(1))
                .await
                .unwrap(),
            UpdateStatus::Updated
        );
        let update = consumer.grab(GrabHint::default()).await.unwrap();
        assert_eq!(update.rects, vec![Rect::new(1, 1, 3, 2)]);
        assert_eq!(&update.pixels[..4], &[0x33, 0x22, 0x11, 0x00]);

        drop(consumer);
        tokio::time::timeout(Duration::from_secs(1), async {
            while display.painter().is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_display_control_while_waiting() {
        let (manager, path) = start("ddc");
        let display = manager.get(0).unwrap();
        let consumer = Arc::new(Consumer::connect(&path).await.unwrap());
        consumer
            .bind(
                Mode::new(8, 8, 60),
                PixelFormat::Xrgb8888,
                Capabilities::DISPLAY_CONTROL,
            )
            .await
            .unwrap();
        consumer.grab(GrabHint::default()).await.unwrap();

        // a long wait is in flight while the host asks for display control
        let waiter = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.request_update(Duration::from_secs(2)).await })
        };
        let host = {
            let display = Arc::clone(&display);
            tokio::spawn(async move { display.display_control_request(vec![0x51]).await })
        };

        let event = consumer.next_event().await.unwrap();
        assert_eq!(event, ConsumerEvent::DisplayControlRequest(vec![0x51]));
        consumer.display_control_reply(vec![0x6e]).await.unwrap();
        assert_eq!(host.await.unwrap().unwrap(), vec![0x6e]);

        display.mark_dirty(Rect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), UpdateStatus::Updated);
    }

    #[tokio::test]
    async fn test_unread_events_stay_bounded() {
        let (manager, path) = start("backlog");
        let display = manager.get(0).unwrap();
        let consumer = Consumer::connect(&path).await.unwrap();
        consumer
            .bind(Mode::new(64, 64, 60), PixelFormat::Xrgb8888, Capabilities::CURSOR_EVENTS)
            .await
            .unwrap();
        consumer.enable_cursor_events(true).await.unwrap();

        // nobody polls events while the cursor moves
        for i in 0..10_000 {
            display.update_cursor((i % 64, i / 64 % 64), None, true).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = consumer.grab(GrabHint::default()).await.unwrap();
        assert_eq!(first.rects, vec![Mode::new(64, 64, 60).bounds()]);

        let mut queued = 0;
        while consumer.try_next_event().is_some() {
            queued += 1;
        }
        assert!(queued > 0);
        assert!(queued <= 256, "{queued} events queued");
    }

    #[tokio::test]
    async fn test_second_consumer_rejected() {
        let (_manager, path) = start("second");
        let a = Consumer::connect(&path).await.unwrap();
        let b = Consumer::connect(&path).await.unwrap();
        a.bind(Mode::new(8, 8, 60), PixelFormat::Xrgb8888, Capabilities::empty())
            .await
            .unwrap();
        let err = b
            .bind(Mode::new(8, 8, 60), PixelFormat::Xrgb8888, Capabilities::empty())
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::AlreadyConnected));
    }
}
