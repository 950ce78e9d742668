use crate::state::SessionEvent;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite};
use url::Url;

/// Outbound frames waiting for the socket. Small on purpose: when the socket
/// stalls, capture drops frames instead of building up latency.
pub const FRAME_QUEUE_DEPTH: usize = 8;

/// Handle to one open duplex connection.
///
/// Outbound audio goes through [`Channel::frame_sender`]; inbound text and the
/// closure arrive as [`SessionEvent`]s tagged with the session generation.
/// Dropping the handle closes the connection.
pub struct Channel {
    frames: mpsc::Sender<Vec<u8>>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl Channel {
    pub fn new(frames: mpsc::Sender<Vec<u8>>, close_tx: oneshot::Sender<()>) -> Self {
        Self {
            frames,
            close_tx: Some(close_tx),
        }
    }

    pub fn frame_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.frames.clone()
    }

    /// Ask the writer to send a close frame so the remote side flushes.
    pub fn close(mut self) {
        self.signal_close();
    }

    fn signal_close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.signal_close();
    }
}

/// Opens channels. The session controller only sees this seam.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`. Inbound messages and the eventual closure must be posted
    /// to `events` in arrival order, tagged with `generation`.
    async fn connect(
        &self,
        url: Url,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Channel, String>;
}

/// WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

fn describe_connect_error(err: &tungstenite::Error) -> String {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            if code == 401 || code == 403 {
                format!("authentication rejected (HTTP {})", code)
            } else {
                format!("handshake failed (HTTP {})", code)
            }
        }
        other => format!("connection failed: {}", other),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: Url,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Channel, String> {
        // The query carries provider keys; keep it out of the log.
        log::info!(
            "[channel] connecting: {}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or("?"),
            url.path()
        );

        let ws_stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                let msg = describe_connect_error(&e);
                log::warn!("[channel] {}", msg);
                return Err(msg);
            }
        };
        log::info!("[channel] websocket connected (gen={})", generation);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        // Task: forward audio frames to the socket until closed.
        tokio::spawn(async move {
            let mut frames: u64 = 0;
            loop {
                tokio::select! {
                    frame = frames_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = ws_tx.send(tungstenite::Message::Binary(frame)).await {
                            log::warn!("[channel] send failed after {} frames: {}", frames, e);
                            break;
                        }
                        frames += 1;
                    }
                    _ = &mut close_rx => break,
                }
            }
            // Stop accepting frames before the close handshake.
            frames_rx.close();
            log::info!("[channel] closing websocket (gen={}, frames={})", generation, frames);
            let _ = ws_tx.close().await;
        });

        // Task: forward inbound text in arrival order, then report closure.
        tokio::spawn(async move {
            let mut reason: Option<String> = None;
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        if events.send(SessionEvent::Inbound { generation, text }).is_err() {
                            return;
                        }
                    }
                    Ok(tungstenite::Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            log::info!("[channel] websocket closed: {} {}", frame.code, frame.reason);
                            let text = frame.reason.to_string();
                            if !text.trim().is_empty() {
                                reason = Some(text);
                            }
                        } else {
                            log::info!("[channel] websocket closed");
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("[channel] websocket error: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            let _ = events.send(SessionEvent::ChannelClosed { generation, reason });
        });

        Ok(Channel::new(frames_tx, close_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_handle_signals_close_once() {
        let (frames_tx, _frames_rx) = mpsc::channel(1);
        let (close_tx, mut close_rx) = oneshot::channel();
        let channel = Channel::new(frames_tx, close_tx);
        drop(channel);
        assert!(close_rx.try_recv().is_ok());
    }

    #[test]
    fn frame_sender_feeds_the_writer_queue() {
        let (frames_tx, mut frames_rx) = mpsc::channel(1);
        let (close_tx, _close_rx) = oneshot::channel();
        let channel = Channel::new(frames_tx, close_tx);
        channel.frame_sender().try_send(vec![7, 7]).unwrap();
        assert_eq!(frames_rx.try_recv().unwrap(), vec![7, 7]);
        channel.close();
    }
}
