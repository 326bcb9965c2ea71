use super::{Link, Transport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};

/// WebSocket transport. Each link runs a writer task and a reader task over
/// the split socket; dropping the link's sender closes the socket.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Link, String> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| format!("websocket connect failed: {}", e))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        let (in_tx, in_rx) = mpsc::channel::<Result<String, String>>(64);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(tungstenite::Message::Text(text.into())).await {
                    log::warn!("[ws] write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            loop {
                let msg = match ws_rx.next().await {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        let _ = in_tx.send(Err(e.to_string())).await;
                        break;
                    }
                    None => break,
                };
                match msg {
                    tungstenite::Message::Text(t) => {
                        if in_tx.send(Ok(t.to_string())).await.is_err() {
                            break;
                        }
                    }
                    tungstenite::Message::Close(frame) => {
                        match frame {
                            Some(frame) => {
                                log::info!("[ws] closed by server: {} {}", frame.code, frame.reason)
                            }
                            None => log::info!("[ws] closed by server"),
                        }
                        break;
                    }
                    _ => continue,
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
