// WebSocket connector backed by tokio-tungstenite.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{ConnectError, GatewayConnector, SocketEvent, SocketEventSink, SocketHandle};

/// Production connector. Each `open` spawns a task that owns the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl GatewayConnector for WsConnector {
    fn open(&self, url: &Url, events: SocketEventSink) -> Result<SocketHandle, ConnectError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConnectError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(url.to_string(), events, outbound_rx));
        Ok(SocketHandle::new(outbound_tx, Some(task)))
    }
}

async fn run_connection(
    url: String,
    events: SocketEventSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            let reason = error.to_string();
            events.emit(SocketEvent::Error(reason.clone()));
            events.emit(SocketEvent::Closed { code: None, reason });
            return;
        }
    };
    if !events.emit(SocketEvent::Opened) {
        return;
    }

    let (mut sink, mut stream) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(error) = sink.send(Message::Text(text.into())).await {
                        let reason = error.to_string();
                        events.emit(SocketEvent::Error(reason.clone()));
                        events.emit(SocketEvent::Closed { code: None, reason });
                        return;
                    }
                }
                None => {
                    // Owner dropped the handle.
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    events.emit(SocketEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        events.emit(SocketEvent::Message(text));
                    }
                    Err(_) => debug!(%url, "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                        None => (None, String::new()),
                    };
                    events.emit(SocketEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    let reason = error.to_string();
                    events.emit(SocketEvent::Error(reason.clone()));
                    events.emit(SocketEvent::Closed { code: None, reason });
                    return;
                }
                None => {
                    events.emit(SocketEvent::Closed { code: None, reason: "stream ended".to_string() });
                    return;
                }
            },
        }
    }
}
