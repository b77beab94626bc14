//! Physical websocket connection and frame handling

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::ChannelError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of an open connection.
pub struct SocketWriter {
    sink: SplitSink<WsStream, Message>,
}

/// Read half of an open connection.
pub struct SocketReader {
    stream: SplitStream<WsStream>,
}

/// A frame surfaced to the channel.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    /// Server ping; the caller should answer with a pong.
    Ping(Vec<u8>),
}

/// Open the websocket and split it into halves.
pub async fn open(endpoint: &Url) -> Result<(SocketWriter, SocketReader), ChannelError> {
    tracing::info!("Connecting WebSocket to {}", endpoint);

    let (stream, response) = connect_async(endpoint.as_str()).await?;
    tracing::info!("WebSocket connected (status={})", response.status());

    let (sink, stream) = stream.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}

impl SocketWriter {
    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<(), ChannelError> {
        tracing::debug!("WS send: {}", msg);
        self.sink.send(Message::Text(msg.to_string())).await?;
        Ok(())
    }

    pub async fn pong(&mut self, data: Vec<u8>) -> Result<(), ChannelError> {
        self.sink.send(Message::Pong(data)).await?;
        Ok(())
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            tracing::debug!("Close frame not sent: {}", e);
        }
        let _ = self.sink.close().await;
    }
}

impl SocketReader {
    /// Receive the next text or ping frame. `Ok(None)` means the peer closed.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(Frame::Text(text)));
                }
                Some(Ok(Message::Ping(data))) => return Ok(Some(Frame::Ping(data))),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }
}
