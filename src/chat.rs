//! DCC CHAT transport
//!
//! A line-oriented text stream over the session engine. Inbound lines are
//! forwarded to the observer as [`DccEvent::ChatLine`]; outbound lines are
//! queued through the handle and written with a trailing CRLF by a writer
//! task, so `send_line` never blocks and never touches the socket from the
//! caller's thread.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{DccEvent, EventSender, SessionId};
use crate::net::{self, Endpoint, Lifecycle, NetError, SessionIo};

/// Handle to a DCC chat session
///
/// Dropping the handle does not end the session; call [`DccChat::close`].
pub struct DccChat {
    id: SessionId,
    line_tx: mpsc::UnboundedSender<String>,
    writable: Arc<AtomicBool>,
    lifecycle: Arc<Lifecycle>,
}

impl DccChat {
    /// Open a chat by connecting to the peer's advertised endpoint
    pub fn connect(addr: SocketAddr, events: EventSender) -> DccChat {
        Self::spawn(Endpoint::Connect(addr), events)
    }

    /// Open a chat by listening for the peer; returns the bound port
    pub fn listen(events: EventSender) -> io::Result<(DccChat, u16)> {
        let listener = net::bind_listener(0)?;
        let port = listener.local_addr()?.port();
        Ok((Self::spawn(Endpoint::Listen(listener), events), port))
    }

    /// Like [`listen`](Self::listen), trying each port in `[first, last]`
    pub fn listen_in_range(
        first: u16,
        last: u16,
        events: EventSender,
    ) -> Result<(DccChat, u16), NetError> {
        let listener = net::listen_in_range(first, last)?;
        let port = listener.local_addr().map_err(NetError::Io)?.port();
        Ok((Self::spawn(Endpoint::Listen(listener), events), port))
    }

    fn spawn(endpoint: Endpoint, events: EventSender) -> DccChat {
        let id = SessionId::next();
        let (lifecycle, close_rx) = Lifecycle::new();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let writable = Arc::new(AtomicBool::new(false));
        let io = ChatIo {
            id,
            events: events.clone(),
            reader: None,
            outbound: Some(line_rx),
            writer_task: None,
            writable: Arc::clone(&writable),
        };
        tokio::spawn(net::run(
            id,
            endpoint,
            close_rx,
            Arc::clone(&lifecycle),
            events,
            io,
        ));
        DccChat { id, line_tx, writable, lifecycle }
    }

    /// This session's identifier, as carried by its events
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue one line for the peer
    ///
    /// Silently dropped while the socket is not writable, before the
    /// connection opens as well as after it closes.
    pub fn send_line(&self, line: &str) {
        if !self.writable.load(Ordering::Acquire) {
            return;
        }
        let _ = self.line_tx.send(line.to_string());
    }

    /// Close the session; idempotent, safe from any task
    pub fn close(&self) {
        self.lifecycle.request_close();
    }
}

struct ChatIo {
    id: SessionId,
    events: EventSender,
    reader: Option<BufReader<OwnedReadHalf>>,
    outbound: Option<mpsc::UnboundedReceiver<String>>,
    writer_task: Option<JoinHandle<()>>,
    writable: Arc<AtomicBool>,
}

impl SessionIo for ChatIo {
    async fn socket_opened(&mut self, stream: TcpStream) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));

        // The writer task owns the write half so outbound lines never
        // interleave with the read loop
        if let Some(mut outbound) = self.outbound.take() {
            self.writer_task = Some(tokio::spawn(async move {
                while let Some(text) = outbound.recv().await {
                    if write_half.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    if write_half.write_all(b"\r\n").await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
            }));
        }
        self.writable.store(true, Ordering::Release);
        Ok(())
    }

    async fn handle_socket(&mut self) -> io::Result<bool> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(false);
        }
        let text = line.trim_end_matches(['\r', '\n']).to_string();
        let _ = self.events.send(DccEvent::ChatLine { id: self.id, line: text });
        Ok(true)
    }

    async fn socket_closed(&mut self) {
        self.writable.store(false, Ordering::Release);
        self.reader = None;
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut crate::event::EventReceiver) -> DccEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_chat_line_exchange() {
        let (tx, mut rx) = event_channel();

        let (listener_chat, port) = DccChat::listen(tx.clone()).unwrap();
        let connector_chat =
            DccChat::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), tx);

        // Both sessions open
        let mut opened = 0;
        while opened < 2 {
            if let DccEvent::SocketOpened { .. } = next_event(&mut rx).await {
                opened += 1;
            }
        }

        connector_chat.send_line("hello there");
        loop {
            if let DccEvent::ChatLine { id, line } = next_event(&mut rx).await {
                assert_eq!(id, listener_chat.id());
                assert_eq!(line, "hello there");
                break;
            }
        }

        listener_chat.send_line("right back at you");
        loop {
            if let DccEvent::ChatLine { id, line } = next_event(&mut rx).await {
                assert_eq!(id, connector_chat.id());
                assert_eq!(line, "right back at you");
                break;
            }
        }

        listener_chat.close();
        connector_chat.close();
        let mut closed = 0;
        while closed < 2 {
            if let DccEvent::SocketClosed { .. } = next_event(&mut rx).await {
                closed += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_chat_peer_disconnect_closes_session() {
        let (tx, mut rx) = event_channel();

        let (chat, port) = DccChat::listen(tx).unwrap();
        let peer = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();

        loop {
            if let DccEvent::SocketOpened { id } = next_event(&mut rx).await {
                assert_eq!(id, chat.id());
                break;
            }
        }

        drop(peer);
        loop {
            if let DccEvent::SocketClosed { id } = next_event(&mut rx).await {
                assert_eq!(id, chat.id());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_send_line_after_close_is_silent() {
        let (tx, mut rx) = event_channel();
        let (chat, _port) = DccChat::listen(tx).unwrap();

        chat.close();
        chat.close();

        loop {
            if let DccEvent::SocketClosed { id } = next_event(&mut rx).await {
                assert_eq!(id, chat.id());
                break;
            }
        }

        // No session behind it anymore; must not panic or error
        chat.send_line("into the void");
    }
}
