//! SEND role: stream the local file to the peer
//!
//! One block per engine iteration: read from the file, write to the
//! socket, then wait until the peer's cumulative acknowledgement catches up
//! with the bytes sent. Turbo mode skips the wait entirely, relying on the
//! transport's own ordering, and only drains whatever acks the peer still
//! sends after the final block.

use std::io;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::TcpStream;

use crate::event::{DccEvent, EventSender};
use crate::net::SessionIo;

use super::TransferSession;

pub(super) struct SendIo {
    session: Arc<TransferSession>,
    events: EventSender,
    file: Option<File>,
    stream: Option<TcpStream>,
    block: Vec<u8>,
    /// Cumulative bytes sent, based at the resume offset
    sent: u64,
    /// Cumulative bytes the peer has acknowledged
    acked: u64,
}

impl SendIo {
    pub(super) fn new(session: Arc<TransferSession>, events: EventSender) -> Self {
        let block = vec![0u8; session.block_size()];
        Self {
            session,
            events,
            file: None,
            stream: None,
            block,
            sent: 0,
            acked: 0,
        }
    }

    /// Consume coalesced cumulative acks until the peer has caught up
    async fn wait_for_acks(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while self.acked < self.sent {
            let ack = stream.read_u32().await?;
            self.acked = u64::from(ack);
        }
        Ok(())
    }

    /// Best-effort drain of acks still in flight after the final block;
    /// ends when the peer closes or errors
    async fn drain_trailing_acks(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        while stream.read_u32().await.is_ok() {}
    }
}

impl SessionIo for SendIo {
    async fn socket_opened(&mut self, stream: TcpStream) -> io::Result<()> {
        let mut file = File::open(self.session.path()).await?;
        let start = self.session.start_position();
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        self.sent = start;
        self.acked = start;
        self.file = Some(file);
        self.stream = Some(stream);
        Ok(())
    }

    async fn handle_socket(&mut self) -> io::Result<bool> {
        let read = match self.file.as_mut() {
            Some(file) => file.read(&mut self.block).await?,
            None => return Ok(false),
        };
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };

        if read > 0 {
            let _ = self.events.send(DccEvent::DataTransferred {
                id: self.session.id(),
                bytes: read,
            });
            stream.write_all(&self.block[..read]).await?;
            stream.flush().await?;
            self.sent += read as u64;
            self.session.add_bytes(read as u64);
        }

        if !self.session.turbo() {
            self.wait_for_acks().await?;
        }

        if self.session.size() == Some(self.sent) {
            // Everything declared has been sent
            self.file = None;
            if self.session.turbo() {
                self.drain_trailing_acks().await;
            }
            return Ok(false);
        }

        if read == 0 {
            // Source ended before the declared size: incomplete transfer
            self.file = None;
            return Ok(false);
        }

        Ok(true)
    }

    async fn socket_closed(&mut self) {
        self.file = None;
        self.stream = None;
    }
}
