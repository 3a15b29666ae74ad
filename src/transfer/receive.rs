//! RECEIVE role: write peer data to the local file
//!
//! Each block read from the socket is appended to the output file and
//! acknowledged with the cumulative received count as a 4-byte big-endian
//! integer — the counterpart the send role waits on. An output file left
//! empty by a failed transfer is deleted on close rather than littering
//! the download directory with stubs.

use std::io;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::event::{DccEvent, EventSender};
use crate::net::SessionIo;

use super::TransferSession;

pub(super) struct ReceiveIo {
    session: Arc<TransferSession>,
    events: EventSender,
    file: Option<File>,
    stream: Option<TcpStream>,
    block: Vec<u8>,
    /// Cumulative bytes received, based at the resume offset
    received: u64,
}

impl ReceiveIo {
    pub(super) fn new(session: Arc<TransferSession>, events: EventSender) -> Self {
        let block = vec![0u8; session.block_size()];
        Self {
            session,
            events,
            file: None,
            stream: None,
            block,
            received: 0,
        }
    }

    async fn finish_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }
}

impl SessionIo for ReceiveIo {
    async fn socket_opened(&mut self, stream: TcpStream) -> io::Result<()> {
        let start = self.session.start_position();
        let file = if start > 0 {
            // Resumed transfer continues the existing file
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.session.path())
                .await?
        } else {
            File::create(self.session.path()).await?
        };
        self.received = start;
        self.file = Some(file);
        self.stream = Some(stream);
        Ok(())
    }

    async fn handle_socket(&mut self) -> io::Result<bool> {
        let read = match self.stream.as_mut() {
            Some(stream) => stream.read(&mut self.block).await?,
            None => return Ok(false),
        };
        if read == 0 {
            // Peer closed before the declared size: incomplete transfer
            self.finish_file().await;
            return Ok(false);
        }

        let _ = self.events.send(DccEvent::DataTransferred {
            id: self.session.id(),
            bytes: read,
        });

        let Some(file) = self.file.as_mut() else {
            return Ok(false);
        };
        file.write_all(&self.block[..read]).await?;
        self.received += read as u64;
        self.session.add_bytes(read as u64);

        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        stream.write_u32(self.received as u32).await?;
        stream.flush().await?;

        if self.session.size() == Some(self.received) {
            self.finish_file().await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn socket_closed(&mut self) {
        self.finish_file().await;
        self.stream = None;

        // A transfer that produced no data leaves no stub behind
        if let Ok(meta) = tokio::fs::metadata(self.session.path()).await {
            if meta.len() == 0 {
                let _ = tokio::fs::remove_file(self.session.path()).await;
            }
        }
    }
}
