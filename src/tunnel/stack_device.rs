//! Packet channel presented to `ipstack` as its network device
//!
//! `ipstack` reads whole IP packets from an `AsyncRead` and writes whole
//! packets to an `AsyncWrite`. The relay feeds admitted host packets into
//! one channel and collects the stack's replies from the other.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub(crate) struct StackDevice {
    rx: mpsc::Receiver<Bytes>,
    tx: PollSender<Bytes>,
    /// Tail of a packet larger than the stack's last read buffer
    pending: Option<Bytes>,
}

impl StackDevice {
    /// Device plus the sender that feeds it and the receiver of its output
    pub fn create_pair(capacity: usize) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let device = Self {
            rx: in_rx,
            tx: PollSender::new(out_tx),
            pending: None,
        };
        (device, in_tx, out_rx)
    }
}

impl AsyncRead for StackDevice {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let mut packet = match this.pending.take() {
            Some(packet) => packet,
            None => match this.rx.poll_recv(cx) {
                Poll::Ready(Some(packet)) => packet,
                // Closed: end of file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            },
        };

        let n = packet.len().min(buf.remaining());
        buf.put_slice(&packet.split_to(n));
        if !packet.is_empty() {
            this.pending = Some(packet);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StackDevice {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => return Poll::Pending,
        }
        match this.tx.send_item(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
