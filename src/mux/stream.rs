//! Stream handles and per-stream state.
//!
//! A [`MuxStream`] is a reliable, ordered, full-duplex byte pipe inside a
//! session. Reads drain chunks queued by the session task; writes hand data
//! frames to the session task, bounded by the peer's receive window. The
//! halves split like a TCP stream's: shutting down the write half sends FIN
//! and is observable as EOF on the peer's read side, while the read side
//! stays usable.

use super::frame::Frame;
use super::session::Command;
use super::{INITIAL_WINDOW, MAX_DATA_FRAME};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// State shared between a stream's halves and the session task.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    recv: Mutex<RecvState>,
    send: Mutex<SendState>,
}

struct RecvState {
    chunks: VecDeque<Bytes>,
    /// Bytes the peer may still send before a window update.
    window: u32,
    /// Bytes consumed locally but not yet credited back to the peer.
    credit_owed: u32,
    fin: bool,
    reset: bool,
    waker: Option<Waker>,
}

struct SendState {
    /// Bytes we may still send before the peer credits us.
    window: u32,
    fin_sent: bool,
    reset: bool,
    waker: Option<Waker>,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        Arc::new(StreamShared {
            id,
            recv: Mutex::new(RecvState {
                chunks: VecDeque::new(),
                window: INITIAL_WINDOW,
                credit_owed: 0,
                fin: false,
                reset: false,
                waker: None,
            }),
            send: Mutex::new(SendState {
                window: INITIAL_WINDOW,
                fin_sent: false,
                reset: false,
                waker: None,
            }),
        })
    }

    /// Queue bytes received from the peer. Returns false on a window
    /// violation, which is a protocol error at the session level.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        let mut recv = self.recv.lock().unwrap();
        if recv.reset || recv.fin {
            // Late data after FIN/RST; the sender already gave up on us.
            return true;
        }
        let len = data.len() as u32;
        if len > recv.window {
            return false;
        }
        recv.window -= len;
        recv.chunks.push_back(data);
        if let Some(waker) = recv.waker.take() {
            waker.wake();
        }
        true
    }

    /// Record the peer's FIN: buffered bytes still drain, then EOF.
    pub(crate) fn set_fin(&self) {
        let mut recv = self.recv.lock().unwrap();
        recv.fin = true;
        if let Some(waker) = recv.waker.take() {
            waker.wake();
        }
    }

    /// Abort both directions. Pending and future reads and writes fail.
    pub(crate) fn set_reset(&self) {
        let mut recv = self.recv.lock().unwrap();
        recv.reset = true;
        recv.chunks.clear();
        if let Some(waker) = recv.waker.take() {
            waker.wake();
        }
        drop(recv);

        let mut send = self.send.lock().unwrap();
        send.reset = true;
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }

    /// Credit from a peer window update.
    pub(crate) fn add_send_window(&self, delta: u32) {
        let mut send = self.send.lock().unwrap();
        send.window = send.window.saturating_add(delta);
        if let Some(waker) = send.waker.take() {
            waker.wake();
        }
    }
}

/// One multiplexed stream. Splits into independently closable halves.
pub struct MuxStream {
    read: MuxReadHalf,
    write: MuxWriteHalf,
}

impl MuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>, cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        MuxStream {
            read: MuxReadHalf {
                shared: shared.clone(),
                cmd_tx: cmd_tx.clone(),
            },
            write: MuxWriteHalf { shared, cmd_tx },
        }
    }

    /// Stream id within the session.
    pub fn id(&self) -> u32 {
        self.read.shared.id
    }

    /// Split into owned read and write halves.
    pub fn into_split(self) -> (MuxReadHalf, MuxWriteHalf) {
        (self.read, self.write)
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().read).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_shutdown(cx)
    }
}

/// Read half of a [`MuxStream`].
pub struct MuxReadHalf {
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl AsyncRead for MuxReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let mut recv = me.shared.recv.lock().unwrap();

        if recv.chunks.is_empty() {
            if recv.reset {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )));
            }
            if recv.fin {
                return Poll::Ready(Ok(()));
            }
            recv.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut copied = 0usize;
        while buf.remaining() > 0 {
            let Some(front) = recv.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            copied += n;
            if front.is_empty() {
                recv.chunks.pop_front();
            }
        }

        // Credit the peer once half the window has been consumed.
        recv.credit_owed += copied as u32;
        if !recv.fin && recv.credit_owed >= INITIAL_WINDOW / 2 {
            let delta = recv.credit_owed;
            recv.credit_owed = 0;
            recv.window += delta;
            let _ = me
                .cmd_tx
                .send(Command::Frame(Frame::window_update(me.shared.id, delta)));
        }

        Poll::Ready(Ok(()))
    }
}

/// Write half of a [`MuxStream`]. Shutdown sends FIN: the peer reads EOF
/// after draining, its write direction unaffected.
pub struct MuxWriteHalf {
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl AsyncWrite for MuxWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let me = self.get_mut();
        let mut send = me.shared.send.lock().unwrap();

        if send.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream reset",
            )));
        }
        if send.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if send.window == 0 {
            send.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(send.window as usize).min(MAX_DATA_FRAME);
        send.window -= n as u32;
        let frame = Frame::data(me.shared.id, Bytes::copy_from_slice(&buf[..n]));
        if me.cmd_tx.send(Command::Frame(frame)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session task on write.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let mut send = me.shared.send.lock().unwrap();
        if !send.fin_sent && !send.reset {
            send.fin_sent = true;
            let _ = me.cmd_tx.send(Command::Frame(Frame::fin(me.shared.id)));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxWriteHalf {
    fn drop(&mut self) {
        let mut send = self.shared.send.lock().unwrap();
        if !send.fin_sent && !send.reset {
            send.fin_sent = true;
            let _ = self.cmd_tx.send(Command::Frame(Frame::fin(self.shared.id)));
        }
    }
}
