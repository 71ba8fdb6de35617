//! Session establishment and the session task.
//!
//! A session owns one reliable byte stream (the safe tunnel). A dedicated
//! reader task decodes frames into a channel; the session task multiplexes
//! them onto streams and serializes every outgoing frame. Stream handles and
//! the cloneable [`MuxSession`] talk to the task through an unbounded command
//! channel, so nothing in a stream's read or write path ever blocks the
//! session task.

use super::frame::{
    Frame, FrameType, FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN, GO_AWAY_NORMAL,
    GO_AWAY_PROTO_ERROR, HEADER_LEN,
};
use super::stream::{MuxStream, StreamShared};
use super::{
    MuxError, ACCEPT_BACKLOG, INITIAL_WINDOW, KEEPALIVE_INTERVAL, MAX_STREAMS, PING_TIMEOUT,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// Requests sent to the session task.
pub(crate) enum Command {
    Open {
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration, MuxError>>,
    },
    /// A stream-scoped frame from a stream handle (data, FIN, window update).
    Frame(Frame),
    Close,
}

enum ReaderEvent {
    Frame(Frame),
    Error(MuxError),
    Closed,
}

/// Handle to a live mux session. Cheap to clone; all clones drive the same
/// session task. Closing the session aborts every outstanding stream.
#[derive(Clone)]
pub struct MuxSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    cmd_tx: mpsc::UnboundedSender<Command>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Start the client (initiator) side over an established carrier.
    /// Client streams use odd ids.
    pub fn client<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, true)
    }

    /// Start the server (acceptor) side. Server streams use even ids.
    pub fn server<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, false)
    }

    fn start<S>(io: S, client: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (event_tx, event_rx) = mpsc::channel(256);

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(read_frames(read_half, event_tx));

        let task = SessionTask {
            writer: BufWriter::new(write_half),
            streams: HashMap::new(),
            next_stream_id: if client { 1 } else { 2 },
            cmd_tx: cmd_tx.clone(),
            accept_tx,
            pending_pings: HashMap::new(),
            next_ping_id: 0,
            keepalive_pending: None,
            client,
        };
        tokio::spawn(task.run(cmd_rx, event_rx));

        MuxSession {
            inner: Arc::new(SessionInner {
                cmd_tx,
                accept_rx: Mutex::new(accept_rx),
            }),
        }
    }

    /// Open a new stream towards the peer.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Open { reply })
            .map_err(|_| MuxError::SessionClosed)?;
        response.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// Accept the next stream opened by the peer.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        self.inner
            .accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(MuxError::SessionClosed)
    }

    /// Measure a round trip to the peer.
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::Ping { reply })
            .map_err(|_| MuxError::SessionClosed)?;
        match tokio::time::timeout(PING_TIMEOUT, response).await {
            Err(_) => Err(MuxError::PingTimeout),
            Ok(Err(_)) => Err(MuxError::SessionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Close the session. Idempotent; outstanding streams abort.
    pub fn close(&self) {
        let _ = self.inner.cmd_tx.send(Command::Close);
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &MuxSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Decode frames off the carrier into the event channel.
async fn read_frames<R>(mut reader: R, events: mpsc::Sender<ReaderEvent>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let _ = events.send(ReaderEvent::Closed).await;
                return;
            }
            Err(e) => {
                let _ = events.send(ReaderEvent::Error(e.into())).await;
                return;
            }
        }

        let mut frame = match Frame::decode_header(&header) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(ReaderEvent::Error(e)).await;
                return;
            }
        };

        if frame.frame_type == FrameType::Data && frame.length > 0 {
            if frame.length > INITIAL_WINDOW {
                let _ = events
                    .send(ReaderEvent::Error(MuxError::Protocol(format!(
                        "data frame of {} bytes exceeds the window",
                        frame.length
                    ))))
                    .await;
                return;
            }
            let mut payload = vec![0u8; frame.length as usize];
            if let Err(e) = reader.read_exact(&mut payload).await {
                let _ = events.send(ReaderEvent::Error(e.into())).await;
                return;
            }
            frame.payload = Bytes::from(payload);
        }

        if events.send(ReaderEvent::Frame(frame)).await.is_err() {
            return;
        }
    }
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    local_fin: bool,
    remote_fin: bool,
}

struct PendingPing {
    sent: Instant,
    /// None for keepalive pings the session sends on its own behalf.
    reply: Option<oneshot::Sender<Result<Duration, MuxError>>>,
}

struct SessionTask<W> {
    writer: BufWriter<W>,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    accept_tx: mpsc::Sender<MuxStream>,
    pending_pings: HashMap<u32, PendingPing>,
    next_ping_id: u32,
    keepalive_pending: Option<u32>,
    client: bool,
}

impl<W> SessionTask<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::Receiver<ReaderEvent>,
    ) {
        let first_tick = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
        let mut keepalive = tokio::time::interval_at(first_tick, KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            let step = tokio::select! {
                event = event_rx.recv() => match event {
                    Some(ReaderEvent::Frame(frame)) => self.handle_frame(frame).await,
                    Some(ReaderEvent::Error(e)) => Err(e),
                    Some(ReaderEvent::Closed) | None => Err(MuxError::SessionClosed),
                },
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle is gone; nothing can use this session again.
                    None => Err(MuxError::SessionClosed),
                },
                _ = keepalive.tick() => self.keepalive().await,
            };

            match step {
                Ok(()) => {
                    // Coalesce queued commands into one flush.
                    let mut drained = Ok(());
                    for _ in 0..128 {
                        match cmd_rx.try_recv() {
                            Ok(command) => {
                                drained = self.handle_command(command).await;
                                if drained.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = drained {
                        break e;
                    }
                    if let Err(e) = self.writer.flush().await {
                        break e.into();
                    }
                }
                Err(e) => break e,
            }
        };

        match &reason {
            MuxError::SessionClosed | MuxError::GoAway(GO_AWAY_NORMAL) => {
                debug!("session ended")
            }
            MuxError::Protocol(msg) => {
                warn!(error = %msg, "session protocol error");
                let _ = self.write_frame(&Frame::go_away(GO_AWAY_PROTO_ERROR)).await;
            }
            e => warn!(error = %e, "session failed"),
        }
        self.teardown().await;
    }

    /// Abort all streams and close the carrier write side. Dropping
    /// `accept_tx` ends the accept loop; dropping pending ping repliers
    /// fails their waiters.
    async fn teardown(mut self) {
        for (_, entry) in self.streams.drain() {
            entry.shared.set_reset();
        }
        self.pending_pings.clear();
        let _ = self.writer.flush().await;
        let _ = self.writer.shutdown().await;
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        trace!(
            frame_type = ?frame.frame_type,
            stream = frame.stream_id,
            flags = frame.flags,
            length = frame.length,
            "frame received"
        );
        match frame.frame_type {
            FrameType::Ping => {
                if frame.has_flag(FLAG_SYN) {
                    self.write_frame(&Frame::pong(frame.length)).await?;
                } else if frame.has_flag(FLAG_ACK) {
                    self.handle_pong(frame.length);
                }
                Ok(())
            }
            FrameType::GoAway => {
                match frame.length {
                    GO_AWAY_NORMAL => debug!("remote closed the session"),
                    code => warn!(code, "remote went away"),
                }
                Err(MuxError::GoAway(frame.length))
            }
            FrameType::Data | FrameType::WindowUpdate => self.handle_stream_frame(frame).await,
        }
    }

    async fn handle_stream_frame(&mut self, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;
        if id == 0 {
            return Err(MuxError::Protocol(format!(
                "{:?} frame on the session id",
                frame.frame_type
            )));
        }

        if frame.has_flag(FLAG_SYN) {
            self.accept_stream(id).await?;
        }

        let Some(entry) = self.streams.get_mut(&id) else {
            // Stream already torn down; late frames are expected and ignored.
            trace!(stream = id, "frame for unknown stream");
            return Ok(());
        };

        match frame.frame_type {
            FrameType::Data => {
                // Bytes clones are reference counted.
                if !frame.payload.is_empty() && !entry.shared.push_data(frame.payload.clone()) {
                    return Err(MuxError::Protocol(format!(
                        "receive window exceeded on stream {id}"
                    )));
                }
            }
            FrameType::WindowUpdate => {
                if frame.length > 0 {
                    entry.shared.add_send_window(frame.length);
                }
            }
            _ => {}
        }

        if frame.has_flag(FLAG_RST) {
            entry.shared.set_reset();
            self.streams.remove(&id);
            return Ok(());
        }
        if frame.has_flag(FLAG_FIN) {
            entry.shared.set_fin();
            entry.remote_fin = true;
            if entry.local_fin {
                self.streams.remove(&id);
            }
        }
        Ok(())
    }

    /// A SYN for an id we have not seen: the peer is opening a stream.
    async fn accept_stream(&mut self, id: u32) -> Result<(), MuxError> {
        if self.streams.contains_key(&id) {
            return Ok(());
        }
        // The initiator of the connection opens odd ids, the acceptor even.
        let peer_opens_odd = !self.client;
        if (id % 2 == 1) != peer_opens_odd {
            return Err(MuxError::Protocol(format!(
                "SYN with wrong stream id parity: {id}"
            )));
        }
        if self.streams.len() >= MAX_STREAMS {
            warn!(stream = id, "too many streams; resetting");
            return self.write_frame(&Frame::reset(id)).await;
        }

        let shared = StreamShared::new(id);
        let stream = MuxStream::new(shared.clone(), self.cmd_tx.clone());
        match self.accept_tx.try_send(stream) {
            Ok(()) => {
                self.streams.insert(
                    id,
                    StreamEntry {
                        shared,
                        local_fin: false,
                        remote_fin: false,
                    },
                );
                self.write_frame(&Frame::accept(id)).await
            }
            Err(rejected) => {
                // Accept backlog full, or nobody is accepting anymore.
                warn!(stream = id, "inbound stream rejected");
                shared.set_reset();
                drop(rejected);
                self.write_frame(&Frame::reset(id)).await
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), MuxError> {
        match command {
            Command::Open { reply } => {
                let result = self.open_stream();
                let syn = result.as_ref().ok().map(|stream| Frame::open(stream.id()));
                let _ = reply.send(result);
                match syn {
                    // The SYN goes out before any command the opener queues next.
                    Some(frame) => self.write_frame(&frame).await,
                    None => Ok(()),
                }
            }
            Command::Ping { reply } => {
                let id = self.next_ping_id;
                self.next_ping_id = self.next_ping_id.wrapping_add(1);
                self.pending_pings.insert(
                    id,
                    PendingPing {
                        sent: Instant::now(),
                        reply: Some(reply),
                    },
                );
                self.write_frame(&Frame::ping(id)).await
            }
            Command::Frame(frame) => {
                let id = frame.stream_id;
                let Some(entry) = self.streams.get_mut(&id) else {
                    trace!(stream = id, "dropping frame for torn-down stream");
                    return Ok(());
                };
                let mut remove = false;
                if frame.has_flag(FLAG_FIN) {
                    entry.local_fin = true;
                    remove = entry.remote_fin;
                }
                if remove {
                    self.streams.remove(&id);
                }
                self.write_frame(&frame).await
            }
            Command::Close => {
                debug!("closing session");
                self.write_frame(&Frame::go_away(GO_AWAY_NORMAL)).await?;
                Err(MuxError::SessionClosed)
            }
        }
    }

    fn open_stream(&mut self) -> Result<MuxStream, MuxError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(MuxError::TooManyStreams);
        }
        let id = self.next_stream_id;
        self.next_stream_id = id.checked_add(2).ok_or(MuxError::StreamsExhausted)?;

        let shared = StreamShared::new(id);
        let stream = MuxStream::new(shared.clone(), self.cmd_tx.clone());
        self.streams.insert(
            id,
            StreamEntry {
                shared,
                local_fin: false,
                remote_fin: false,
            },
        );
        Ok(stream)
    }

    async fn keepalive(&mut self) -> Result<(), MuxError> {
        if self.keepalive_pending.is_some() {
            warn!("keepalive ping unanswered");
            return Err(MuxError::PingTimeout);
        }
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_pings.insert(
            id,
            PendingPing {
                sent: Instant::now(),
                reply: None,
            },
        );
        self.keepalive_pending = Some(id);
        self.write_frame(&Frame::ping(id)).await
    }

    fn handle_pong(&mut self, opaque: u32) {
        let Some(ping) = self.pending_pings.remove(&opaque) else {
            trace!(opaque, "pong without a ping");
            return;
        };
        if self.keepalive_pending == Some(opaque) {
            self.keepalive_pending = None;
        }
        if let Some(reply) = ping.reply {
            let _ = reply.send(Ok(ping.sent.elapsed()));
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<(), MuxError> {
        trace!(
            frame_type = ?frame.frame_type,
            stream = frame.stream_id,
            flags = frame.flags,
            length = frame.length,
            "frame sent"
        );
        self.writer.write_all(&frame.encode_header()).await?;
        if !frame.payload.is_empty() {
            self.writer.write_all(&frame.payload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::session_pair;
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn open_accept_and_exchange() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        let mut stream = client.open().await.unwrap();
        assert_eq!(stream.id() % 2, 1);
        stream.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_can_open_too() {
        let (client, server) = session_pair();

        let client_task = tokio::spawn(async move {
            let mut stream = client.accept().await.unwrap();
            assert_eq!(stream.id() % 2, 0);
            let mut line = Vec::new();
            stream.read_to_end(&mut line).await.unwrap();
            line
        });

        let mut stream = server.open().await.unwrap();
        stream.write_all(b"reverse").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(client_task.await.unwrap(), b"reverse");
    }

    #[tokio::test]
    async fn half_close_keeps_the_other_direction_usable() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let stream = server.accept().await.unwrap();
            let (mut read, mut write) = stream.into_split();

            // Drain the client's direction to EOF first.
            let mut received = Vec::new();
            read.read_to_end(&mut received).await.unwrap();

            // Our direction must still deliver.
            write.write_all(&received).await.unwrap();
            write.shutdown().await.unwrap();
            received
        });

        let stream = client.open().await.unwrap();
        let (mut read, mut write) = stream.into_split();

        write.write_all(b"0123456789").await.unwrap();
        write.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        read.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"0123456789");
        assert_eq!(server_task.await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn ping_measures_a_round_trip() {
        let (client, _server) = session_pair();
        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn close_aborts_streams_and_accept() {
        let (client, server) = session_pair();

        let mut stream = client.open().await.unwrap();
        stream.write_all(b"x").await.unwrap();

        let accepted = server.accept().await.unwrap();

        client.close();

        // Our side: reads and writes fail once the session is gone.
        let mut buf = [0u8; 1];
        assert!(stream.read_exact(&mut buf).await.is_err());

        // Peer side: the carrier dropped, the stream aborts, accept ends.
        let (mut read, _write) = accepted.into_split();
        let mut data = Vec::new();
        assert!(read.read_to_end(&mut data).await.is_err());
        assert!(matches!(
            server.accept().await,
            Err(MuxError::SessionClosed)
        ));

        // New opens on the closed session fail.
        assert!(client.open().await.is_err());
    }

    #[tokio::test]
    async fn large_transfer_crosses_window_boundaries() {
        let (client, server) = session_pair();
        let payload: Vec<u8> = (0..(INITIAL_WINDOW as usize * 3))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut stream = client.open().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(server_task.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn many_concurrent_streams() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..20 {
                let stream = server.accept().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let (mut read, mut write) = stream.into_split();
                    let mut data = Vec::new();
                    read.read_to_end(&mut data).await.unwrap();
                    write.write_all(&data).await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        });

        let mut tasks = Vec::new();
        for i in 0u8..20 {
            let session = client.clone();
            tasks.push(tokio::spawn(async move {
                let stream = session.open().await.unwrap();
                let (mut read, mut write) = stream.into_split();
                let message = vec![i; 100];
                write.write_all(&message).await.unwrap();
                write.shutdown().await.unwrap();
                let mut echoed = Vec::new();
                read.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, message);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        server_task.await.unwrap();
    }
}
