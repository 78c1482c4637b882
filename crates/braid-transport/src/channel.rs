//! One framed, heartbeated transport connection.
//!
//! A channel owns a TCP stream split into two pumps:
//!
//! - the **write pump** drains the bounded intake queue and a 1 s probe
//!   ticker, framing batches onto the wire;
//! - the **read pump** parses and verifies frames under a 5 s deadline,
//!   answers probes inline, feeds replies to the heartbeat stage, and
//!   forwards data packets to the consumer sink.
//!
//! Client channels know their sink at construction. Server channels learn
//! it lazily: the first verified frame carries the peer's user id, which
//! the [`ServerInitDelegate`] resolves into a sink before the write pump
//! is released.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use braid_core::error::FrameError;
use braid_core::{Frame, Packet, PacketType, Session};

use crate::constants::{HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, INTAKE_CAPACITY, READ_TIMEOUT};
use crate::error::{is_closed_error, is_transient_error, ChannelError};
use crate::flow::Flow;
use crate::heartbeat::{HeartBeatStage, HeartBeatStat};
use crate::speed::{Speed, SpeedInfo};

/// The consumer-provided sink receiving ordered data batches.
pub type PacketSink = mpsc::Sender<Vec<Packet>>;

/// Server-side lazy initialization, invoked at most once per channel upon
/// the first verified frame.
pub trait ServerInitDelegate: Send + Sync {
    /// Resolve the peer's user id into the sink its data packets go to.
    fn init(&self, user_id: u32) -> Result<PacketSink, Box<dyn std::error::Error + Send + Sync>>;

    /// Called after the sink is bound and the init barrier released.
    fn on_inited(&self, channel: &Arc<Channel>) {
        let _ = channel;
    }
}

/// A single framed connection between the two endpoints.
pub struct Channel {
    flow: Flow,
    session: Session,
    name: String,

    delegate: Option<Arc<dyn ServerInitDelegate>>,
    init_user: OnceLock<u32>,

    heartbeat: Arc<HeartBeatStage>,
    speed: Speed,

    in_tx: mpsc::Sender<Vec<Packet>>,
    in_rx: Mutex<Option<mpsc::Receiver<Vec<Packet>>>>,
    out: OnceLock<PacketSink>,
    init_tx: watch::Sender<bool>,

    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,

    exiting: AtomicBool,
    exit_error: Mutex<Option<ChannelError>>,
}

impl Channel {
    /// A client-mode channel: the receive sink is known up front and the
    /// init barrier is released immediately.
    pub fn client(parent: &Flow, session: Session, stream: TcpStream, out: PacketSink) -> Arc<Self> {
        let ch = Self::build(parent, session, stream, None);
        ch.mark_init(out);
        ch
    }

    /// A server-mode channel: the sink is resolved by `delegate` when the
    /// first verified frame arrives.
    pub fn server(
        parent: &Flow,
        session: Session,
        stream: TcpStream,
        delegate: Arc<dyn ServerInitDelegate>,
    ) -> Arc<Self> {
        Self::build(parent, session, stream, Some(delegate))
    }

    fn build(
        parent: &Flow,
        session: Session,
        stream: TcpStream,
        delegate: Option<Arc<dyn ServerInitDelegate>>,
    ) -> Arc<Self> {
        let name = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => format!("[{local} -> {peer}]"),
            _ => "[unknown]".to_string(),
        };
        // Frames are batched; leave Nagle on.
        let _ = stream.set_nodelay(false);
        let (reader, writer) = stream.into_split();

        let (in_tx, in_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (init_tx, _) = watch::channel(false);

        Arc::new(Self {
            flow: parent.fork(),
            session,
            name,
            delegate,
            init_user: OnceLock::new(),
            heartbeat: Arc::new(HeartBeatStage::new(HEARTBEAT_TIMEOUT)),
            speed: Speed::new(),
            in_tx,
            in_rx: Mutex::new(Some(in_rx)),
            out: OnceLock::new(),
            init_tx,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            exiting: AtomicBool::new(false),
            exit_error: Mutex::new(None),
        })
    }

    /// Start the read and write pumps and the heartbeat supervisor.
    /// Returns immediately.
    pub fn run(self: &Arc<Self>) {
        let reader = self.reader.lock().expect("reader poisoned").take();
        let writer = self.writer.lock().expect("writer poisoned").take();
        let in_rx = self.in_rx.lock().expect("intake poisoned").take();

        let (Some(reader), Some(writer), Some(in_rx)) = (reader, writer, in_rx) else {
            warn!("{}: run() called twice", self.name);
            return;
        };

        let ch = self.clone();
        self.flow
            .add_task(tokio::spawn(async move { ch.read_pump(reader).await }));

        let ch = self.clone();
        self.flow
            .add_task(tokio::spawn(
                async move { ch.write_pump(writer, in_rx).await },
            ));

        let hb = self.heartbeat.clone();
        let flow = self.flow.clone();
        let ch = self.clone();
        self.flow.add_task(tokio::spawn(async move {
            if let Some(err) = hb.supervise(flow).await {
                ch.heartbeat_clean(err);
            }
        }));
    }

    /// The bounded intake the group enqueues outbound batches into.
    pub fn chan_write(&self) -> PacketSink {
        self.in_tx.clone()
    }

    /// Current `(round_trip, since_last_commit)` sample.
    pub fn latency(&self) -> (std::time::Duration, std::time::Duration) {
        self.heartbeat.latency()
    }

    /// Register a hook invoked exactly once when the channel closes.
    pub fn add_on_close(&self, f: impl FnOnce() + Send + 'static) {
        self.flow.add_on_close(f);
    }

    /// Close the channel: idempotent; cancels both pumps, which shuts the
    /// underlying stream down.
    pub fn close(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        match &*self.exit_error.lock().expect("exit_error poisoned") {
            Some(err) => info!("{}: closed: {err}", self.name),
            None => debug!("{}: closed", self.name),
        }
        self.flow.close();
    }

    pub fn is_closed(&self) -> bool {
        self.flow.is_closed()
    }

    /// Wait until the channel has closed.
    pub async fn closed(&self) {
        self.flow.closed().await;
    }

    /// Display name built from the stream's local and remote addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Heartbeat counters.
    pub fn stat(&self) -> HeartBeatStat {
        self.heartbeat.stat()
    }

    /// Traffic counters; the rate window resets on every call.
    pub fn speed(&self) -> SpeedInfo {
        self.speed.snapshot()
    }

    /// The peer's user id for server channels once initialized, otherwise
    /// the session's own.
    pub fn user_id(&self) -> u32 {
        self.init_user
            .get()
            .copied()
            .unwrap_or_else(|| self.session.user_id())
    }

    /// The first fatal pump error, if the channel died of one.
    pub fn exit_error(&self) -> Option<String> {
        self.exit_error
            .lock()
            .expect("exit_error poisoned")
            .as_ref()
            .map(|e| e.to_string())
    }

    fn heartbeat_clean(&self, err: ChannelError) {
        self.record_exit(err);
        self.close();
    }

    fn record_exit(&self, err: ChannelError) {
        let mut slot = self.exit_error.lock().expect("exit_error poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn is_server_uninit(&self) -> bool {
        self.delegate.is_some() && self.out.get().is_none()
    }

    fn mark_init(&self, out: PacketSink) {
        let _ = self.out.set(out);
        // send_replace: the barrier may be released before the write pump
        // has subscribed.
        self.init_tx.send_replace(true);
    }

    /// Enqueue onto `sink`, yielding if the flow closes first. Returns
    /// whether the batch was accepted.
    async fn send_safe(&self, sink: &PacketSink, batch: Vec<Packet>) -> bool {
        tokio::select! {
            _ = self.flow.closed() => false,
            sent = sink.send(batch) => sent.is_ok(),
        }
    }

    async fn raw_write(&self, writer: &mut OwnedWriteHalf, batch: &[Packet]) -> io::Result<()> {
        let bytes = self.session.wrap(batch).encode();
        writer.write_all(&bytes).await?;
        self.speed.upload(bytes.len() as u64);
        Ok(())
    }

    async fn write_pump(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut in_rx: mpsc::Receiver<Vec<Packet>>,
    ) {
        // Hold at the init barrier until the sink is bound.
        let mut init_rx = self.init_tx.subscribe();
        let ready = tokio::select! {
            _ = self.flow.closed() => false,
            res = init_rx.wait_for(|inited| *inited) => res.is_ok(),
        };

        if ready {
            let mut tick = interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // The write itself is raced against cancellation too: a
                // peer that stops reading fills the send buffer, and a
                // blocked write_all must not pin the pump past close().
                let written = tokio::select! {
                    _ = self.flow.closed() => break,
                    _ = tick.tick() => {
                        let probe = self.heartbeat.new_probe();
                        let res = tokio::select! {
                            _ = self.flow.closed() => break,
                            res = self.raw_write(&mut writer, std::slice::from_ref(&probe)) => res,
                        };
                        self.heartbeat.add(&probe);
                        res
                    }
                    batch = in_rx.recv() => match batch {
                        Some(batch) => tokio::select! {
                            _ = self.flow.closed() => break,
                            res = self.raw_write(&mut writer, &batch) => res,
                        },
                        None => break,
                    }
                };

                if let Err(err) = written {
                    if !is_closed_error(&err) {
                        self.record_exit(ChannelError::Write(err));
                    }
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        self.close();
    }

    async fn read_pump(self: Arc<Self>, reader: OwnedReadHalf) {
        let mut reader = BufReader::new(reader);

        while !self.flow.is_closed() {
            // Deadline refreshes every iteration so cancellation is
            // re-checked even on a silent peer.
            let frame = match timeout(READ_TIMEOUT, Frame::read(&mut reader)).await {
                Err(_) => continue,
                Ok(Err(FrameError::Io(err))) => {
                    if is_transient_error(&err) {
                        continue;
                    }
                    if !is_closed_error(&err) {
                        self.record_exit(ChannelError::Read(err));
                    }
                    break;
                }
                Ok(Err(err)) => {
                    self.record_exit(err.into());
                    break;
                }
                Ok(Ok(frame)) => frame,
            };

            if let Err(err) = frame.verify(&self.session) {
                self.record_exit(err.into());
                break;
            }

            if self.is_server_uninit() {
                let user_id = frame.user_id();
                let delegate = self
                    .delegate
                    .clone()
                    .expect("server mode implies a delegate");
                match delegate.init(user_id) {
                    Ok(out) => {
                        let _ = self.init_user.set(user_id);
                        self.mark_init(out);
                        delegate.on_inited(&self);
                        debug!("{}: initialized for user {user_id}", self.name);
                    }
                    Err(err) => {
                        self.record_exit(ChannelError::InitFailed {
                            user_id,
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }

            let packets = match frame.unmarshal() {
                Ok(packets) => packets,
                Err(err) => {
                    self.record_exit(err.into());
                    break;
                }
            };

            if !self.on_receive(packets).await {
                break;
            }
        }

        self.close();
    }

    /// Classify a received batch: answer probes on our own intake, commit
    /// replies, forward the data remainder in order.
    async fn on_receive(&self, packets: Vec<Packet>) -> bool {
        let mut buffer = Vec::with_capacity(packets.len());
        for p in packets {
            self.speed.download(p.size() as u64);
            match p.ptype() {
                PacketType::Heartbeat => {
                    let in_tx = self.in_tx.clone();
                    if !self.send_safe(&in_tx, vec![p.reply()]).await {
                        return false;
                    }
                }
                PacketType::HeartbeatReply => self.heartbeat.receive(&p),
                PacketType::Data => buffer.push(p),
            }
        }

        if buffer.is_empty() {
            return true;
        }
        let Some(out) = self.out.get() else {
            // Data ahead of init only happens server-side, and init runs
            // before unmarshal; an unbound sink here means teardown races.
            return false;
        };
        let out = out.clone();
        self.send_safe(&out, buffer).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn session(user_id: u32) -> Session {
        Session::new([0x77; 32], user_id)
    }

    struct TestDelegate {
        sink: PacketSink,
        inited: AtomicUsize,
    }

    impl TestDelegate {
        fn new(sink: PacketSink) -> Arc<Self> {
            Arc::new(Self {
                sink,
                inited: AtomicUsize::new(0),
            })
        }
    }

    impl ServerInitDelegate for TestDelegate {
        fn init(
            &self,
            _user_id: u32,
        ) -> Result<PacketSink, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.sink.clone())
        }

        fn on_inited(&self, _channel: &Arc<Channel>) {
            self.inited.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A connected client/server channel pair over loopback TCP.
    async fn channel_pair(
        flow: &Flow,
    ) -> (
        Arc<Channel>,
        Arc<Channel>,
        mpsc::Receiver<Vec<Packet>>,
        mpsc::Receiver<Vec<Packet>>,
        Arc<TestDelegate>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = TcpStream::connect(addr);
        let (client_stream, accepted) = tokio::join!(connect, listener.accept());
        let (server_stream, _) = accepted.unwrap();

        let (client_out_tx, client_out_rx) = mpsc::channel(16);
        let (server_out_tx, server_out_rx) = mpsc::channel(16);

        let delegate = TestDelegate::new(server_out_tx);
        let client = Channel::client(flow, session(1), client_stream.unwrap(), client_out_tx);
        let server = Channel::server(flow, session(2), server_stream, delegate.clone());

        client.run();
        server.run();
        (client, server, client_out_rx, server_out_rx, delegate)
    }

    #[tokio::test]
    async fn data_flows_in_order_and_lazy_init_fires_once() {
        let flow = Flow::new();
        let (client, server, _client_rx, mut server_rx, delegate) = channel_pair(&flow).await;

        for i in 0..10u8 {
            let accepted = client
                .chan_write()
                .send(vec![Packet::data(vec![i])])
                .await
                .is_ok();
            assert!(accepted);
        }

        let mut got = Vec::new();
        while got.len() < 10 {
            let batch = tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
                .await
                .expect("timed out waiting for data")
                .expect("sink closed");
            for p in batch {
                got.push(p.into_payload()[0]);
            }
        }
        // FIFO within a single channel.
        assert_eq!(got, (0..10).collect::<Vec<u8>>());
        assert_eq!(delegate.inited.load(Ordering::SeqCst), 1);
        assert_eq!(server.user_id(), 1);

        flow.close();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_commits_latency_both_ways() {
        let flow = Flow::new();
        let (client, server, _crx, _srx, _delegate) = channel_pair(&flow).await;

        // Server only starts probing after lazy init, which needs a first
        // frame from the client; the client's 1 s probe tick provides it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let fresh = |ch: &Arc<Channel>| {
                let stat = ch.stat();
                stat.received >= 1
            };
            if fresh(&client) && fresh(&server) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no heartbeat commit within deadline"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let (rtt, since) = client.latency();
        assert!(rtt < Duration::from_secs(1), "loopback rtt was {rtt:?}");
        assert!(since < Duration::from_secs(3));

        flow.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_on_close_fires_once() {
        let flow = Flow::new();
        let (client, _server, _crx, _srx, _delegate) = channel_pair(&flow).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        client.add_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.close();
        client.close();
        client.close();

        assert!(client.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(client.exit_error().is_none());

        flow.close();
    }

    #[tokio::test]
    async fn peer_disconnect_closes_without_exit_error() {
        let flow = Flow::new();
        let (client, server, _crx, _srx, _delegate) = channel_pair(&flow).await;

        server.close();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !client.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client did not observe peer close"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // A closed stream is graceful termination, not a fault.
        assert!(client.exit_error().is_none());

        flow.close();
    }

    #[tokio::test]
    async fn garbage_frame_is_fatal() {
        let flow = Flow::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = TcpStream::connect(addr);
        let (client_stream, accepted) = tokio::join!(connect, listener.accept());
        let (mut raw_peer, _) = accepted.unwrap();

        let (out_tx, _out_rx) = mpsc::channel(4);
        let client = Channel::client(&flow, session(1), client_stream.unwrap(), out_tx);
        client.run();

        // Valid magic, bogus stamp.
        let forged = session(1).wrap(&[Packet::data(b"x".to_vec())]);
        let mut bytes = forged.encode();
        bytes[8] ^= 0xFF;
        raw_peer.write_all(&bytes).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !client.is_closed() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let err = client.exit_error().expect("verify failure must be recorded");
        assert!(err.contains("stamp"), "unexpected exit error: {err}");

        flow.close();
    }

    #[tokio::test]
    async fn probe_gets_reply_with_same_payload() {
        let flow = Flow::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connect = TcpStream::connect(addr);
        let (client_stream, accepted) = tokio::join!(connect, listener.accept());
        let (raw_peer, _) = accepted.unwrap();
        let (mut peer_read, mut peer_write) = raw_peer.into_split();

        let (out_tx, _out_rx) = mpsc::channel(4);
        let s = session(1);
        let client = Channel::client(&flow, s.clone(), client_stream.unwrap(), out_tx);
        client.run();

        // Hand-deliver a probe and read frames until its echo comes back.
        let probe_payload = vec![0xAB; 8];
        let probe_frame = s.wrap(&[Packet::heartbeat(probe_payload.clone())]);
        probe_frame.write(&mut peer_write).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = Frame::read(&mut peer_read).await.unwrap();
                for p in frame.unmarshal().unwrap() {
                    if p.ptype() == PacketType::HeartbeatReply {
                        return p;
                    }
                }
            }
        })
        .await
        .expect("no heartbeat reply within deadline");

        assert_eq!(reply.payload(), &probe_payload[..]);

        flow.close();
    }
}
