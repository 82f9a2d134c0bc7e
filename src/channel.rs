use crate::buffer::WriteBuf;
use crate::config::Config;
use crate::predictor::{AdaptiveSizePredictor, SizePredictor};
use bytes::Bytes;
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use mio::Token;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of one non-blocking read against a channel's socket.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A stream read returned `n` bytes
    Data(usize),
    /// No bytes were immediately available
    WouldBlock,
    /// The peer closed its end of the stream
    Eof,
    /// A datagram of `n` bytes arrived from the given source
    Datagram(usize, SocketAddr),
}

/// The non-blocking socket operations a processor drives for one channel.
///
/// The protocol strategy is selected when the channel is constructed; the
/// processor itself never branches on the transport. `write` returns `Ok(0)`
/// when the kernel send buffer is saturated.
pub trait ChannelIo: Send {
    /// Issue one non-blocking read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Issue one non-blocking write of `buf`, directed at `remote` for
    /// datagram sockets.
    fn write(&mut self, buf: &[u8], remote: Option<SocketAddr>) -> io::Result<usize>;

    /// The selector registration handle for the underlying socket.
    fn source(&mut self) -> io::Result<&mut dyn Source>;

    /// Whether the underlying transport still holds a live connection.
    /// Datagram sockets have no connection to lose and always return true.
    fn is_connected(&self) -> bool;

    /// Release the underlying socket.
    fn close(&mut self) -> io::Result<()>;
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel already closed")
}

struct TcpIo {
    stream: Option<TcpStream>,
}

impl TcpIo {
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(closed)
    }
}

impl ChannelIo for TcpIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.stream()?.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8], _remote: Option<SocketAddr>) -> io::Result<usize> {
        match self.stream()?.write(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn source(&mut self) -> io::Result<&mut dyn Source> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(closed()),
        }
    }

    fn is_connected(&self) -> bool {
        match self.stream.as_ref() {
            Some(stream) => stream.peer_addr().is_ok(),
            None => false,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the stream closes the descriptor and cancels any
        // outstanding selector registration.
        drop(self.stream.take());
        Ok(())
    }
}

struct UdpIo {
    socket: Option<UdpSocket>,
}

impl UdpIo {
    fn socket(&mut self) -> io::Result<&mut UdpSocket> {
        self.socket.as_mut().ok_or_else(closed)
    }
}

impl ChannelIo for UdpIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.socket()?.recv_from(buf) {
            Ok((n, remote)) => Ok(ReadOutcome::Datagram(n, remote)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8], remote: Option<SocketAddr>) -> io::Result<usize> {
        let remote = match remote {
            Some(addr) => addr,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "datagram channel has no remote address",
                ))
            }
        };
        match self.socket()?.send_to(buf, remote) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn source(&mut self) -> io::Result<&mut dyn Source> {
        match self.socket.as_mut() {
            Some(socket) => Ok(socket),
            None => Err(closed()),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) -> io::Result<()> {
        drop(self.socket.take());
        Ok(())
    }
}

pub(crate) mod interest {
    pub const READ: u8 = 0b01;
    pub const WRITE: u8 = 0b10;
}

pub(crate) fn interest_from_bits(bits: u8) -> Option<mio::Interest> {
    let mut interests = None;
    if bits & interest::READ != 0 {
        interests = Some(mio::Interest::READABLE);
    }
    if bits & interest::WRITE != 0 {
        interests = Some(match interests {
            Some(i) => i | mio::Interest::WRITABLE,
            None => mio::Interest::WRITABLE,
        });
    }
    interests
}

const STATE_NEW: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

const NO_TOKEN: usize = usize::MAX;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A non-blocking byte channel registered with a processor.
///
/// A channel owns exactly one socket. After submission via
/// `Processor::add`, the worker thread is the only reader and writer of the
/// socket; other threads interact with the channel by enqueueing outbound
/// buffers with `write` and asking the processor to flush.
pub struct Channel {
    id: u64,
    io: Mutex<Box<dyn ChannelIo>>,
    local_addr: SocketAddr,
    remote_addr: Mutex<Option<SocketAddr>>,
    token: AtomicUsize,
    interest: AtomicU8,
    state: AtomicU8,
    flush_scheduled: AtomicBool,
    last_io_time_ms: AtomicU64,
    write_queue: Mutex<VecDeque<WriteBuf>>,
    max_write_chunk: usize,
    predictor: Mutex<Box<dyn SizePredictor>>,
}

impl Channel {
    /// Wrap a non-blocking TCP stream as a channel.
    pub fn tcp(stream: TcpStream, config: &Config) -> io::Result<Channel> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr().ok();
        let io = TcpIo { stream: Some(stream) };
        Ok(Channel::from_io(Box::new(io), local_addr, remote_addr, config))
    }

    /// Wrap a non-blocking UDP socket as a channel.
    ///
    /// For server-side channels `remote_addr` is `None` until the first
    /// datagram arrives and records its source.
    pub fn udp(
        socket: UdpSocket,
        remote_addr: Option<SocketAddr>,
        config: &Config,
    ) -> io::Result<Channel> {
        let local_addr = socket.local_addr()?;
        let io = UdpIo { socket: Some(socket) };
        Ok(Channel::from_io(Box::new(io), local_addr, remote_addr, config))
    }

    /// Build a channel over an arbitrary `ChannelIo` strategy.
    pub fn from_io(
        io: Box<dyn ChannelIo>,
        local_addr: SocketAddr,
        remote_addr: Option<SocketAddr>,
        config: &Config,
    ) -> Channel {
        let predictor = AdaptiveSizePredictor::new(
            config.min_read_buffer_size,
            config.read_buffer_size,
            config.max_read_buffer_size,
        );

        Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            io: Mutex::new(io),
            local_addr,
            remote_addr: Mutex::new(remote_addr),
            token: AtomicUsize::new(NO_TOKEN),
            interest: AtomicU8::new(0),
            state: AtomicU8::new(STATE_NEW),
            flush_scheduled: AtomicBool::new(false),
            last_io_time_ms: AtomicU64::new(now_millis()),
            write_queue: Mutex::new(VecDeque::new()),
            max_write_chunk: config.max_write_buffer_size,
            predictor: Mutex::new(Box::new(predictor)),
        }
    }

    /// Process-unique channel identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The local address the underlying socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote peer, if one is known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().unwrap()
    }

    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().unwrap() = Some(addr);
    }

    /// Enqueue an outbound payload.
    ///
    /// The buffer is transmitted once the owning processor flushes this
    /// channel; buffers drain in enqueue order.
    pub fn write(&self, data: Bytes) {
        self.write_queue.lock().unwrap().push_back(WriteBuf::new(data));
    }

    /// Milliseconds-since-epoch timestamp of the last observed I/O.
    pub fn last_io_time_ms(&self) -> u64 {
        self.last_io_time_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_io_time_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Returns true while the channel can still be driven by a processor.
    pub fn is_valid(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), STATE_NEW | STATE_OPEN)
    }

    /// Returns true once close has begun.
    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSING
    }

    /// Returns true once the channel reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    pub(crate) fn set_open(&self) {
        self.state.fetch_max(STATE_OPEN, Ordering::AcqRel);
    }

    pub(crate) fn set_closing(&self) {
        self.state.fetch_max(STATE_CLOSING, Ordering::AcqRel);
    }

    pub(crate) fn set_closed(&self) {
        self.state.fetch_max(STATE_CLOSED, Ordering::AcqRel);
    }

    /// Claim the ticket to enqueue this channel on the flushing queue.
    ///
    /// Returns true only for the caller that flipped the flag, which bounds
    /// the flushing queue to one entry per channel per flush cycle.
    pub(crate) fn claim_flush_ticket(&self) -> bool {
        !self.flush_scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_flush_ticket(&self) {
        self.flush_scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub(crate) fn clear_token(&self) {
        self.token.store(NO_TOKEN, Ordering::Release);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        match self.token.load(Ordering::Acquire) {
            NO_TOKEN => None,
            raw => Some(Token(raw)),
        }
    }

    pub(crate) fn interest_bits(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    pub(crate) fn set_interest_bits(&self, bits: u8) {
        self.interest.store(bits, Ordering::Release);
    }

    /// Per-cycle byte budget for fair flushing.
    pub fn max_write_chunk(&self) -> usize {
        self.max_write_chunk
    }

    pub(crate) fn io(&self) -> MutexGuard<'_, Box<dyn ChannelIo>> {
        self.io.lock().unwrap()
    }

    pub(crate) fn next_read_size(&self) -> usize {
        self.predictor.lock().unwrap().next()
    }

    pub(crate) fn record_read_size(&self, actual: usize) {
        self.predictor.lock().unwrap().previous(actual);
    }

    pub(crate) fn take_write_buf(&self) -> Option<WriteBuf> {
        self.write_queue.lock().unwrap().pop_front()
    }

    pub(crate) fn restore_write_buf(&self, buf: WriteBuf) {
        self.write_queue.lock().unwrap().push_front(buf);
    }

    pub(crate) fn write_queue_is_empty(&self) -> bool {
        self.write_queue.lock().unwrap().is_empty()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            STATE_NEW => "new",
            STATE_OPEN => "open",
            STATE_CLOSING => "closing",
            _ => "closed",
        };
        fmt.debug_struct("Channel")
            .field("id", &self.id)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr())
            .field("state", &state)
            .finish()
    }
}
