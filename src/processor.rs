use crate::buffer::{BufAllocator, WriteBuf};
use crate::channel::{interest, interest_from_bits, Channel, ReadOutcome};
use crate::config::{Config, Protocol};
use crate::dispatcher::{ChannelEvent, Dispatcher};
use crate::error::Error;
use crate::executor::{Executor, ThreadExecutor};
use crate::idle::IdleTimer;
use bytes::Bytes;
use crossbeam::queue::SegQueue;
use log::{debug, error, trace, warn};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use smallvec::SmallVec;
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SELECT_TIMEOUT: Duration = Duration::from_millis(1000);
const SPURIOUS_WAKEUP_THRESHOLD: Duration = Duration::from_millis(100);
const FLUSH_SPIN_COUNT: usize = 256;
const EVENTS_CAPACITY: usize = 256;

const WAKER_TOKEN: Token = Token(usize::MAX - 1);

type ReadySet = SmallVec<[(Token, bool, bool); 32]>;

/// Snapshot of a processor's queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStat {
    /// Channels submitted but not yet registered
    pub new_channel_count: usize,
    /// Channels waiting for a write drain
    pub flushing_channel_count: usize,
    /// Channels waiting for close reclamation
    pub closing_channel_count: usize,
}

/// Drives actual I/O for a set of byte channels over one selector.
///
/// A processor runs a single worker thread that owns the selector and all
/// per-channel I/O state. Submitters hand channels over through `add`,
/// request write drains through `flush` and closes through `remove`; the
/// worker picks the requests up from lock-free queues on its next loop
/// iteration. Channel activity is reported through the `Dispatcher`
/// collaborator.
pub struct Processor {
    inner: Arc<Inner>,
}

struct Inner {
    protocol: AtomicU8,
    readwrite_fair: bool,
    new_channels: SegQueue<Arc<Channel>>,
    flushing_channels: SegQueue<Arc<Channel>>,
    closing_channels: SegQueue<Arc<Channel>>,
    udp_channels: Mutex<HashMap<String, Arc<Channel>>>,
    wake_called: AtomicBool,
    shutdown: AtomicBool,
    worker_started: AtomicBool,
    poll: Mutex<Option<Poll>>,
    waker: Mutex<Arc<Waker>>,
    dispatcher: Arc<dyn Dispatcher>,
    idle_timer: Arc<dyn IdleTimer>,
    executor: Box<dyn Executor>,
}

fn udp_channel_key(local: &SocketAddr, remote: &SocketAddr) -> String {
    format!("{}-{}", local, remote)
}

impl Processor {
    /// Create a processor running its worker on a dedicated named thread.
    pub fn new(
        config: Config,
        dispatcher: Arc<dyn Dispatcher>,
        idle_timer: Arc<dyn IdleTimer>,
    ) -> io::Result<Processor> {
        let executor = Box::new(ThreadExecutor::new("reactor-io-processor"));
        Processor::with_executor(config, dispatcher, idle_timer, executor)
    }

    /// Create a processor submitting its worker task to the given executor.
    pub fn with_executor(
        config: Config,
        dispatcher: Arc<dyn Dispatcher>,
        idle_timer: Arc<dyn IdleTimer>,
        executor: Box<dyn Executor>,
    ) -> io::Result<Processor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let inner = Arc::new(Inner {
            protocol: AtomicU8::new(config.protocol.as_u8()),
            readwrite_fair: config.readwrite_fair,
            new_channels: SegQueue::new(),
            flushing_channels: SegQueue::new(),
            closing_channels: SegQueue::new(),
            udp_channels: Mutex::new(HashMap::new()),
            wake_called: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            worker_started: AtomicBool::new(false),
            poll: Mutex::new(Some(poll)),
            waker: Mutex::new(waker),
            dispatcher,
            idle_timer,
            executor,
        });

        Ok(Processor { inner })
    }

    /// Submit a channel for registration.
    ///
    /// The worker is started lazily by the first submission. The channel is
    /// registered for read readiness on the next loop iteration, after which
    /// a `ChannelEvent::Opened` is dispatched.
    pub fn add(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.inner.new_channels.push(channel.clone());
        self.startup();
        self.inner.wake();
        Ok(())
    }

    /// Submit a channel for a write drain.
    pub fn flush(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.inner.schedule_flush(channel);
        self.inner.wake();
        Ok(())
    }

    /// Schedule a channel for close and release.
    pub fn remove(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.inner.schedule_close(channel);
        self.inner.wake();
        Ok(())
    }

    /// Shut the processor down.
    ///
    /// The worker observes the flag after its current iteration, moves every
    /// pending and registered channel into the closing queue, dispatches one
    /// `ChannelEvent::Closed` per channel and drops the selector. Further
    /// submissions fail with `Error::Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake();
    }

    /// Set the transport protocol this processor drives.
    pub fn set_protocol(&self, protocol: Protocol) {
        self.inner.protocol.store(protocol.as_u8(), Ordering::Release);
    }

    /// The transport protocol this processor drives.
    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.inner.protocol.load(Ordering::Acquire))
    }

    /// Snapshot the current queue depths.
    pub fn stat(&self) -> ProcessorStat {
        ProcessorStat {
            new_channel_count: self.inner.new_channels.len(),
            flushing_channel_count: self.inner.flushing_channels.len(),
            closing_channel_count: self.inner.closing_channels.len(),
        }
    }

    fn startup(&self) {
        let started = self
            .inner
            .worker_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !started {
            return;
        }

        let inner = self.inner.clone();
        self.inner.executor.execute(Box::new(move || {
            let taken = inner.poll.lock().unwrap().take();
            match taken {
                Some(poll) => Worker::new(inner, poll).run(),
                None => error!("processor selector already consumed"),
            }
        }));
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Processor")
            .field("protocol", &self.protocol())
            .field("stat", &self.stat())
            .finish()
    }
}

impl Inner {
    fn wake(&self) {
        self.wake_called.store(true, Ordering::Release);
        let waker = self.waker.lock().unwrap().clone();
        if let Err(e) = waker.wake() {
            warn!("selector wakeup failed; err={}", e);
        }
    }

    /// Enqueue the channel on the flushing queue if it holds no ticket yet.
    fn schedule_flush(&self, channel: &Arc<Channel>) {
        if channel.claim_flush_ticket() {
            self.flushing_channels.push(channel.clone());
        }
    }

    fn schedule_close(&self, channel: &Arc<Channel>) {
        if channel.is_closing() || channel.is_closed() {
            return;
        }
        self.closing_channels.push(channel.clone());
    }
}

struct Worker {
    inner: Arc<Inner>,
    poll: Poll,
    events: Events,
    channels: Slab<Arc<Channel>>,
    allocator: BufAllocator,
}

impl Worker {
    fn new(inner: Arc<Inner>, poll: Poll) -> Worker {
        Worker {
            inner,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            channels: Slab::new(),
            allocator: BufAllocator::new(),
        }
    }

    fn run(mut self) {
        debug!("starting processor loop");

        while !self.inner.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.turn() {
                error!("processor loop error; err={}", e);
            }
        }

        self.shutdown0();
    }

    fn turn(&mut self) -> io::Result<()> {
        let ready = self.select()?;

        self.flush_channels();
        self.register_channels();
        if !ready.is_empty() {
            self.process_ready(&ready);
        }
        self.close_channels();

        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.inner.protocol.load(Ordering::Acquire))
    }

    /*
     *
     * ===== Select =====
     *
     */

    fn select(&mut self) -> io::Result<ReadySet> {
        let start = Instant::now();
        self.poll.poll(&mut self.events, Some(SELECT_TIMEOUT))?;
        let elapsed = start.elapsed();

        let mut ready = ReadySet::new();
        let mut woken = false;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                woken = true;
                continue;
            }
            ready.push((event.token(), event.is_readable(), event.is_writable()));
        }
        trace!("processor iteration; selected={}, woken={}", ready.len(), woken);

        if ready.is_empty()
            && !woken
            && !self.inner.wake_called.load(Ordering::Acquire)
            && elapsed < SPURIOUS_WAKEUP_THRESHOLD
        {
            // The select may have returned early because a peer dropped its
            // connection, or the selector degenerated into a busy loop.
            if self.cancel_broken_connections() {
                debug!("cancelled broken connections after early wakeup");
            } else {
                debug!("rebuilding selector; elapsed={:?}", elapsed);
                self.rebuild_selector()?;
            }
        }
        self.inner.wake_called.store(false, Ordering::Release);

        Ok(ready)
    }

    fn cancel_broken_connections(&mut self) -> bool {
        let mut broken: SmallVec<[usize; 8]> = SmallVec::new();
        for (key, channel) in self.channels.iter() {
            if !channel.io().is_connected() {
                broken.push(key);
            }
        }

        for &key in broken.iter() {
            let channel = self.channels.remove(key);
            {
                let mut io = channel.io();
                if let Ok(source) = io.source() {
                    let _ = self.poll.registry().deregister(source);
                }
            }
            channel.clear_token();
            debug!("cancelled broken channel registration; channel={:?}", channel);
        }

        !broken.is_empty()
    }

    /// Workaround for a selector stuck returning instantly with no readiness:
    /// open a fresh selector, move every registration across with the same
    /// token and interest set, then swap it in.
    fn rebuild_selector(&mut self) -> io::Result<()> {
        let poll = Poll::new()?;

        for (key, channel) in self.channels.iter() {
            let interests = match interest_from_bits(channel.interest_bits()) {
                Some(interests) => interests,
                None => continue,
            };
            let mut io = channel.io();
            let source = io.source()?;
            let _ = self.poll.registry().deregister(source);
            poll.registry().register(source, Token(key), interests)?;
        }

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        *self.inner.waker.lock().unwrap() = waker;
        self.poll = poll;
        Ok(())
    }

    /*
     *
     * ===== Register =====
     *
     */

    fn register_channels(&mut self) {
        while let Some(channel) = self.inner.new_channels.pop() {
            if let Err(e) = self.register_channel(&channel) {
                debug!("register error; channel={:?}, err={}", channel, e);
                self.fire_thrown(&channel, e);
                self.inner.schedule_close(&channel);
            }
        }
    }

    fn register_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let key = self.channels.insert(channel.clone());
        let token = Token(key);

        let registered = {
            let mut io = channel.io();
            match io.source() {
                Ok(source) => self.poll.registry().register(source, token, Interest::READABLE),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = registered {
            self.channels.remove(key);
            return Err(e);
        }

        channel.set_token(token);
        channel.set_interest_bits(interest::READ);
        channel.set_open();
        self.inner.idle_timer.add(channel);
        debug!("registered channel; channel={:?}, token={:?}", channel, token);

        self.fire_opened(channel);
        Ok(())
    }

    /*
     *
     * ===== Read =====
     *
     */

    fn process_ready(&mut self, ready: &[(Token, bool, bool)]) {
        for &(token, readable, writable) in ready {
            let channel = match self.channels.get(token.0) {
                Some(channel) => channel.clone(),
                None => continue,
            };
            if !channel.is_valid() {
                debug!("skip ready key of invalid channel; channel={:?}", channel);
                continue;
            }

            channel.touch();

            if readable {
                self.read_channel(&channel);
            }
            if writable {
                self.inner.schedule_flush(&channel);
            }
        }
    }

    fn read_channel(&mut self, channel: &Arc<Channel>) {
        let size = channel.next_read_size();
        let mut buf = self.allocator.allocate(size);
        trace!("predicted read buffer; size={}, channel={:?}", size, channel);

        if let Err(e) = self.read_into(channel, &mut buf) {
            debug!("read error; channel={:?}, err={}", channel, e);
            self.fire_thrown(channel, e);
            // a failed socket would otherwise storm the selector with readiness
            self.inner.schedule_close(channel);
        }
    }

    fn read_into(&mut self, channel: &Arc<Channel>, buf: &mut [u8]) -> io::Result<()> {
        let mut read_bytes = 0;
        let mut eof = false;

        loop {
            let outcome = channel.io().read(&mut buf[read_bytes..])?;
            match outcome {
                ReadOutcome::Data(n) => {
                    read_bytes += n;
                    if read_bytes == buf.len() {
                        break;
                    }
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    eof = true;
                    break;
                }
                ReadOutcome::Datagram(n, remote) => {
                    self.record_udp_channel(channel, remote);
                    channel.touch();
                    self.fire_read(channel, &buf[..n]);
                    return Ok(());
                }
            }
        }

        if read_bytes > 0 {
            channel.record_read_size(read_bytes);
            trace!("read; bytes={}, channel={:?}", read_bytes, channel);
            self.fire_read(channel, &buf[..read_bytes]);
        }

        // end of stream, the remote peer is gone
        if eof {
            self.inner.schedule_close(channel);
        }

        Ok(())
    }

    /// Record the source of a first datagram so later writes can be directed
    /// back at it.
    fn record_udp_channel(&mut self, channel: &Arc<Channel>, remote: SocketAddr) {
        let key = udp_channel_key(&channel.local_addr(), &remote);
        let mut udp_channels = self.inner.udp_channels.lock().unwrap();
        if !udp_channels.contains_key(&key) {
            channel.set_remote_addr(remote);
            udp_channels.insert(key, channel.clone());
        }
    }

    /*
     *
     * ===== Flush =====
     *
     */

    fn flush_channels(&mut self) {
        let mut spun = 0;
        while spun < FLUSH_SPIN_COUNT {
            let channel = match self.inner.flushing_channels.pop() {
                Some(channel) => channel,
                None => break,
            };

            // the ticket is released first so a concurrent flush request
            // lands the channel back on the queue
            channel.release_flush_ticket();

            if channel.is_closed() || channel.is_closing() {
                debug!("skip flush of closing channel; channel={:?}", channel);
                continue;
            }

            spun += 1;
            if let Err(e) = self.flush_channel(&channel) {
                debug!("flush error; channel={:?}, err={}", channel, e);
                self.fire_thrown(&channel, e);
                self.inner.schedule_close(&channel);
            }
        }
    }

    fn flush_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        trace!("flushing channel; channel={:?}", channel);

        // stop asking for write readiness while we are actively draining
        self.set_interest_write(channel, false)?;

        if self.inner.readwrite_fair {
            self.fair_flush(channel)?;
        } else {
            self.one_off_flush(channel)?;
        }

        // bytes are still queued, ask the selector to tell us when the
        // socket drains and pick the queue up again
        if !channel.write_queue_is_empty() {
            self.set_interest_write(channel, true)?;
            self.inner.schedule_flush(channel);
        }

        Ok(())
    }

    /// Drain at most the head buffer of the write queue.
    fn one_off_flush(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let mut buf = match channel.take_write_buf() {
            Some(buf) => buf,
            None => return Ok(()),
        };

        self.fire_flush(channel, buf.payload());

        let quota = buf.remaining();
        if let Err(e) = self.write_buf(channel, &mut buf, quota) {
            channel.restore_write_buf(buf);
            return Err(e);
        }

        if buf.has_remaining() {
            channel.restore_write_buf(buf);
            self.set_interest_write(channel, true)?;
            self.inner.schedule_flush(channel);
        } else {
            self.fire_written(channel, buf.payload());
        }

        Ok(())
    }

    /// Drain successive buffers under the per-channel byte budget, leaving
    /// the remainder for the next flush cycle.
    fn fair_flush(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let max_write = channel.max_write_chunk();
        let mut written = 0;

        while written < max_write {
            let mut buf = match channel.take_write_buf() {
                Some(buf) => buf,
                None => return Ok(()),
            };
            self.fire_flush(channel, buf.payload());

            let quota = max_write - written;
            let n = match self.write_buf(channel, &mut buf, quota) {
                Ok(n) => n,
                Err(e) => {
                    channel.restore_write_buf(buf);
                    return Err(e);
                }
            };
            written += n;

            if !buf.has_remaining() {
                self.fire_written(channel, buf.payload());
                continue;
            }

            channel.restore_write_buf(buf);
            if n == 0 {
                debug!("kernel send buffer full; channel={:?}", channel);
            }
            // either the socket is saturated or the head buffer made only
            // partial progress; yield and pick the queue up next cycle
            self.set_interest_write(channel, true)?;
            self.inner.schedule_flush(channel);
            return Ok(());
        }

        Ok(())
    }

    /// Write at most `max_length` bytes of `buf`, advancing its cursor by
    /// the count the kernel accepted.
    fn write_buf(
        &mut self,
        channel: &Arc<Channel>,
        buf: &mut WriteBuf,
        max_length: usize,
    ) -> io::Result<usize> {
        if !buf.has_remaining() {
            return Ok(0);
        }

        let len = cmp::min(buf.remaining(), max_length);
        let remote = channel.remote_addr();
        let n = channel.io().write(&buf.chunk()[..len], remote)?;
        buf.advance(n);
        trace!("wrote; bytes={}, quota={}, channel={:?}", n, max_length, channel);
        Ok(n)
    }

    fn set_interest_write(&mut self, channel: &Arc<Channel>, interested: bool) -> io::Result<()> {
        let token = match channel.token() {
            Some(token) => token,
            None => return Ok(()),
        };
        if !self.channels.contains(token.0) {
            return Ok(());
        }

        let old = channel.interest_bits();
        let new = if interested {
            old | interest::WRITE
        } else {
            old & !interest::WRITE
        };
        if new == old {
            return Ok(());
        }

        let interests = match interest_from_bits(new) {
            Some(interests) => interests,
            None => return Ok(()),
        };
        {
            let mut io = channel.io();
            let source = io.source()?;
            self.poll.registry().reregister(source, token, interests)?;
        }
        channel.set_interest_bits(new);
        Ok(())
    }

    /*
     *
     * ===== Close =====
     *
     */

    fn close_channels(&mut self) {
        while let Some(channel) = self.inner.closing_channels.pop() {
            self.inner.idle_timer.remove(&channel);

            if channel.is_closed() {
                debug!("skip close of closed channel; channel={:?}", channel);
                continue;
            }

            channel.set_closing();
            debug!("closing channel; channel={:?}", channel);

            if let Some(token) = channel.token() {
                if self.channels.contains(token.0) {
                    self.channels.remove(token.0);
                }
                channel.clear_token();
            }

            if let Err(e) = self.release_channel(&channel) {
                warn!("close error; channel={:?}, err={}", channel, e);
                self.fire_thrown(&channel, e);
            }

            channel.set_closed();
            self.fire_closed(&channel);
        }
    }

    fn release_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        channel.io().close()?;

        if self.protocol() == Protocol::Udp {
            if let Some(remote) = channel.remote_addr() {
                let key = udp_channel_key(&channel.local_addr(), &remote);
                self.inner.udp_channels.lock().unwrap().remove(&key);
            }
        }

        Ok(())
    }

    /*
     *
     * ===== Shutdown =====
     *
     */

    fn shutdown0(&mut self) {
        while let Some(channel) = self.inner.new_channels.pop() {
            self.inner.closing_channels.push(channel);
        }
        while let Some(channel) = self.inner.flushing_channels.pop() {
            self.inner.closing_channels.push(channel);
        }

        let registered: Vec<Arc<Channel>> =
            self.channels.iter().map(|(_, channel)| channel.clone()).collect();
        for channel in registered {
            self.inner.schedule_close(&channel);
        }

        self.close_channels();
        debug!("processor shut down");
    }

    /*
     *
     * ===== Events =====
     *
     */

    fn dispatch(&self, event: ChannelEvent) {
        let dispatcher = &self.inner.dispatcher;
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(event)));
        if delivered.is_err() {
            error!("event handler panicked; handlers must not panic on the processor thread");
        }
    }

    fn fire_opened(&self, channel: &Arc<Channel>) {
        self.dispatch(ChannelEvent::Opened(channel.clone()));
    }

    fn fire_read(&self, channel: &Arc<Channel>, payload: &[u8]) {
        // hand user code a copy, the read buffer is reused by the processor
        let payload = Bytes::copy_from_slice(payload);
        self.dispatch(ChannelEvent::Read(channel.clone(), payload));
    }

    fn fire_flush(&self, channel: &Arc<Channel>, payload: Bytes) {
        self.dispatch(ChannelEvent::Flush(channel.clone(), payload));
    }

    fn fire_written(&self, channel: &Arc<Channel>, payload: Bytes) {
        self.dispatch(ChannelEvent::Written(channel.clone(), payload));
    }

    fn fire_thrown(&self, channel: &Arc<Channel>, err: io::Error) {
        self.dispatch(ChannelEvent::Thrown(channel.clone(), err));
    }

    fn fire_closed(&self, channel: &Arc<Channel>) {
        self.dispatch(ChannelEvent::Closed(channel.clone()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn udp_channel_keys_are_printable_tuples() {
        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!("127.0.0.1:4000-127.0.0.1:5000", udp_channel_key(&local, &remote));
        assert_ne!(
            udp_channel_key(&local, &remote),
            udp_channel_key(&remote, &local)
        );
    }
}
