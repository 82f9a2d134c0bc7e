#![allow(dead_code)]

use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use reactor_io::{ChannelEvent, ChannelIo, Dispatcher, IdleMonitor, IdleTimer, ReadOutcome};
use std::cmp;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatcher that forwards every event into a channel for assertions.
pub struct EventSink {
    tx: Sender<ChannelEvent>,
}

impl EventSink {
    pub fn pair() -> (Arc<EventSink>, Receiver<ChannelEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(EventSink { tx }), rx)
    }
}

impl Dispatcher for EventSink {
    fn dispatch(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn idle_timer() -> Arc<dyn IdleTimer> {
    Arc::new(IdleMonitor::new(Duration::from_secs(60)))
}

/// Receive the next event, failing the test after `EVENT_TIMEOUT`.
pub fn next_event(rx: &Receiver<ChannelEvent>) -> ChannelEvent {
    match rx.recv_timeout(EVENT_TIMEOUT) {
        Ok(event) => event,
        Err(e) => panic!("timed out waiting for an event: {}", e),
    }
}

/// Receive events until one matches `pred`, discarding the rest.
pub fn await_event<F>(rx: &Receiver<ChannelEvent>, what: &str, mut pred: F) -> ChannelEvent
where
    F: FnMut(&ChannelEvent) -> bool,
{
    loop {
        match rx.recv_timeout(EVENT_TIMEOUT) {
            Ok(event) => {
                if pred(&event) {
                    return event;
                }
            }
            Err(e) => panic!("timed out waiting for {}: {}", what, e),
        }
    }
}

/// Drain every event currently buffered without blocking.
pub fn drain_events(rx: &Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    rx.try_iter().collect()
}

/// Selector registration handle that accepts every operation and reports
/// nothing; channels registered through it never become ready.
pub struct NullSource;

impl Source for NullSource {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// `ChannelIo` whose fake kernel accepts writes only while `budget` allows,
/// recording every accepted byte. `usize::MAX` means unlimited.
pub struct ScriptedIo {
    source: NullSource,
    budget: Arc<AtomicUsize>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedIo {
    pub fn new(budget: Arc<AtomicUsize>, written: Arc<Mutex<Vec<u8>>>) -> ScriptedIo {
        ScriptedIo {
            source: NullSource,
            budget,
            written,
        }
    }
}

impl ChannelIo for ScriptedIo {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<ReadOutcome> {
        Ok(ReadOutcome::WouldBlock)
    }

    fn write(&mut self, buf: &[u8], _remote: Option<SocketAddr>) -> io::Result<usize> {
        let budget = self.budget.load(Ordering::Acquire);
        let n = cmp::min(budget, buf.len());
        if n > 0 && budget != usize::MAX {
            self.budget.fetch_sub(n, Ordering::AcqRel);
        }
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn source(&mut self) -> io::Result<&mut dyn Source> {
        Ok(&mut self.source)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
