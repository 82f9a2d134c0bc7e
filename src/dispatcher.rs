use crate::channel::Channel;
use bytes::Bytes;
use std::io;
use std::sync::Arc;

/// A channel lifecycle or I/O event emitted by the processor.
///
/// Read payloads are copies of the received bytes; the processor's internal
/// read buffer is never exposed to user code. Flush and written payloads are
/// the enqueued buffer itself.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel was registered with the selector
    Opened(Arc<Channel>),
    /// Inbound bytes arrived
    Read(Arc<Channel>, Bytes),
    /// A queued buffer is about to be transmitted
    Flush(Arc<Channel>, Bytes),
    /// A queued buffer was fully transmitted
    Written(Arc<Channel>, Bytes),
    /// An error occurred while driving the channel
    Thrown(Arc<Channel>, io::Error),
    /// The channel reached its terminal state
    Closed(Arc<Channel>),
}

impl ChannelEvent {
    /// The channel the event belongs to.
    pub fn channel(&self) -> &Arc<Channel> {
        match *self {
            ChannelEvent::Opened(ref ch) => ch,
            ChannelEvent::Read(ref ch, _) => ch,
            ChannelEvent::Flush(ref ch, _) => ch,
            ChannelEvent::Written(ref ch, _) => ch,
            ChannelEvent::Thrown(ref ch, _) => ch,
            ChannelEvent::Closed(ref ch) => ch,
        }
    }
}

/// Fans channel events out to user code.
///
/// Events are dispatched on the processor's worker thread, in the order the
/// event loop observed them. A dispatcher that must not block the worker
/// should hand events to its own executor; this trait is the
/// asynchronization seam.
pub trait Dispatcher: Send + Sync {
    /// Deliver one event.
    fn dispatch(&self, event: ChannelEvent);
}

/// Per-event callbacks invoked by `DirectDispatcher`.
///
/// All methods default to no-ops so handlers implement only what they need.
pub trait Handler: Send + Sync {
    /// The channel was registered and will start receiving events.
    fn channel_opened(&self, _channel: &Arc<Channel>) {}

    /// Inbound bytes arrived. The payload is owned by the handler.
    fn channel_read(&self, _channel: &Arc<Channel>, _payload: Bytes) {}

    /// A queued buffer is about to be transmitted.
    fn channel_flush(&self, _channel: &Arc<Channel>, _payload: Bytes) {}

    /// A queued buffer was fully transmitted.
    fn channel_written(&self, _channel: &Arc<Channel>, _payload: Bytes) {}

    /// An error occurred while driving the channel.
    fn channel_thrown(&self, _channel: &Arc<Channel>, _err: io::Error) {}

    /// The channel was closed and released.
    fn channel_closed(&self, _channel: &Arc<Channel>) {}
}

/// Dispatcher that invokes a `Handler` synchronously on the worker thread.
pub struct DirectDispatcher {
    handler: Arc<dyn Handler>,
}

impl DirectDispatcher {
    /// Create a dispatcher delivering straight into `handler`.
    pub fn new(handler: Arc<dyn Handler>) -> DirectDispatcher {
        DirectDispatcher { handler }
    }
}

impl Dispatcher for DirectDispatcher {
    fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened(ch) => self.handler.channel_opened(&ch),
            ChannelEvent::Read(ch, payload) => self.handler.channel_read(&ch, payload),
            ChannelEvent::Flush(ch, payload) => self.handler.channel_flush(&ch, payload),
            ChannelEvent::Written(ch, payload) => self.handler.channel_written(&ch, payload),
            ChannelEvent::Thrown(ch, err) => self.handler.channel_thrown(&ch, err),
            ChannelEvent::Closed(ch) => self.handler.channel_closed(&ch),
        }
    }
}
