use std::fmt;

/// Transport protocol driven by a processor.
///
/// A processor drives either TCP stream channels or UDP datagram channels;
/// the protocol is fixed once the processor starts moving bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream channels backed by TCP sockets
    Tcp,
    /// Datagram channels backed by UDP sockets
    Udp,
}

impl Protocol {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }

    pub(crate) fn from_u8(val: u8) -> Protocol {
        match val {
            0 => Protocol::Tcp,
            _ => Protocol::Udp,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Tcp => write!(fmt, "tcp"),
            Protocol::Udp => write!(fmt, "udp"),
        }
    }
}

/// Processor configuration options.
///
/// ```
/// use reactor_io::{Config, Protocol};
///
/// let config = Config::new()
///     .protocol(Protocol::Tcp)
///     .readwrite_fair(true)
///     .max_write_buffer_size(8 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) protocol: Protocol,
    pub(crate) readwrite_fair: bool,
    pub(crate) min_read_buffer_size: usize,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_read_buffer_size: usize,
    pub(crate) max_write_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            protocol: Protocol::Tcp,
            readwrite_fair: true,
            min_read_buffer_size: 64,
            read_buffer_size: 2048,
            max_read_buffer_size: 65536,
            max_write_buffer_size: 65536,
        }
    }
}

impl Config {
    /// Create a `Config` with default values
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the transport protocol the processor drives.
    pub fn protocol(mut self, val: Protocol) -> Self {
        self.protocol = val;
        self
    }

    /// Select the flush strategy.
    ///
    /// When `true`, writes are interleaved across channels under the
    /// per-channel byte budget set by `max_write_buffer_size`. When `false`,
    /// each flush attempt drains at most the head buffer of the write queue.
    pub fn readwrite_fair(mut self, val: bool) -> Self {
        self.readwrite_fair = val;
        self
    }

    /// Lower bound for predicted read-buffer allocations.
    pub fn min_read_buffer_size(mut self, val: usize) -> Self {
        self.min_read_buffer_size = val;
        self
    }

    /// Initial read-buffer allocation before any feedback is observed.
    pub fn read_buffer_size(mut self, val: usize) -> Self {
        self.read_buffer_size = val;
        self
    }

    /// Upper bound for predicted read-buffer allocations.
    pub fn max_read_buffer_size(mut self, val: usize) -> Self {
        self.max_read_buffer_size = val;
        self
    }

    /// Per-channel byte budget for one fair flush cycle.
    pub fn max_write_buffer_size(mut self, val: usize) -> Self {
        self.max_write_buffer_size = val;
        self
    }
}
