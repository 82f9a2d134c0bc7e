//! The non-blocking event driven core of a byte-channel I/O engine.
//!
//! A `Processor` is a single-threaded worker that multiplexes many TCP or
//! UDP byte channels over one OS readiness selector. Each loop iteration
//! round-trips between readiness polling, write draining, new-channel
//! registration, read dispatch and close reclamation.
//!
//! # Channels
//!
//! A `Channel` wraps one non-blocking socket together with its write queue,
//! adaptive read-size predictor and lifecycle state. Channels are submitted
//! to a processor with `Processor::add`; from that point the worker thread
//! exclusively owns the socket. Other threads enqueue outbound buffers with
//! `Channel::write` and request a drain with `Processor::flush`.
//!
//! # Events
//!
//! The processor reports channel activity through the `Dispatcher`
//! collaborator as `ChannelEvent` values: `Opened`, `Read`, `Flush`,
//! `Written`, `Thrown` and `Closed`. Events are delivered on the worker
//! thread in the order the loop observed them; a dispatcher that must not
//! block the worker should hand events to its own executor.
//!
//! Read payloads are copies of the received bytes. The processor's internal
//! read buffer is never handed to user code.
//!
//! # Write scheduling
//!
//! Outbound buffers drain in enqueue order. In fair mode the worker
//! interleaves writes across channels under a per-channel byte budget; in
//! one-off mode each flush attempt drains at most the head buffer. In both
//! modes write readiness is only asked for while the kernel send buffer is
//! saturated, and dropped again once the queue catches up.
//!
//! # Shutdown
//!
//! `Processor::shutdown` stops the worker after its current iteration. All
//! pending and registered channels are closed, each dispatching exactly one
//! `Closed` event, and the selector is released. Submissions after shutdown
//! fail with `Error::Shutdown`.

mod buffer;
mod channel;
mod config;
mod dispatcher;
mod error;
mod executor;
mod idle;
mod predictor;
mod processor;

pub use self::buffer::{BufAllocator, WriteBuf};
pub use self::channel::{Channel, ChannelIo, ReadOutcome};
pub use self::config::{Config, Protocol};
pub use self::dispatcher::{ChannelEvent, DirectDispatcher, Dispatcher, Handler};
pub use self::error::Error;
pub use self::executor::{Executor, ThreadExecutor};
pub use self::idle::{IdleMonitor, IdleTimer};
pub use self::predictor::{AdaptiveSizePredictor, SizePredictor};
pub use self::processor::{Processor, ProcessorStat};
