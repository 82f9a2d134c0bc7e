mod support;

use bytes::Bytes;
use reactor_io::{Channel, ChannelEvent, Config, Processor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use support::{await_event, drain_events, idle_timer, next_event, EventSink, ScriptedIo};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scripted_channel(
    config: &Config,
    budget: usize,
) -> (Arc<Channel>, Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>) {
    let budget = Arc::new(AtomicUsize::new(budget));
    let written = Arc::new(Mutex::new(Vec::new()));
    let io = ScriptedIo::new(budget.clone(), written.clone());
    let channel = Arc::new(Channel::from_io(
        Box::new(io),
        "127.0.0.1:0".parse().unwrap(),
        None,
        config,
    ));
    (channel, budget, written)
}

#[test]
fn fair_flush_respects_write_budget() {
    init_log();

    let (sink, rx) = EventSink::pair();
    let config = Config::new().readwrite_fair(true).max_write_buffer_size(1024);
    let processor = Processor::new(config.clone(), sink, idle_timer()).unwrap();

    let (channel, _budget, written) = scripted_channel(&config, usize::MAX);
    let payload = Bytes::from(vec![0x5a; 4096]);
    channel.write(payload.clone());

    processor.add(&channel).unwrap();
    processor.flush(&channel).unwrap();

    // one flush attempt per 1024-byte budget cycle; the buffer is removed
    // and reported written only on the fourth
    let mut flushes = 0;
    loop {
        match next_event(&rx) {
            ChannelEvent::Opened(_) => {}
            ChannelEvent::Flush(..) => flushes += 1,
            ChannelEvent::Written(_, done) => {
                assert_eq!(payload, done);
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(4, flushes);
    assert_eq!(4096, written.lock().unwrap().len());

    thread::sleep(Duration::from_millis(200));
    let late = drain_events(&rx);
    assert!(
        !late.iter().any(|ev| matches!(ev, ChannelEvent::Written(..))),
        "buffer reported written twice"
    );

    processor.shutdown();
}

#[test]
fn backpressure_requeues_without_duplicate_written() {
    init_log();

    let (sink, rx) = EventSink::pair();
    let config = Config::new().readwrite_fair(true).max_write_buffer_size(8192);
    let processor = Processor::new(config.clone(), sink, idle_timer()).unwrap();

    // the fake kernel refuses every byte at first
    let (channel, budget, written) = scripted_channel(&config, 0);
    let first = Bytes::from(vec![0xaa; 4096]);
    let second = Bytes::from(vec![0xbb; 4096]);
    channel.write(first.clone());
    channel.write(second.clone());

    processor.add(&channel).unwrap();
    processor.flush(&channel).unwrap();

    // flush attempts keep re-queueing the channel, but nothing completes
    thread::sleep(Duration::from_millis(300));
    assert_eq!(0, written.lock().unwrap().len());
    let early = drain_events(&rx);
    assert!(
        !early.iter().any(|ev| matches!(ev, ChannelEvent::Written(..))),
        "written event while the kernel accepted nothing"
    );

    // the kernel drains, the re-queued flush picks both buffers up
    budget.store(usize::MAX, Ordering::Release);
    processor.flush(&channel).unwrap();

    let done_first = await_event(&rx, "first written", |ev| {
        matches!(ev, ChannelEvent::Written(..))
    });
    match done_first {
        ChannelEvent::Written(_, payload) => assert_eq!(first, payload),
        other => panic!("unexpected event: {:?}", other),
    }
    let done_second = await_event(&rx, "second written", |ev| {
        matches!(ev, ChannelEvent::Written(..))
    });
    match done_second {
        ChannelEvent::Written(_, payload) => assert_eq!(second, payload),
        other => panic!("unexpected event: {:?}", other),
    }

    {
        let written = written.lock().unwrap();
        assert_eq!(8192, written.len());
        assert!(written[..4096].iter().all(|&b| b == 0xaa));
        assert!(written[4096..].iter().all(|&b| b == 0xbb));
    }

    thread::sleep(Duration::from_millis(200));
    let late = drain_events(&rx);
    assert!(
        !late.iter().any(|ev| matches!(ev, ChannelEvent::Written(..))),
        "a buffer reported written twice"
    );

    processor.shutdown();
}

#[test]
fn one_off_flush_drains_one_buffer_per_attempt() {
    init_log();

    let (sink, rx) = EventSink::pair();
    let config = Config::new().readwrite_fair(false);
    let processor = Processor::new(config.clone(), sink, idle_timer()).unwrap();

    let (channel, _budget, written) = scripted_channel(&config, usize::MAX);
    channel.write(Bytes::from_static(b"alpha"));
    channel.write(Bytes::from_static(b"beta"));

    processor.add(&channel).unwrap();
    processor.flush(&channel).unwrap();

    let done_first = await_event(&rx, "first written", |ev| {
        matches!(ev, ChannelEvent::Written(..))
    });
    match done_first {
        ChannelEvent::Written(_, payload) => assert_eq!(&payload[..], b"alpha"),
        other => panic!("unexpected event: {:?}", other),
    }
    let done_second = await_event(&rx, "second written", |ev| {
        matches!(ev, ChannelEvent::Written(..))
    });
    match done_second {
        ChannelEvent::Written(_, payload) => assert_eq!(&payload[..], b"beta"),
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(b"alphabeta", &written.lock().unwrap()[..]);

    processor.shutdown();
}
