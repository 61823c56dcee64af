//! Send retries, body rewinding and pool flushing.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use shmchannel::{
    ChannelConfig, Dispatch, FaultPoint, Processing, Reply, Request, RequestBody, Responder,
    ShmChannel,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ChannelConfig {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    ChannelConfig {
        namespace: format!(
            "rq{}x{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ),
        ..Default::default()
    }
}

/// Echoes bodies and records every body it saw.
fn recording_echo() -> (Arc<dyn Dispatch>, Arc<Mutex<Vec<Bytes>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatch: Arc<dyn Dispatch> = {
        let seen = seen.clone();
        Arc::new(move |request: Request, _: Responder| {
            seen.lock().push(request.body.clone());
            Processing::Complete(Reply::new(request.body))
        })
    };
    (dispatch, seen)
}

fn serve(config: ChannelConfig, dispatch: Arc<dyn Dispatch>, section: &str) -> ShmChannel {
    init_tracing();
    let channel = ShmChannel::new(config).unwrap();
    channel.register(Some(section), dispatch).unwrap();
    channel.start_listening().unwrap();
    channel
}

#[test]
fn failed_send_is_retried_from_original_position() {
    let (dispatch, seen) = recording_echo();
    let channel = serve(test_config(), dispatch, "rewind");
    let sink = channel.connect("shm://rewind/obj").unwrap();

    let mut body = Cursor::new(b"PREFIXpayload-bytes".to_vec());
    body.set_position(6);
    let mut request = sink.new_request(RequestBody::seekable(body));

    channel.fault_injector().fail_next(FaultPoint::Send, 1);
    let response = sink.call(&mut request).unwrap();

    assert_eq!(&response.body[..], b"payload-bytes");
    assert_eq!(channel.fault_injector().injected(), 1);
    assert_eq!(*seen.lock(), vec![Bytes::from_static(b"payload-bytes")]);
}

#[test]
fn stream_body_gets_a_single_attempt() {
    let (dispatch, seen) = recording_echo();
    let channel = serve(test_config(), dispatch, "stream");
    let sink = channel.connect("shm://stream").unwrap();

    let mut request = sink.new_request(RequestBody::stream(&b"once"[..]));
    channel.fault_injector().fail_next(FaultPoint::Send, 1);
    let err = sink.call(&mut request).unwrap_err();

    assert!(err.message().contains("1 attempt(s)"), "{err}");
    assert_eq!(channel.fault_injector().injected(), 1);
    assert!(seen.lock().is_empty());
}

#[test]
fn retries_are_bounded() {
    let (dispatch, seen) = recording_echo();
    let channel = serve(test_config(), dispatch, "bounded");
    let sink = channel.connect("shm://bounded").unwrap();

    let mut request = sink.new_request(RequestBody::from_bytes(&b"never"[..]));
    channel.fault_injector().fail_next(FaultPoint::Send, 10);
    let err = sink.call(&mut request).unwrap_err();

    assert!(err.message().contains("3 attempt(s)"), "{err}");
    assert!(err.cause().is_some_and(|c| c.message().contains("injected")));
    assert_eq!(channel.fault_injector().injected(), 3);
    assert!(seen.lock().is_empty());
    assert!(sink.pool().is_empty());
}

#[test]
fn retry_count_is_configurable() {
    let (dispatch, _) = recording_echo();
    let config = ChannelConfig {
        retry_count: 5,
        ..test_config()
    };
    let channel = serve(config, dispatch, "five");
    let sink = channel.connect("shm://five").unwrap();

    channel.fault_injector().fail_next(FaultPoint::Send, 4);
    let mut request = sink.new_request(RequestBody::from_bytes(&b"fifth"[..]));
    assert_eq!(&sink.call(&mut request).unwrap().body[..], b"fifth");
    assert_eq!(channel.fault_injector().injected(), 4);
}

#[test]
fn failed_reply_is_not_retried() {
    let (dispatch, seen) = recording_echo();
    let channel = serve(test_config(), dispatch, "reply");
    let sink = channel.connect("shm://reply").unwrap();

    // The failing call below reuses this pooled connection.
    let mut warmup = sink.new_request(RequestBody::from_bytes(&b"warm"[..]));
    sink.call(&mut warmup).unwrap();
    assert_eq!(sink.pool().len(), 1);

    channel.fault_injector().fail_next(FaultPoint::Reply, 1);
    let mut request = sink.new_request(RequestBody::from_bytes(&b"lost"[..]));
    assert!(sink.call(&mut request).is_err());
    assert!(sink.pool().is_empty());

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(seen.lock().len(), 2);

    let mut request = sink.new_request(RequestBody::from_bytes(&b"again"[..]));
    assert_eq!(&sink.call(&mut request).unwrap().body[..], b"again");
}

#[test]
fn pooled_connection_to_restarted_server_is_replaced() {
    let (dispatch, seen) = recording_echo();
    let channel = serve(test_config(), dispatch, "restart");
    let sink = channel.connect("shm://restart").unwrap();

    let mut request = sink.new_request(RequestBody::from_bytes(&b"before"[..]));
    sink.call(&mut request).unwrap();
    assert_eq!(sink.pool().len(), 1);

    channel.stop_listening().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while channel.active_connections() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(channel.active_connections(), 0);
    channel.start_listening().unwrap();

    let mut request = sink.new_request(RequestBody::from_bytes(&b"after"[..]));
    assert_eq!(&sink.call(&mut request).unwrap().body[..], b"after");
    assert_eq!(seen.lock().len(), 2);
}
