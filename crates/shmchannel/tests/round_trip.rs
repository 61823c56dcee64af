//! End-to-end calls through a listening server.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use shmchannel::{
    ChannelConfig, ClientConnector, Dispatch, ObjectNames, Processing, Reply, Request,
    RequestBody, Responder, ShmChannel, TransferLayout,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ChannelConfig {
    ChannelConfig {
        namespace: format!("rt{}", unique_suffix()),
        ..Default::default()
    }
}

fn unique_suffix() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!("{}x{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

/// `op` header selects the operation on two little-endian i32 operands.
fn calc() -> Arc<dyn Dispatch> {
    Arc::new(|request: Request, _: Responder| {
        let operand = |i: usize| {
            i32::from_le_bytes([
                request.body[i],
                request.body[i + 1],
                request.body[i + 2],
                request.body[i + 3],
            ])
        };
        let (a, b) = (operand(0), operand(4));
        let result = match request.headers.get("op") {
            Some("add") => a.wrapping_add(b),
            Some("sub") => a.wrapping_sub(b),
            Some("mul") => a.wrapping_mul(b),
            _ => 0,
        };
        let headers = request.headers.clone();
        Processing::Complete(Reply::with_headers(headers, result.to_le_bytes().to_vec()))
    })
}

fn echo() -> Arc<dyn Dispatch> {
    Arc::new(|request: Request, _: Responder| {
        Processing::Complete(Reply::with_headers(request.headers, request.body))
    })
}

fn serve(dispatch: Arc<dyn Dispatch>, section: &str) -> ShmChannel {
    init_tracing();
    let channel = ShmChannel::new(test_config()).unwrap();
    channel.register(Some(section), dispatch).unwrap();
    channel.start_listening().unwrap();
    channel
}

fn operands(a: i32, b: i32) -> Vec<u8> {
    let mut body = a.to_le_bytes().to_vec();
    body.extend_from_slice(&b.to_le_bytes());
    body
}

#[test]
fn calc_add_returns_four_bytes() {
    let channel = serve(calc(), "Calc");
    let sink = channel.connect("shm://Calc").unwrap();

    let mut request = sink
        .new_request(RequestBody::from_bytes(operands(40, 2)))
        .with_header("op", "add");
    request.destination = "Calc".into();
    let response = sink.call(&mut request).unwrap();

    assert_eq!(response.body.len(), 4);
    assert_eq!(&response.body[..], &42i32.to_le_bytes());
    assert_eq!(response.headers.get("op"), Some("add"));
    assert_eq!(response.headers.request_uri(), Some("Calc"));
}

#[test]
fn connections_are_pooled_and_reused() {
    let channel = serve(calc(), "calc");
    let sink = channel.connect("shm://calc/math").unwrap();

    for (op, expected) in [("add", 9), ("sub", 3), ("mul", 18)] {
        let mut request = sink
            .new_request(RequestBody::from_bytes(operands(6, 3)))
            .with_header("op", op);
        let response = sink.call(&mut request).unwrap();
        assert_eq!(&response.body[..], &(expected as i32).to_le_bytes(), "{op}");
        assert_eq!(sink.pool().len(), 1);
    }
    assert_eq!(channel.active_connections(), 1);
}

#[test]
fn object_path_reaches_handler() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let dispatch: Arc<dyn Dispatch> = {
        let seen = seen.clone();
        Arc::new(move |request: Request, _: Responder| {
            seen.lock().push(request.request_uri().map(str::to_owned));
            Processing::Complete(Reply::new(Bytes::new()))
        })
    };
    let channel = serve(dispatch, "paths");

    let sink = channel.connect("shm://paths/math/add").unwrap();
    let mut request = sink.new_request(RequestBody::default());
    sink.call(&mut request).unwrap();

    let mut request = sink.new_request(RequestBody::default());
    request.destination = "shm://paths/other".into();
    sink.call(&mut request).unwrap();

    assert_eq!(
        *seen.lock(),
        vec![Some("math/add".to_owned()), Some("other".to_owned())]
    );
}

#[test]
fn forty_thousand_byte_body_spans_chunks() {
    let channel = serve(echo(), "big");
    let sink = channel.connect("shm://big/blob").unwrap();
    let capacity = TransferLayout::new(channel.config().section_size)
        .unwrap()
        .capacity();
    assert_eq!(40_000usize.div_ceil(capacity), 3);

    let body: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
    let mut request = sink.new_request(RequestBody::from_bytes(body.clone()));
    let response = sink.call(&mut request).unwrap();
    assert_eq!(&response.body[..], &body[..]);
}

#[test]
fn bodies_around_capacity_round_trip() {
    let config = ChannelConfig {
        section_size: 256,
        ..test_config()
    };
    init_tracing();
    let channel = ShmChannel::new(config).unwrap();
    channel.register(Some("edges"), echo()).unwrap();
    channel.start_listening().unwrap();
    let sink = channel.connect("shm://edges").unwrap();

    let capacity = TransferLayout::new(256).unwrap().capacity();
    for len in [0, 1, capacity - 20, capacity, capacity + 1, capacity * 5] {
        let body: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut request = sink.new_request(RequestBody::from_bytes(body.clone()));
        let response = sink.call(&mut request).unwrap();
        assert_eq!(&response.body[..], &body[..], "length {len}");
    }
}

#[test]
fn one_way_skips_reply_and_keeps_connection_usable() {
    let (tx, rx) = std::sync::mpsc::channel::<Bytes>();
    let tx = parking_lot::Mutex::new(tx);
    let dispatch: Arc<dyn Dispatch> = Arc::new(move |request: Request, _: Responder| {
        if request.headers.get("oneway").is_some() {
            let _ = tx.lock().send(request.body);
            Processing::OneWay
        } else {
            Processing::Complete(Reply::new(request.body))
        }
    });
    let channel = serve(dispatch, "oneway");
    let sink = channel.connect("shm://oneway").unwrap();

    let mut note = sink
        .new_request(RequestBody::from_bytes(&b"note"[..]))
        .with_header("oneway", "1");
    sink.call_one_way(&mut note).unwrap();
    assert_eq!(&rx.recv_timeout(Duration::from_secs(5)).unwrap()[..], b"note");

    let mut request = sink.new_request(RequestBody::from_bytes(&b"ping"[..]));
    assert_eq!(&sink.call(&mut request).unwrap().body[..], b"ping");
}

#[test]
fn async_call_invokes_continuation() {
    let channel = serve(echo(), "async");
    let sink = channel.connect("shm://async").unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut request = sink.new_request(RequestBody::from_bytes(&b"later"[..]));
    sink.call_async(&mut request, move |result| {
        let _ = tx.send(result);
    })
    .unwrap();

    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(&response.body[..], b"later");
}

#[test]
fn deferred_reply_can_be_waited_on() {
    let channel = serve(echo(), "deferred-blocking");
    let sink = channel.connect("shm://deferred-blocking").unwrap();
    let mut request = sink.new_request(RequestBody::from_bytes(&b"block"[..]));
    let pending = sink.call_deferred(&mut request).unwrap();
    assert_eq!(&pending.wait().unwrap().body[..], b"block");
}

#[tokio::test]
async fn deferred_reply_is_a_future() {
    let channel = serve(echo(), "deferred");
    let sink = channel.connect("shm://deferred").unwrap();
    let mut request = sink.new_request(RequestBody::from_bytes(&b"awaited"[..]));
    let response = sink.call_deferred(&mut request).unwrap().await.unwrap();
    assert_eq!(&response.body[..], b"awaited");
}

#[test]
fn handler_can_reply_later_through_responder() {
    let dispatch: Arc<dyn Dispatch> = Arc::new(|request: Request, responder: Responder| {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let _ = responder.send(Reply::new(request.body));
        });
        Processing::Async
    });
    let channel = serve(dispatch, "responder");
    let sink = channel.connect("shm://responder").unwrap();
    let mut request = sink.new_request(RequestBody::from_bytes(&b"eventually"[..]));
    assert_eq!(&sink.call(&mut request).unwrap().body[..], b"eventually");
}

#[test]
fn concurrent_clients_receive_distinct_names() {
    const CLIENTS: usize = 8;
    let config = test_config();
    let names = ObjectNames::new(config.namespace.clone());
    let channel = serve_with(config.clone(), echo(), "rendezvous");

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let names = names.clone();
            let config = config.clone();
            thread::spawn(move || {
                let connector = ClientConnector::open(&names, "rendezvous").unwrap();
                connector.connect(&config).unwrap()
            })
        })
        .collect();
    let received: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(received.len(), CLIENTS);
    drop(channel);
}

#[test]
fn concurrent_calls_share_one_channel() {
    let channel = Arc::new(serve(calc(), "parallel"));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let channel = channel.clone();
            thread::spawn(move || {
                let sink = channel.connect("shm://parallel").unwrap();
                for j in 0..10 {
                    let mut request = sink
                        .new_request(RequestBody::from_bytes(operands(i, j)))
                        .with_header("op", "mul");
                    let response = sink.call(&mut request).unwrap();
                    assert_eq!(&response.body[..], &(i * j).to_le_bytes());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let pooled = channel.connect("shm://parallel").unwrap().pool().len();
    assert!((1..=6).contains(&pooled), "pooled {pooled}");
}

fn serve_with(config: ChannelConfig, dispatch: Arc<dyn Dispatch>, section: &str) -> ShmChannel {
    init_tracing();
    let channel = ShmChannel::new(config).unwrap();
    channel.register(Some(section), dispatch).unwrap();
    channel.start_listening().unwrap();
    channel
}
