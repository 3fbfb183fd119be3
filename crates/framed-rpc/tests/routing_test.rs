//! Client call routing against a scripted peer.
//!
//! The peer side is a bare `Framed` stream, so each test controls exactly
//! which responses arrive and in what order.

use bytes::BytesMut;
use framed_rpc::error::{CodecError, ConnectionError, Error};
use framed_rpc::{
    FrameCodec, RequestEnvelope, ResponseEnvelope, RpcClient, Sequence, codec, to_value,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, duplex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Encoder, Framed};
use tracing_test::traced_test;

type Peer = Framed<DuplexStream, FrameCodec>;

fn setup() -> (Arc<RpcClient>, Peer) {
    let (client_io, peer_io) = duplex(64 * 1024);
    (
        Arc::new(RpcClient::new(client_io)),
        Framed::new(peer_io, FrameCodec::new()),
    )
}

fn spawn_call(client: &Arc<RpcClient>, arg: &str) -> JoinHandle<framed_rpc::Result<String>> {
    let client = Arc::clone(client);
    let arg = arg.to_string();
    tokio::spawn(async move { client.call("Echo.Echo", &arg).await })
}

async fn next_request(peer: &mut Peer) -> RequestEnvelope {
    let frame = peer.next().await.unwrap().unwrap();
    codec::decode_request(&frame).unwrap()
}

async fn reply(peer: &mut Peer, seq: Sequence, value: &str) {
    let response =
        ResponseEnvelope::success("Echo.Echo".to_string(), seq, to_value(value).unwrap());
    peer.send(codec::encode_response(&response).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_out_of_order_responses() {
    let (client, mut peer) = setup();

    // Issue one call at a time so the issue order is known
    let mut calls = Vec::new();
    let mut requests = Vec::new();
    for arg in ["first", "second", "third"] {
        calls.push(spawn_call(&client, arg));
        requests.push(next_request(&mut peer).await);
    }

    // Answer third, first, second
    for index in [2, 0, 1] {
        let request = &requests[index];
        let arg: String = framed_rpc::from_value(&request.arg).unwrap();
        reply(&mut peer, request.seq, &format!("reply to {arg}")).await;
    }

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    assert_eq!(
        results,
        ["reply to first", "reply to second", "reply to third"]
    );
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_unknown_sequence_is_dropped() {
    let (client, mut peer) = setup();

    let call = spawn_call(&client, "waiting");
    let request = next_request(&mut peer).await;

    reply(&mut peer, request.seq + 1000, "stray").await;
    reply(&mut peer, request.seq, "real").await;

    assert_eq!(call.await.unwrap().unwrap(), "real");
    assert_eq!(client.pending_calls(), 0);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_connection_drop_fails_all_pending_calls() {
    let (client, mut peer) = setup();

    let first = spawn_call(&client, "one");
    let second = spawn_call(&client, "two");
    next_request(&mut peer).await;
    next_request(&mut peer).await;
    assert_eq!(client.pending_calls(), 2);

    drop(peer);

    for call in [first, second] {
        let result = timeout(Duration::from_secs(5), call)
            .await
            .expect("pending call hung after connection drop")
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Closed))
        ));
    }
    assert_eq!(client.pending_calls(), 0);
    assert!(client.is_closed());

    let late = client.call::<_, String>("Echo.Echo", "late").await;
    assert!(matches!(late, Err(Error::Connection(ConnectionError::Closed))));
}

#[tokio::test]
#[traced_test]
async fn test_write_failure_fails_all_pending_calls() {
    let mut first_frame = BytesMut::new();
    FrameCodec::new()
        .encode(
            codec::encode_request("Echo.Echo", 0, "first").unwrap(),
            &mut first_frame,
        )
        .unwrap();

    // Reads stay pending until the writes are used up, so only the write
    // side can fail
    let stream = tokio_test::io::Builder::new()
        .write(&first_frame)
        .write_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "peer gone",
        ))
        .build();
    let client = RpcClient::new(stream);

    let first = client.call::<_, String>("Echo.Echo", "first");
    let second = async {
        // Yield so the first call is written and waiting before this one
        tokio::task::yield_now().await;
        client.call::<_, String>("Echo.Echo", "second").await
    };
    let (first, second) = timeout(Duration::from_secs(5), async { tokio::join!(first, second) })
        .await
        .expect("pending call hung after write failure");

    assert!(matches!(second, Err(Error::Io(_))));
    assert!(matches!(
        first,
        Err(Error::Connection(ConnectionError::Closed))
    ));
    assert_eq!(client.pending_calls(), 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_resolves_pending_calls() {
    let (client, mut peer) = setup();

    let call = spawn_call(&client, "never answered");
    next_request(&mut peer).await;

    client.close().await.unwrap();

    let result = timeout(Duration::from_secs(5), call).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::ShuttingDown))
    ));

    // Peer sees the write side shut down
    assert!(peer.next().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn test_undecodable_response_fails_only_its_call() {
    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Garbled {
        seq: Sequence,
        error: u32,
    }

    let (client, mut peer) = setup();

    let broken = spawn_call(&client, "broken");
    let broken_request = next_request(&mut peer).await;
    let healthy = spawn_call(&client, "healthy");
    let healthy_request = next_request(&mut peer).await;

    // Seq is recoverable but the envelope is not a response
    let garbled = codec::encode(&Garbled {
        seq: broken_request.seq,
        error: 7,
    })
    .unwrap();
    peer.send(garbled).await.unwrap();

    // Not even CBOR; logged and dropped
    peer.send(framed_rpc::Bytes::from_static(&[0xFF])).await.unwrap();

    reply(&mut peer, healthy_request.seq, "fine").await;

    assert!(matches!(
        broken.await.unwrap(),
        Err(Error::Codec(CodecError::DeserializationFailed(_)))
    ));
    assert_eq!(healthy.await.unwrap().unwrap(), "fine");
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_unit_reply_from_missing_reply_field() {
    let (client, mut peer) = setup();

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call::<_, ()>("Job.Run", &1u8).await });
    let request = next_request(&mut peer).await;

    let mut response = ResponseEnvelope::success(
        request.service_method,
        request.seq,
        to_value(&()).unwrap(),
    );
    response.reply = None;
    peer.send(codec::encode_response(&response).unwrap())
        .await
        .unwrap();

    call.await.unwrap().unwrap();
}
