//! Unit tests for the json-rpc client codec.

use serde_json::json;

use super::{
    error::{Error, RpcCode},
    Client,
    ClientRequest,
    ParseStatus,
    Request,
};

fn encoded(req: &ClientRequest) -> &str {
    std::str::from_utf8(req.as_bytes()).unwrap()
}

#[test]
fn single_request_framing() {
    let mut req = ClientRequest::new();

    let mut w = req.begin_request(Some(1), Some("rpc_get_methods")).unwrap();
    w.params(&json!({ "include_aliases": true })).unwrap();
    req.end_request(w).unwrap();

    assert_eq!(
        encoded(&req),
        concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"rpc_get_methods\",",
            "\"params\":{\"include_aliases\":true}}\n"
        )
    );

    // The encoded frame must decode back into the request object it was
    // built from.
    let parsed: Request = serde_json::from_str(encoded(&req)).unwrap();
    assert_eq!(parsed.jsonrpc, Some("2.0"));
    assert_eq!(parsed.id.unwrap().as_i64().unwrap(), 1);
    assert_eq!(parsed.method, "rpc_get_methods");
    assert_eq!(parsed.params.unwrap(), json!({ "include_aliases": true }));
}

#[test]
fn single_request_without_id() {
    let mut req = ClientRequest::new();

    let w = req.begin_request(None, Some("notify")).unwrap();
    req.end_request(w).unwrap();

    assert_eq!(encoded(&req), "{\"jsonrpc\":\"2.0\",\"method\":\"notify\"}\n");
}

#[test]
fn batch_framing_with_auto_ids() {
    let mut req = ClientRequest::new();

    req.begin_batch().unwrap();

    let w = req.begin_request(None, Some("a")).unwrap();
    req.end_request(w).unwrap();
    let w = req.begin_request(None, Some("b")).unwrap();
    req.end_request(w).unwrap();
    let w = req.begin_request(Some(7), Some("c")).unwrap();
    req.end_request(w).unwrap();

    req.end_batch().unwrap();

    assert_eq!(
        encoded(&req),
        concat!(
            "[{\"jsonrpc\":\"2.0\",\"id\":0,\"method\":\"a\"},",
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"b\"},",
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"c\"}]\n"
        )
    );
}

#[test]
fn batch_id_counter_restarts_per_batch() {
    let mut req = ClientRequest::new();

    req.begin_batch().unwrap();
    let w = req.begin_request(None, Some("a")).unwrap();
    req.end_request(w).unwrap();
    req.end_batch().unwrap();

    req.reset();

    req.begin_batch().unwrap();
    let w = req.begin_request(None, Some("b")).unwrap();
    req.end_request(w).unwrap();
    req.end_batch().unwrap();

    assert_eq!(
        encoded(&req),
        "[{\"jsonrpc\":\"2.0\",\"id\":0,\"method\":\"b\"}]\n"
    );
}

#[test]
fn nested_batch_is_rejected() {
    let mut req = ClientRequest::new();

    req.begin_batch().unwrap();
    match req.begin_batch() {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {:?}", other.is_ok()),
    }
}

#[test]
fn oversized_request_leaves_buffer_intact() {
    let mut req = ClientRequest::new();

    let w = req.begin_request(Some(0), Some("small")).unwrap();
    req.end_request(w).unwrap();
    let before = req.as_bytes().len();

    let mut w = req.begin_request(Some(1), Some("huge")).unwrap();
    let blob = "x".repeat(33 * 1024 * 1024);
    w.params(&json!({ "blob": blob })).unwrap();

    match req.end_request(w) {
        Err(Error::RequestTooLarge) => {}
        _ => panic!("expected RequestTooLarge"),
    }

    // The earlier frame must still be intact.
    assert_eq!(req.as_bytes().len(), before);
}

#[test]
fn parse_single_response() {
    let mut client = Client::new();

    client.feed(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n");
    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);

    let resp = client.take_response().unwrap();
    assert_eq!(resp.id.unwrap().as_i64().unwrap(), 1);
    assert_eq!(resp.result.unwrap(), json!({ "ok": true }));
    assert!(resp.error.is_none());
}

#[test]
fn parse_error_response_maps_rpc_code() {
    let mut client = Client::new();

    client.feed(
        concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"error\":",
            "{\"code\":-32601,\"message\":\"Method not found\"}}\n"
        )
        .as_bytes(),
    );
    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);

    let resp = client.take_response().unwrap();
    let (code, msg) = resp.rpc_error().unwrap();
    assert_eq!(code, RpcCode::MethodNotFound);
    assert_eq!(msg, "Method not found");
}

#[test]
fn parse_response_byte_at_a_time() {
    let mut client = Client::new();
    let frame = b"{\"jsonrpc\":\"2.0\",\"id\":9,\"result\":null}";

    for b in &frame[.. frame.len() - 1] {
        client.feed(std::slice::from_ref(b));
        assert_eq!(client.parse_response().unwrap(), ParseStatus::Incomplete);
    }

    client.feed(&frame[frame.len() - 1 ..]);
    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);
    assert_eq!(client.take_response().unwrap().id.unwrap(), json!(9));
}

#[test]
fn parse_batch_latches_first_error() {
    let mut client = Client::new();

    client.feed(
        concat!(
            "[{\"jsonrpc\":\"2.0\",\"id\":0,\"result\":\"first\"},",
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":",
            "{\"code\":-32602,\"message\":\"bad params\"}},",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"error\":",
            "{\"code\":-32603,\"message\":\"later\"}}]\n"
        )
        .as_bytes(),
    );
    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);

    let resp = client.take_response().unwrap();
    assert_eq!(resp.id.clone().unwrap(), json!(1));
    let (code, _) = resp.rpc_error().unwrap();
    assert_eq!(code, RpcCode::InvalidParams);
}

#[test]
fn parse_batch_all_success_latches_first_result() {
    let mut client = Client::new();

    client.feed(
        concat!(
            "[{\"jsonrpc\":\"2.0\",\"id\":0,\"result\":\"a\"},",
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"b\"},",
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":\"c\"}]\n"
        )
        .as_bytes(),
    );
    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);

    let resp = client.take_response().unwrap();
    assert!(resp.error.is_none());
    assert_eq!(resp.id.unwrap(), json!(0));
    assert_eq!(resp.result.unwrap(), json!("a"));
}

#[test]
fn parse_wrong_version_is_fatal() {
    let mut client = Client::new();

    client.feed(b"{\"jsonrpc\":\"1.0\",\"id\":1,\"result\":null}\n");
    match client.parse_response() {
        Err(Error::InvalidVersion) => {}
        other => panic!("expected InvalidVersion, got ok={}", other.is_ok()),
    }
}

#[test]
fn parse_non_object_top_level_is_fatal() {
    let mut client = Client::new();

    client.feed(b"42\n");
    match client.parse_response() {
        Err(Error::InvalidReply) => {}
        other => panic!("expected InvalidReply, got ok={}", other.is_ok()),
    }
}

#[test]
fn parse_garbage_is_fatal() {
    let mut client = Client::new();

    client.feed(b"{\"jsonrpc\": nope}");
    assert!(client.parse_response().is_err());
}

#[test]
fn parse_two_responses_back_to_back() {
    let mut client = Client::new();

    client.feed(
        concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\n"
        )
        .as_bytes(),
    );

    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);
    assert_eq!(client.take_response().unwrap().id.unwrap(), json!(1));

    assert_eq!(client.parse_response().unwrap(), ParseStatus::Ready);
    assert_eq!(client.take_response().unwrap().id.unwrap(), json!(2));
}

#[test]
fn decode_reply_unwraps_result() {
    let mut client = Client::new();

    client.feed(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":[1,2,3]}\n");
    client.parse_response().unwrap();

    let v: Vec<u32> = super::decode_reply(client.take_response().unwrap()).unwrap();
    assert_eq!(v, vec![1, 2, 3]);
}
