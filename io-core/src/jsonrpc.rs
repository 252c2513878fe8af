//! jsonrpc module helps the engine talk to management daemons that speak
//! json-rpc 2.0: it frames method calls (single or batched) with the
//! codec crate and folds replies back into engine errors.

use jsonrpc::{
    error::Error,
    Client,
    ClientRequest,
    ClientResponse,
    ParseStatus,
};
use serde::Serialize;

/// A staged sequence of calls framed as one batch request. Ids are
/// assigned from zero in call order.
pub struct BatchCall {
    request: ClientRequest,
    calls: u32,
}

impl BatchCall {
    pub fn new() -> Result<Self, Error> {
        let mut request = ClientRequest::new();
        request.begin_batch()?;
        Ok(Self {
            request,
            calls: 0,
        })
    }

    /// Append one method call.
    pub fn call<P: Serialize>(
        &mut self,
        method: &str,
        params: Option<&P>,
    ) -> Result<(), Error> {
        let mut w = self.request.begin_request(None, Some(method))?;
        if let Some(p) = params {
            w.params(p)?;
        }
        self.request.end_request(w)?;
        self.calls += 1;
        Ok(())
    }

    /// Close the batch and hand back the wire bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        self.request.end_batch()?;
        Ok(self.request.as_bytes().to_vec())
    }

    pub fn len(&self) -> u32 {
        self.calls
    }

    pub fn is_empty(&self) -> bool {
        self.calls == 0
    }
}

/// Frame one standalone call.
pub fn single_call<P: Serialize>(
    id: i32,
    method: &str,
    params: Option<&P>,
) -> Result<Vec<u8>, Error> {
    let mut request = ClientRequest::new();
    let mut w = request.begin_request(Some(id), Some(method))?;
    if let Some(p) = params {
        w.params(p)?;
    }
    request.end_request(w)?;
    Ok(request.as_bytes().to_vec())
}

/// Feed reply bytes until one full response is parsed. The caller loops
/// this over its transport reads; `None` means keep reading.
pub fn parse_reply_bytes(
    client: &mut Client,
    bytes: &[u8],
) -> Result<Option<ClientResponse>, Error> {
    client.feed(bytes);
    match client.parse_response()? {
        ParseStatus::Incomplete => Ok(None),
        ParseStatus::Ready => Ok(client.take_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_framing_assigns_sequential_ids() {
        let mut batch = BatchCall::new().unwrap();
        batch
            .call("bdev_get_bdevs", Some(&json!({ "name": "nvme0n1" })))
            .unwrap();
        batch.call::<serde_json::Value>("bdev_get_iostat", None).unwrap();
        assert_eq!(batch.len(), 2);

        let bytes = batch.finish().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with('['));
        assert!(text.ends_with("]\n"));
        assert!(text.contains("\"id\":0"));
        assert!(text.contains("\"id\":1"));
    }

    #[test]
    fn reply_roundtrip() {
        let mut client = Client::new();
        let reply =
            b"{\"jsonrpc\":\"2.0\",\"id\":0,\"result\":{\"ok\":1}}\n";

        assert!(parse_reply_bytes(&mut client, &reply[.. 10])
            .unwrap()
            .is_none());
        let resp = parse_reply_bytes(&mut client, &reply[10 ..])
            .unwrap()
            .unwrap();
        assert_eq!(resp.result.unwrap(), json!({ "ok": 1 }));
    }
}
