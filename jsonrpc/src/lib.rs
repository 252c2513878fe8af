//! json-rpc 2.0 client codec as described in spec:
//! https://www.jsonrpc.org/specification.
//!
//! Only the framing lives here: requests are encoded into a growable send
//! buffer (single objects or batches), and responses are parsed out of a
//! receive buffer that is fed incrementally as bytes arrive from whatever
//! transport carries them.

pub mod error;
#[cfg(test)]
mod test;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use self::error::{Error, RpcCode};

/// Initial size of the request send buffer.
const SEND_BUF_SIZE_INIT: usize = 8 * 1024;
/// Hard cap for the request send buffer; encoding past this fails.
const SEND_BUF_SIZE_MAX: usize = 32 * 1024 * 1024;
/// Ceiling on the number of json values a single reply may contain.
const CLIENT_MAX_VALUES: usize = 8 * 1024;

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC request object
pub struct Request<'a> {
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<&'a str>,
    /// Identifier for this Request, which should appear in the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// The name of the RPC call
    pub method: &'a str,
    /// Parameters to the RPC call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i32,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    pub data: Option<serde_json::Value>,
}

/// The decoded, simplified form of one response. For a batch this carries
/// the first error observed, or the first result when the whole batch
/// succeeded. The primary consumer only needs to know whether the batch as
/// a whole succeeded.
#[derive(Debug, Default)]
pub struct ClientResponse {
    /// Identifier matching the request, a json string or number.
    pub id: Option<Value>,
    /// Result value if the call succeeded.
    pub result: Option<Value>,
    /// Error object if the call failed.
    pub error: Option<Value>,
}

impl ClientResponse {
    /// Interpret the latched error object, if any, as an `RpcError` and map
    /// its code.
    pub fn rpc_error(&self) -> Option<(RpcCode, String)> {
        let err = self.error.as_ref()?;
        let err: RpcError = serde_json::from_value(err.clone()).ok()?;
        Some((RpcCode::from_code(err.code), err.message))
    }
}

/// Outcome of one `parse_response()` attempt.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseStatus {
    /// Not enough bytes buffered for a full json value yet.
    Incomplete,
    /// A full response was parsed and can be taken.
    Ready,
}

/// Write context for one request object. Obtained from
/// [`ClientRequest::begin_request`] and handed back to
/// [`ClientRequest::end_request`]. Parameters are appended through it so
/// the field order on the wire is jsonrpc, id, method, params.
pub struct WriteCtx {
    obj: Vec<u8>,
}

impl WriteCtx {
    fn named_raw(&mut self, name: &str, raw: &[u8]) {
        // The object opener was already written, so every field needs a
        // separator.
        self.obj.push(b',');
        self.obj.extend_from_slice(format!("\"{}\":", name).as_bytes());
        self.obj.extend_from_slice(raw);
    }

    /// Append a named json value to the request object.
    pub fn named_value<T: Serialize>(
        &mut self,
        name: &str,
        val: &T,
    ) -> Result<(), Error> {
        let raw = serde_json::to_vec(val)?;
        self.named_raw(name, &raw);
        Ok(())
    }

    /// Append the conventional "params" member.
    pub fn params<T: Serialize>(&mut self, params: &T) -> Result<(), Error> {
        self.named_value("params", params)
    }
}

/// An outgoing request buffer. Holds one encoded request, or a batch of
/// them, ready to be handed to a transport.
pub struct ClientRequest {
    send_buf: Vec<u8>,
    send_buf_size: usize,
    batch: bool,
    batch_id: u32,
    batch_buf: Vec<u8>,
}

impl Default for ClientRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRequest {
    pub fn new() -> Self {
        Self {
            send_buf: Vec::with_capacity(SEND_BUF_SIZE_INIT),
            send_buf_size: SEND_BUF_SIZE_INIT,
            batch: false,
            batch_id: 0,
            batch_buf: Vec::new(),
        }
    }

    /// Grow-by-doubling append honouring the hard cap. The send buffer is
    /// left untouched when the write does not fit.
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut new_size = self.send_buf_size;

        while new_size - self.send_buf.len() < data.len() {
            if new_size >= SEND_BUF_SIZE_MAX {
                tracing::error!(
                    "Send buf exceeded maximum size ({})",
                    SEND_BUF_SIZE_MAX
                );
                return Err(Error::RequestTooLarge);
            }
            new_size *= 2;
        }

        if new_size != self.send_buf_size {
            self.send_buf.reserve(new_size - self.send_buf.len());
            self.send_buf_size = new_size;
        }

        self.send_buf.extend_from_slice(data);
        Ok(())
    }

    /// Start a new request object. In single mode the object is finalized
    /// by `end_request`; in batch mode it becomes one element of the open
    /// array. An absent `id` is omitted in single mode and auto-assigned
    /// from the running batch counter in batch mode.
    pub fn begin_request(
        &mut self,
        id: Option<i32>,
        method: Option<&str>,
    ) -> Result<WriteCtx, Error> {
        let mut w = WriteCtx {
            obj: Vec::with_capacity(128),
        };

        w.obj.extend_from_slice(b"{\"jsonrpc\":\"2.0\"");

        match id {
            None if self.batch => {
                let auto = self.batch_id;
                self.batch_id += 1;
                w.obj
                    .extend_from_slice(format!(",\"id\":{}", auto).as_bytes());
            }
            Some(id) if id >= 0 => {
                w.obj.extend_from_slice(format!(",\"id\":{}", id).as_bytes());
            }
            _ => {}
        }

        if let Some(method) = method {
            let raw = serde_json::to_vec(method)?;
            w.obj.extend_from_slice(b",\"method\":");
            w.obj.extend_from_slice(&raw);
        }

        Ok(w)
    }

    /// Close the request object. Single mode finalizes the request and
    /// appends the newline terminator; batch mode leaves the enclosing
    /// array open.
    pub fn end_request(&mut self, mut w: WriteCtx) -> Result<(), Error> {
        w.obj.push(b'}');

        if self.batch {
            if self.batch_buf.len() > 1 {
                self.batch_buf.push(b',');
            }
            self.batch_buf.extend_from_slice(&w.obj);
            Ok(())
        } else {
            w.obj.push(b'\n');
            self.write(&w.obj)
        }
    }

    /// Open a batch array. Requests encoded until `end_batch` become its
    /// elements, with ids auto-assigned from zero when absent.
    pub fn begin_batch(&mut self) -> Result<(), Error> {
        if self.batch {
            return Err(Error::InvalidState("batch already open"));
        }
        self.batch = true;
        self.batch_id = 0;
        self.batch_buf.clear();
        self.batch_buf.push(b'[');
        Ok(())
    }

    /// Close the batch array and finalize it into the send buffer.
    pub fn end_batch(&mut self) -> Result<(), Error> {
        if !self.batch {
            return Err(Error::InvalidState("no batch open"));
        }

        let mut staged = std::mem::take(&mut self.batch_buf);
        staged.extend_from_slice(b"]\n");
        self.batch = false;

        self.write(&staged)
    }

    /// The encoded bytes ready for transmission.
    pub fn as_bytes(&self) -> &[u8] {
        &self.send_buf
    }

    /// Drop everything encoded so far and return to single mode.
    pub fn reset(&mut self) {
        self.send_buf.clear();
        self.batch = false;
        self.batch_id = 0;
        self.batch_buf.clear();
    }
}

/// Receiving half of a client connection: buffers incoming bytes and
/// parses one response (object or batch array) at a time.
#[derive(Default)]
pub struct Client {
    recv_buf: Vec<u8>,
    resp: Option<ClientResponse>,
}

/// Count json values the way a token counter would: one per scalar, one
/// per object/array, one per object key.
fn count_values(v: &Value) -> usize {
    match v {
        Value::Object(map) => {
            1 + map.values().map(|v| 1 + count_values(v)).sum::<usize>()
        }
        Value::Array(items) => 1 + items.iter().map(count_values).sum::<usize>(),
        _ => 1,
    }
}

/// Decode `{jsonrpc, id?, result?, error?}` with the version pinned to
/// "2.0" and the id restricted to a string or number.
fn decode_response_object(v: &Value) -> Result<ClientResponse, Error> {
    let obj = v.as_object().ok_or(Error::InvalidReply)?;

    match obj.get("jsonrpc") {
        Some(Value::String(vers)) if vers == "2.0" => {}
        _ => return Err(Error::InvalidVersion),
    }

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(id @ Value::String(_)) | Some(id @ Value::Number(_)) => {
            Some(id.clone())
        }
        Some(_) => return Err(Error::InvalidReplyId),
    };

    Ok(ClientResponse {
        id,
        result: obj.get("result").cloned(),
        error: obj.get("error").cloned(),
    })
}

/// Aggregate a batch into the simplified single response: latch the first
/// element carrying an error, otherwise the first result. Sufficient for
/// consumers that only need to know whether the batch as a whole
/// succeeded.
fn decode_batch_response(items: &[Value]) -> Result<ClientResponse, Error> {
    let mut out = ClientResponse::default();
    let mut found_error = false;

    for item in items {
        let elem = decode_response_object(item)?;

        if elem.error.is_some() && !found_error {
            out.error = elem.error;
            out.id = elem.id;
            found_error = true;
        } else if !found_error && out.result.is_none() {
            // Callers expect a result on success, so keep the first one.
            if elem.result.is_some() {
                out.result = elem.result;
                out.id = elem.id;
            }
        }
    }

    Ok(out)
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.recv_buf.extend_from_slice(data);
    }

    /// Try to parse one full response out of the receive buffer.
    ///
    /// Returns `Incomplete` while more bytes are needed. Any parse failure,
    /// a version other than "2.0", or a top-level value that is neither an
    /// object nor an array is fatal: there is no guaranteed resync point in
    /// streaming json, so the connection should be closed.
    pub fn parse_response(&mut self) -> Result<ParseStatus, Error> {
        if self.resp.is_some() {
            return Err(Error::InvalidState("previous response not taken"));
        }

        let mut stream = serde_json::Deserializer::from_slice(&self.recv_buf)
            .into_iter::<Value>();

        let value = match stream.next() {
            None => return Ok(ParseStatus::Incomplete),
            Some(Err(e)) if e.is_eof() => return Ok(ParseStatus::Incomplete),
            Some(Err(e)) => return Err(Error::ParseError(e)),
            Some(Ok(v)) => v,
        };
        let consumed = stream.byte_offset();

        if count_values(&value) > CLIENT_MAX_VALUES {
            return Err(Error::ReplyTooLarge);
        }

        trace!(
            "JSON response: {}",
            String::from_utf8_lossy(&self.recv_buf[.. consumed])
        );

        // Detach the consumed bytes; whatever follows belongs to the next
        // response.
        self.recv_buf.drain(.. consumed);

        let resp = match &value {
            Value::Array(items) => decode_batch_response(items)?,
            Value::Object(_) => decode_response_object(&value)?,
            _ => return Err(Error::InvalidReply),
        };

        self.resp = Some(resp);
        Ok(ParseStatus::Ready)
    }

    /// Take the parsed response, freeing the slot for the next one.
    pub fn take_response(&mut self) -> Option<ClientResponse> {
        self.resp.take()
    }
}

/// Decode the `result` member of a response into the caller's type,
/// surfacing a json-rpc error object as `Error::RpcError`. An absent
/// result decodes as json null, so `()` callers do not need a value.
pub fn decode_reply<T>(resp: ClientResponse) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned,
{
    if let Some((code, msg)) = resp.rpc_error() {
        return Err(Error::RpcError {
            code,
            msg,
        });
    }

    let result = resp.result.unwrap_or(Value::Null);
    serde_json::from_value::<T>(result).map_err(Error::ParseError)
}
