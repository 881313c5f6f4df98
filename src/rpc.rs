//! JSON-RPC 2.0 envelope handling.
//!
//! One request (or batch array) per transport frame, one response frame
//! back. The envelope layer owns request validation and the api-version
//! gate; method semantics live behind the `invoke` callback supplied by
//! the worker context. A response is always produced.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::netns::{MacKey, TunnelKey};

pub const JSONRPC_VERSION: &str = "2.0";

/// Api token every method's params must carry.
pub const API_VERSION: &str = "emu-v1";

pub const ERR_PARSE: i32 = -32700;
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;
/// Method exists but the caller's api token does not match.
pub const ERR_INVALID_API: i32 = -32098;

/// Methods served without an api token (bootstrap surface).
const NO_API_METHODS: [&str; 2] = ["api_sync", "get_version"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        RpcError { code: ERR_METHOD_NOT_FOUND, message: format!("method {} not found", method) }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        RpcError { code: ERR_INVALID_PARAMS, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RpcError { code: ERR_INTERNAL, message: msg.into() }
    }

    pub fn invalid_api() -> Self {
        RpcError { code: ERR_INVALID_API, message: "method not valid with this api version".into() }
    }

    fn to_json(&self) -> Value {
        json!({"code": self.code, "message": self.message})
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    jsonrpc: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

fn error_response(id: Value, err: RpcError) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": err.to_json()})
}

fn result_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

fn handle_one(req: Value, invoke: &mut impl FnMut(&str, &Value) -> Result<Value, RpcError>) -> Value {
    let req: Request = match serde_json::from_value(req) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                Value::Null,
                RpcError { code: ERR_INVALID_REQUEST, message: e.to_string() },
            );
        }
    };
    let id = req.id.clone();
    if req.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
        return error_response(
            id,
            RpcError { code: ERR_INVALID_REQUEST, message: "jsonrpc version must be 2.0".into() },
        );
    }
    let Some(method) = req.method else {
        return error_response(
            id,
            RpcError { code: ERR_INVALID_REQUEST, message: "method missing".into() },
        );
    };

    if !NO_API_METHODS.contains(&method.as_str()) {
        match req.params.get("api").and_then(Value::as_str) {
            Some(api) if api == API_VERSION => {}
            _ => return error_response(id, RpcError::invalid_api()),
        }
    }

    match invoke(&method, &req.params) {
        Ok(result) => {
            // mirror the upstream server: an empty result reads as true
            let result = if result.is_null() { Value::Bool(true) } else { result };
            result_response(id, result)
        }
        Err(err) => error_response(id, err),
    }
}

/// Serve one envelope frame: parse, api-gate, invoke, respond. Batch
/// arrays map to response arrays.
pub fn serve_bytes(
    req: &[u8],
    mut invoke: impl FnMut(&str, &Value) -> Result<Value, RpcError>,
) -> Vec<u8> {
    let parsed: Value = match serde_json::from_slice(req) {
        Ok(v) => v,
        Err(e) => {
            let resp =
                error_response(Value::Null, RpcError { code: ERR_PARSE, message: e.to_string() });
            return serde_json::to_vec(&resp).expect("response serializes");
        }
    };

    let resp = match parsed {
        Value::Array(reqs) if !reqs.is_empty() => {
            Value::Array(reqs.into_iter().map(|r| handle_one(r, &mut invoke)).collect())
        }
        single => handle_one(single, &mut invoke),
    };
    serde_json::to_vec(&resp).expect("response serializes")
}

/// Extract the tunnel selector `{vport, tci: [u16, u16]}` from params.
pub fn tun_param(params: &Value) -> Result<TunnelKey, RpcError> {
    #[derive(Deserialize)]
    struct Tun {
        vport: u16,
        #[serde(default)]
        tci: [u16; 2],
    }
    let tun = params.get("tun").ok_or_else(|| RpcError::invalid_params("tun missing"))?;
    let tun: Tun = serde_json::from_value(tun.clone())
        .map_err(|e| RpcError::invalid_params(format!("bad tun: {}", e)))?;
    Ok(TunnelKey::from_tci(tun.vport, tun.tci))
}

/// Extract a client MAC (6-byte array) from params.
pub fn mac_param(params: &Value) -> Result<MacKey, RpcError> {
    let mac = params.get("mac").ok_or_else(|| RpcError::invalid_params("mac missing"))?;
    let mac: [u8; 6] = serde_json::from_value(mac.clone())
        .map_err(|e| RpcError::invalid_params(format!("bad mac: {}", e)))?;
    Ok(MacKey(mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(req: &str) -> Value {
        let resp = serve_bytes(req.as_bytes(), |method, params| match method {
            "echo" => Ok(params.get("x").cloned().unwrap_or(Value::Null)),
            other => Err(RpcError::method_not_found(other)),
        });
        serde_json::from_slice(&resp).unwrap()
    }

    #[test]
    fn happy_path() {
        let resp = call(
            r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"api":"emu-v1","x":42}}"#,
        );
        assert_eq!(resp["result"], 42);
        assert_eq!(resp["id"], 1);
    }

    #[test]
    fn null_result_reads_as_true() {
        let resp =
            call(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"api":"emu-v1"}}"#);
        assert_eq!(resp["result"], true);
    }

    #[test]
    fn wrong_api_is_rejected() {
        let resp =
            call(r#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"api":"emu-v0","x":1}}"#);
        assert_eq!(resp["error"]["code"], ERR_INVALID_API);
        let resp = call(r#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"x":1}}"#);
        assert_eq!(resp["error"]["code"], ERR_INVALID_API);
    }

    #[test]
    fn unknown_method_and_bad_envelope() {
        let resp =
            call(r#"{"jsonrpc":"2.0","id":2,"method":"nope","params":{"api":"emu-v1"}}"#);
        assert_eq!(resp["error"]["code"], ERR_METHOD_NOT_FOUND);

        let resp = call(r#"{"id":2,"method":"echo"}"#);
        assert_eq!(resp["error"]["code"], ERR_INVALID_REQUEST);

        let resp = call("{not json");
        assert_eq!(resp["error"]["code"], ERR_PARSE);
    }

    #[test]
    fn batch_requests_get_batch_responses() {
        let resp = call(
            r#"[{"jsonrpc":"2.0","id":1,"method":"echo","params":{"api":"emu-v1","x":1}},
                {"jsonrpc":"2.0","id":2,"method":"echo","params":{"api":"emu-v1","x":2}}]"#,
        );
        assert_eq!(resp[0]["result"], 1);
        assert_eq!(resp[1]["result"], 2);
    }

    #[test]
    fn param_extractors() {
        let params = json!({"tun": {"vport": 1, "tci": [1, 2]}, "mac": [0,0,1,0,0,5]});
        assert_eq!(tun_param(&params).unwrap(), TunnelKey::from_tci(1, [1, 2]));
        assert_eq!(mac_param(&params).unwrap(), MacKey([0, 0, 1, 0, 0, 5]));
        assert_eq!(tun_param(&json!({})).unwrap_err().code, ERR_INVALID_PARAMS);
    }
}
