#![no_main]

use libfuzzer_sys::fuzz_target;
use mapepire_protocol::{
    ConnectionResult, ExplainResults, QueryResult, ServerResponse, decode_response, response_id,
};
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let _ = response_id(&value);
    let _ = decode_response::<ServerResponse>(value.clone());
    let _ = decode_response::<ConnectionResult>(value.clone());
    let _ = decode_response::<ExplainResults<Value>>(value.clone());
    let _ = decode_response::<QueryResult<Vec<Value>>>(value.clone());
    let _ = decode_response::<QueryResult<Value>>(value);
});
