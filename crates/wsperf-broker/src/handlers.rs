//! Observer RPC methods.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use wsperf_core::CaseDefinition;

use crate::dispatcher::RunDispatcher;
use crate::metrics::RPC_REQUESTS_TOTAL;
use crate::registry::WorkerRegistry;
use crate::rpc::RpcResponse;

/// Namespace observers may prefix method names with.
pub const RPC_URI_PREFIX: &str = "http://wsperf.org/api#";

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: RunDispatcher,
}

impl HandlerState {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        let dispatcher = RunDispatcher::new(Arc::clone(&registry));
        Self {
            registry,
            dispatcher,
        }
    }
}

/// Dispatch an RPC method to the appropriate handler.
pub fn dispatch(
    state: &HandlerState,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let name = method.strip_prefix(RPC_URI_PREFIX).unwrap_or(method);
    match name {
        "runCase" => {
            counter!(RPC_REQUESTS_TOTAL, "method" => "runCase").increment(1);
            run_case(state, params, id)
        }
        "getSlaves" => {
            counter!(RPC_REQUESTS_TOTAL, "method" => "getSlaves").increment(1);
            get_slaves(state, id)
        }
        _ => RpcResponse::method_not_found(id, method),
    }
}

fn run_case(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    // positional calls wrap the case in a one-element array
    let raw = match params {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };
    let case: CaseDefinition = match serde_json::from_value(raw.clone()) {
        Ok(case) => case,
        Err(e) => return RpcResponse::invalid_params(id, format!("invalid case definition: {e}")),
    };

    let dispatch = state.dispatcher.submit(&case);
    RpcResponse::success(id, Value::String(dispatch.run_id.to_string()))
}

fn get_slaves(state: &HandlerState, id: Option<Value>) -> RpcResponse {
    match serde_json::to_value(state.registry.list()) {
        Ok(workers) => RpcResponse::success(id, workers),
        Err(e) => RpcResponse::internal_error(id, format!("failed to encode worker list: {e}")),
    }
}
