use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{filter::IndicatorFilter, intel, AppState};

pub const MCP_SCHEMA_VERSION: &str = "falcon.intel.mcp.v1";

const SERVER_NAME: &str = "falcon-intel-mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone)]
struct ToolError {
    code: &'static str,
    message: String,
    http_status: StatusCode,
}

impl ToolError {
    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_ARGUMENT",
            message: message.into(),
            http_status: StatusCode::BAD_REQUEST,
        }
    }

    fn to_data(&self, trace_id: &str) -> Value {
        json!({
            "code": self.code,
            "traceId": trace_id,
            "httpStatus": self.http_status.as_u16(),
        })
    }
}

fn default_listing_limit() -> i64 {
    10
}

fn default_association_limit() -> i64 {
    20
}

fn default_recency_days() -> i64 {
    7
}

#[derive(Debug, Deserialize)]
struct ListActorsArgs {
    #[serde(default = "default_listing_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct ActorDetailsArgs {
    actor_name: String,
}

#[derive(Debug, Deserialize)]
struct SearchIocsArgs {
    indicator_value: Option<String>,
    indicator_type: Option<String>,
    malware_family: Option<String>,
    threat_type: Option<String>,
    malicious_confidence: Option<String>,
    published_after: Option<String>,
    mitre_technique: Option<String>,
    #[serde(default = "default_listing_limit")]
    limit: i64,
}

impl SearchIocsArgs {
    fn criteria(&self) -> IndicatorFilter {
        IndicatorFilter {
            indicator: self.indicator_value.clone(),
            indicator_type: self.indicator_type.clone(),
            malware_family: self.malware_family.clone(),
            threat_type: self.threat_type.clone(),
            malicious_confidence: self.malicious_confidence.clone(),
            published_after: self.published_after.clone(),
            mitre_technique: self.mitre_technique.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IocDetailsArgs {
    indicator_value: String,
}

#[derive(Debug, Deserialize)]
struct ActorIocsArgs {
    actor_name: String,
    #[serde(default = "default_association_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct RecentIocsArgs {
    #[serde(default = "default_recency_days")]
    days: i64,
    #[serde(default = "default_association_limit")]
    limit: i64,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return jsonrpc_error(
            request_id,
            -32600,
            "jsonrpc must be 2.0",
            json!({"code": "INVALID_ARGUMENT"}),
            StatusCode::BAD_REQUEST,
        );
    }

    if let Err(message) = verify_bearer(&headers, &state.config.api_key) {
        return jsonrpc_error(
            request_id,
            -32001,
            message,
            json!({"code": "UNAUTHORIZED"}),
            StatusCode::UNAUTHORIZED,
        );
    }

    let response = match request.method.as_str() {
        "ping" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "ok": true,
            }),
        ),
        "initialize" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "server": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION,
                },
                "capabilities": {
                    "tools": true,
                    "streaming": false,
                }
            }),
        ),
        "tools/list" => jsonrpc_ok(
            request_id,
            json!({
                "schemaVersion": MCP_SCHEMA_VERSION,
                "tools": tool_definitions(),
            }),
        ),
        "tools/call" => {
            let params = match request
                .params
                .as_ref()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value.clone()).ok())
            {
                Some(params) => params,
                None => {
                    return jsonrpc_error(
                        request_id,
                        -32602,
                        "Invalid tool call parameters",
                        json!({"code": "INVALID_ARGUMENT"}),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };

            let trace_id = Uuid::new_v4().to_string();
            let start = Instant::now();

            match run_tool(&state, &params.name, &params.arguments).await {
                Ok(text) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if state.config.dev_log_payloads {
                        debug!(
                            trace_id = %trace_id,
                            tool = %params.name,
                            response_bytes = text.len(),
                            "MCP tool call handled"
                        );
                    }
                    jsonrpc_ok(
                        request_id,
                        json!({
                            "schemaVersion": MCP_SCHEMA_VERSION,
                            "traceId": trace_id,
                            "tool": params.name,
                            "content": [{ "type": "text", "text": text }],
                            "timingMs": elapsed,
                        }),
                    )
                }
                Err(err) => jsonrpc_error(
                    request_id,
                    -32602,
                    err.message.clone(),
                    err.to_data(&trace_id),
                    err.http_status,
                ),
            }
        }
        _ => jsonrpc_error(
            request_id,
            -32601,
            "Method not found",
            json!({"code": "INVALID_ARGUMENT"}),
            StatusCode::NOT_FOUND,
        ),
    };

    if state.config.dev_log_payloads {
        debug!(method = %request.method, "MCP request handled");
    }

    response
}

/// Explicit name → handler mapping; the registry is this match, built once
/// per dispatch, not discovered from symbols.
async fn run_tool(state: &AppState, tool: &str, args: &Value) -> Result<String, ToolError> {
    let intel = state.intel.as_ref();
    match tool {
        "list_threat_actors" => {
            let args: ListActorsArgs = parse_args(tool, args)?;
            Ok(intel::list_threat_actors(intel, args.limit).await)
        }
        "get_actor_details" => {
            let args: ActorDetailsArgs = parse_args(tool, args)?;
            Ok(intel::get_actor_details(intel, &args.actor_name).await)
        }
        "search_iocs" => {
            let args: SearchIocsArgs = parse_args(tool, args)?;
            Ok(intel::search_iocs(intel, &args.criteria(), args.limit).await)
        }
        "get_ioc_details" => {
            let args: IocDetailsArgs = parse_args(tool, args)?;
            Ok(intel::get_ioc_details(intel, &args.indicator_value).await)
        }
        "get_actor_iocs" => {
            let args: ActorIocsArgs = parse_args(tool, args)?;
            Ok(intel::get_actor_iocs(intel, &args.actor_name, args.limit).await)
        }
        "get_recent_iocs" => {
            let args: RecentIocsArgs = parse_args(tool, args)?;
            Ok(intel::get_recent_iocs(intel, args.days, args.limit).await)
        }
        _ => Err(ToolError::invalid_argument(format!(
            "Unsupported tool: {tool}"
        ))),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: &Value) -> Result<T, ToolError> {
    let source = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(source)
        .map_err(|err| ToolError::invalid_argument(format!("Invalid arguments for {tool}: {err}")))
}

fn tool_definitions() -> Vec<Value> {
    vec![
        tool_def(
            "list_threat_actors",
            "List threat actors tracked by CrowdStrike",
            json!({"type":"object","properties":{"limit":{"type":"integer","description":"Maximum number of actors to return (default: 10)"}}}),
        ),
        tool_def(
            "get_actor_details",
            "Get detailed information about a specific threat actor",
            json!({"type":"object","required":["actor_name"],"properties":{"actor_name":{"type":"string","description":"Name of the threat actor to analyze"}}}),
        ),
        tool_def(
            "search_iocs",
            "Search for Indicators of Compromise (IOCs) with various filters",
            json!({"type":"object","properties":{
                "indicator_value":{"type":"string","description":"Specific indicator value to search for (hash, IP, domain, etc.)"},
                "indicator_type":{"type":"string","description":"Type of indicator (hash_md5, hash_sha256, ip_address, domain, etc.)"},
                "malware_family":{"type":"string","description":"Filter by malware family name"},
                "threat_type":{"type":"string","description":"Filter by threat type (Banking, Criminal, APT, etc.)"},
                "malicious_confidence":{"type":"string","description":"Filter by confidence level (high, medium, low)"},
                "published_after":{"type":"string","description":"ISO date string to filter IOCs published after this date"},
                "mitre_technique":{"type":"string","description":"Filter by MITRE ATT&CK technique name"},
                "limit":{"type":"integer","description":"Maximum number of IOCs to return (default: 10)"}}}),
        ),
        tool_def(
            "get_ioc_details",
            "Get detailed information about a specific IOC",
            json!({"type":"object","required":["indicator_value"],"properties":{"indicator_value":{"type":"string","description":"The specific indicator value to look up (hash, IP, domain, etc.)"}}}),
        ),
        tool_def(
            "get_actor_iocs",
            "Get IOCs associated with a specific threat actor",
            json!({"type":"object","required":["actor_name"],"properties":{"actor_name":{"type":"string","description":"Name of the threat actor"},"limit":{"type":"integer","description":"Maximum number of IOCs to return (default: 20)"}}}),
        ),
        tool_def(
            "get_recent_iocs",
            "Get recently published IOCs within the specified time period",
            json!({"type":"object","properties":{"days":{"type":"integer","description":"Number of days to look back (default: 7)"},"limit":{"type":"integer","description":"Maximum number of IOCs to return (default: 20)"}}}),
        ),
    ]
}

fn tool_def(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), &'static str> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err("Missing Authorization header");
    };

    let Ok(value) = raw_header.to_str() else {
        return Err("Invalid Authorization header");
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err("Authorization must use Bearer token");
    };

    if token.trim() != expected_key {
        return Err("Invalid API key");
    }

    Ok(())
}

fn jsonrpc_ok(id: Value, result: Value) -> Response<Body> {
    let payload = JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    };

    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error":{"code":"RESPONSE_BUILD_FAILED","message":"Failed building MCP response"}})),
            )
                .into_response()
        })
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
) -> Response<Body> {
    let payload = JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data,
        },
    };

    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error":{"code":"RESPONSE_BUILD_FAILED","message":"Failed building MCP response"}})),
            )
                .into_response()
        })
}
