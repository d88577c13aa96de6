//! # REST API HTTP Server
//!
//! Axum-based HTTP server for table endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::table::{
    normalize, Principal, RequestContext, ResourceError, ResourceResult, TableDriver,
    TableResource, Verb,
};

/// Verb tunneling header
pub const METHOD_HEADER: &str = "x-http-method";

/// Alternate verb tunneling header
pub const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

/// Trusted header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Verb tunneling query parameter
const METHOD_PARAM: &str = "method";

/// REST API server state
pub struct RestServer<D: TableDriver> {
    resource: Arc<TableResource<D>>,
    cors_origins: Vec<String>,
}

impl<D: TableDriver + 'static> RestServer<D> {
    pub fn new(resource: TableResource<D>) -> Self {
        Self {
            resource: Arc::new(resource),
            cors_origins: Vec::new(),
        }
    }

    /// Restrict CORS to the given origins; empty allows any
    pub fn with_cors(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Build the Axum router
    pub fn router(self) -> Router {
        let cors = cors_layer(&self.cors_origins);
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(health_handler))
            .route("/api/:table", any(table_handler::<D>))
            .route("/api/:table/:id", any(record_handler::<D>))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Bind and serve until the listener fails
    pub async fn serve(self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "REST API listening");
        axum::serve(listener, self.router()).await
    }
}

/// Shared state type
type ServerState<D> = Arc<RestServer<D>>;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Table-level handler: batch operations and filter retrieval
async fn table_handler<D: TableDriver + 'static>(
    State(server): State<ServerState<D>>,
    Path(table): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ResourceError> {
    dispatch(server, table, None, method, query, headers, body).await
}

/// Record-level handler: operations on one identifier
async fn record_handler<D: TableDriver + 'static>(
    State(server): State<ServerState<D>>,
    Path((table, id)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ResourceError> {
    dispatch(server, table, Some(id), method, query, headers, body).await
}

async fn dispatch<D: TableDriver + 'static>(
    server: ServerState<D>,
    table: String,
    id: Option<String>,
    method: Method,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ResourceError> {
    let verb = resolve_verb(&method, &headers, &query)?;
    let payload = parse_body(&body)?;
    let ctx = extract_context(&headers);
    debug!(request_id = %ctx.request_id, %table, %verb, "dispatching request");

    let request = normalize(
        verb,
        id.as_deref(),
        &query,
        payload,
        &server.resource.settings().record_key,
    )?;

    let resource = Arc::clone(&server.resource);
    let result = tokio::task::spawn_blocking(move || resource.handle(&ctx, &table, request))
        .await
        .map_err(|e| ResourceError::driver(format!("Request task failed: {}", e)))?;
    let body = result?;

    let status = if verb == Verb::Post {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(body)))
}

/// Effective verb: tunneling header, then `method` query parameter, then the HTTP method
fn resolve_verb(
    method: &Method,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> ResourceResult<Verb> {
    let tunneled = [METHOD_HEADER, METHOD_OVERRIDE_HEADER]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .or_else(|| query.get(METHOD_PARAM).map(String::as_str))
        .map(str::trim)
        .filter(|m| !m.is_empty());

    let name = tunneled.unwrap_or_else(|| method.as_str());
    Verb::parse(name)
        .ok_or_else(|| ResourceError::bad_request(format!("Unsupported verb '{}'.", name)))
}

fn parse_body(body: &Bytes) -> ResourceResult<Option<Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ResourceError::bad_request(format!("Invalid JSON body: {}", e)))
}

/// Principal from the trusted user-id header; numeric ids stay numeric
fn extract_context(headers: &HeaderMap) -> RequestContext {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match user_id {
        Some(id) => match id.parse::<i64>() {
            Ok(n) => RequestContext::new(Principal::user(n)),
            Err(_) => RequestContext::new(Principal::user(id)),
        },
        None => RequestContext::anonymous(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn test_resolve_verb_plain() {
        let verb = resolve_verb(&Method::PUT, &HeaderMap::new(), &HashMap::new()).unwrap();
        assert_eq!(verb, Verb::Put);
    }

    #[test]
    fn test_resolve_verb_header_wins() {
        let h = headers(&[(METHOD_HEADER, "merge")]);
        let mut q = HashMap::new();
        q.insert("method".to_string(), "DELETE".to_string());
        assert_eq!(resolve_verb(&Method::POST, &h, &q).unwrap(), Verb::Patch);
    }

    #[test]
    fn test_resolve_verb_query_param() {
        let mut q = HashMap::new();
        q.insert("method".to_string(), "delete".to_string());
        let verb = resolve_verb(&Method::POST, &HeaderMap::new(), &q).unwrap();
        assert_eq!(verb, Verb::Delete);
    }

    #[test]
    fn test_resolve_verb_unsupported() {
        let err = resolve_verb(&Method::OPTIONS, &HeaderMap::new(), &HashMap::new()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(&Bytes::new()).unwrap(), None);
        assert_eq!(parse_body(&Bytes::from_static(b"  \n")).unwrap(), None);
        assert_eq!(
            parse_body(&Bytes::from_static(b"{\"a\":1}")).unwrap(),
            Some(json!({"a": 1}))
        );
        assert!(parse_body(&Bytes::from_static(b"{nope")).is_err());
    }

    #[test]
    fn test_extract_context() {
        let ctx = extract_context(&headers(&[(USER_ID_HEADER, "42")]));
        assert_eq!(ctx.principal.user_id, Some(json!(42)));

        let ctx = extract_context(&headers(&[(USER_ID_HEADER, "alice")]));
        assert_eq!(ctx.principal.user_id, Some(json!("alice")));

        let ctx = extract_context(&HeaderMap::new());
        assert_eq!(ctx.principal, Principal::anonymous());
    }
}
