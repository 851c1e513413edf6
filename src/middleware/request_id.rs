use crate::tracing::{scope_request_id, RequestId};
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is reused as-is
const MAX_INCOMING_ID_LEN: usize = 128;

fn incoming_request_id(request: &Request) -> Option<(RequestId, HeaderValue)> {
    let value = request.headers().get(REQUEST_ID_HEADER)?;
    let id = value.to_str().ok()?.trim();
    if id.is_empty() || id.len() > MAX_INCOMING_ID_LEN {
        return None;
    }
    Some((RequestId::new(id), HeaderValue::from_str(id).ok()?))
}

/// Settles the request id, exposes it as an extension and a task-local for
/// the rest of the stack, and echoes it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let (request_id, header_value) = match incoming_request_id(&request) {
        Some(incoming) => incoming,
        None => {
            let generated = RequestId::generate();
            // uuid text is always a valid header value
            let value = HeaderValue::from_str(generated.as_str())
                .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
            (generated, value)
        }
    };

    tracing::Span::current().record("request_id", request_id.as_str());

    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    request
        .headers_mut()
        .insert(header.clone(), header_value.clone());
    request.extensions_mut().insert(request_id.clone());

    let mut response = scope_request_id(request_id, next.run(request)).await;
    response.headers_mut().insert(header, header_value);
    response
}
