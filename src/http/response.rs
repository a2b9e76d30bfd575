//! Response construction helpers.
//!
//! # Responsibilities
//! - Synthesize error, redirect and finish responses
//! - Strip hop-by-hop headers in both directions
//!
//! # Design Decisions
//! - Fatal pipeline errors answer with a plain internal-error response
//! - Redirect bodies follow the conventional short HTML note, and only for
//!   GET/HEAD

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Response, StatusCode};

use crate::filter::context::keys;
use crate::http::request::ProxyRequest;

/// Headers meaningful only for a single transport-level connection.
const HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in &HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}

/// Plain-text response with the canonical reason phrase as body.
pub fn error_response(status: StatusCode) -> Response<Body> {
    let text = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

pub fn internal_error() -> Response<Body> {
    error_response(StatusCode::INTERNAL_SERVER_ERROR)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Redirect to `location`. Non-redirect statuses become 302 Found.
pub fn redirect(location: &str, status: StatusCode, extra: HeaderMap, method: &Method) -> Response<Body> {
    let status = if status.is_redirection() {
        status
    } else {
        StatusCode::FOUND
    };

    let mut headers = extra;
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(_) => {
            tracing::warn!(%location, "Redirect location is not a valid header value");
            return internal_error();
        }
    }

    let body = if *method == Method::GET || *method == Method::HEAD {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Body::from(format!(
            "<a href=\"{}\">{}</a>.\n\n",
            html_escape(location),
            status.canonical_reason().unwrap_or("Redirect")
        ))
    } else {
        Body::empty()
    };

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

/// Response for a `Finish` outcome: the status a filter stored in the
/// context, else the status of the recorded error, else 403.
pub fn finish_response(req: &ProxyRequest) -> Response<Body> {
    let status = req
        .context
        .get(&keys::FINISH_STATUS)
        .copied()
        .or_else(|| req.error_code().map(|c| c.status()))
        .unwrap_or(StatusCode::FORBIDDEN);
    error_response(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::tests::request;
    use crate::proxy::error::ErrorCode;
    use http_body_util::BodyExt;

    #[test]
    fn strips_listed_and_standard_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-hop"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-keep", HeaderValue::from_static("1"));
        strip_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }

    #[tokio::test]
    async fn redirect_for_get_has_html_body() {
        let mut extra = HeaderMap::new();
        extra.insert("x-why", HeaderValue::from_static("moved"));
        let resp = redirect("/new?a=<b>", StatusCode::MOVED_PERMANENTLY, extra, &Method::GET);
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()["location"], "/new?a=<b>");
        assert_eq!(resp.headers()["x-why"], "moved");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body).unwrap().contains("&lt;b&gt;"));
    }

    #[test]
    fn redirect_coerces_non_redirect_status() {
        let resp = redirect("/x", StatusCode::OK, HeaderMap::new(), &Method::POST);
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert!(!resp.headers().contains_key("content-type"));
    }

    #[test]
    fn finish_status_precedence() {
        let mut req = request("GET", "/", &[]);
        assert_eq!(finish_response(&req).status(), StatusCode::FORBIDDEN);
        req.set_error(ErrorCode::ReadClientBody, "bad");
        assert_eq!(finish_response(&req).status(), StatusCode::BAD_REQUEST);
        req.context.insert(&keys::FINISH_STATUS, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(finish_response(&req).status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
