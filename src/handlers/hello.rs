use crate::utils::auth::decode_basic;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Response};
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::sleep;

pub const AUTHENTICATED_USER: HeaderName = HeaderName::from_static("x-authenticated-user");

/// Greets the request path after an artificial delay.
pub async fn hello(
    request: Request<Incoming>,
    delay: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if !delay.is_zero() {
        sleep(delay).await;
    }

    let body = format!("Hello, {:?}", escape_html(request.uri().path()));
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    let user = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic)
        .and_then(|credentials| HeaderValue::from_str(&credentials.username).ok());
    if let Some(user) = user {
        response.headers_mut().insert(AUTHENTICATED_USER, user);
    }

    Ok(response)
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
