//! Client preconditions and byte ranges on cacheable requests.
//!
//! Cache fills always fetch the complete representation, so validators and
//! `Range` are lifted off the client request before it can reach the origin.
//! They are answered here against whatever is delivered: a stored entry, a
//! coalesced fetch or a private one.

use std::time::SystemTime;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;

use crate::infra::origin::OriginResponse;

/// Request headers that make an exchange client-specific.
static CLIENT_CONDITIONS: [HeaderName; 6] = [
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
    header::RANGE,
];

/// Headers a `304 Not Modified` repeats from the full response.
static NOT_MODIFIED_HEADERS: [HeaderName; 7] = [
    header::CACHE_CONTROL,
    header::CONTENT_LOCATION,
    header::DATE,
    header::ETAG,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::VARY,
];

/// Preconditions and range taken from one client request.
#[derive(Debug, Clone, Default)]
pub struct ClientConditions {
    if_match: Option<String>,
    if_none_match: Option<String>,
    if_modified_since: Option<SystemTime>,
    if_unmodified_since: Option<SystemTime>,
    if_range: Option<String>,
    range: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    /// Inclusive bounds within the body.
    Satisfiable(usize, usize),
    Unsatisfiable,
    /// Malformed or multi-range: the full body is served instead.
    Ignored,
}

impl ClientConditions {
    /// Remove the conditional and range headers from `headers`, keeping
    /// their values for [`ClientConditions::answer`].
    pub fn take_from(headers: &mut HeaderMap) -> Self {
        let text = |name: &HeaderName| -> Option<String> {
            let joined = headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect::<Vec<_>>()
                .join(",");
            (!joined.trim().is_empty()).then_some(joined)
        };

        let conditions = Self {
            if_match: text(&header::IF_MATCH),
            if_none_match: text(&header::IF_NONE_MATCH),
            if_modified_since: text(&header::IF_MODIFIED_SINCE).and_then(|raw| http_date(&raw)),
            if_unmodified_since: text(&header::IF_UNMODIFIED_SINCE)
                .and_then(|raw| http_date(&raw)),
            if_range: text(&header::IF_RANGE),
            range: text(&header::RANGE),
        };
        for name in &CLIENT_CONDITIONS {
            headers.remove(name);
        }
        conditions
    }

    /// Evaluate the client's preconditions and range against a complete
    /// response. Anything other than `200` is delivered unchanged.
    pub fn answer(&self, method: &Method, response: OriginResponse) -> OriginResponse {
        if response.status != StatusCode::OK {
            return response;
        }

        let etag = response
            .headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);
        let last_modified = response
            .headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(http_date);

        if let Some(if_match) = &self.if_match {
            if !list_matches(if_match, etag, strong_eq) {
                return precondition_failed(&response);
            }
        } else if let (Some(since), Some(modified)) = (self.if_unmodified_since, last_modified)
            && modified > since
        {
            return precondition_failed(&response);
        }

        if let Some(if_none_match) = &self.if_none_match {
            if list_matches(if_none_match, etag, weak_eq) {
                return not_modified(&response);
            }
        } else if let (Some(since), Some(modified)) = (self.if_modified_since, last_modified)
            && modified <= since
        {
            return not_modified(&response);
        }

        match &self.range {
            Some(range) if method == Method::GET && self.if_range_holds(etag, last_modified) => {
                match parse_range(range, response.body.len()) {
                    ByteRange::Satisfiable(start, end) => partial(response, start, end),
                    ByteRange::Unsatisfiable => range_not_satisfiable(response),
                    ByteRange::Ignored => response,
                }
            }
            _ => response,
        }
    }

    fn if_range_holds(&self, etag: Option<&str>, last_modified: Option<SystemTime>) -> bool {
        let Some(validator) = self.if_range.as_deref().map(str::trim) else {
            return true;
        };
        if validator.starts_with('"') || validator.starts_with("W/") {
            etag.is_some_and(|etag| strong_eq(validator, etag))
        } else {
            http_date(validator).is_some_and(|date| Some(date) == last_modified)
        }
    }
}

fn http_date(raw: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(raw.trim()).ok()
}

/// `*` or any listed entity tag matching the current one.
fn list_matches(list: &str, etag: Option<&str>, eq: fn(&str, &str) -> bool) -> bool {
    let Some(etag) = etag else {
        return false;
    };
    list.split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || eq(candidate, etag))
}

fn strong_eq(left: &str, right: &str) -> bool {
    !left.starts_with("W/") && !right.starts_with("W/") && left == right
}

fn weak_eq(left: &str, right: &str) -> bool {
    left.trim_start_matches("W/") == right.trim_start_matches("W/")
}

fn parse_range(raw: &str, len: usize) -> ByteRange {
    let Some((unit, spec)) = raw.trim().split_once('=') else {
        return ByteRange::Ignored;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return ByteRange::Ignored;
    }
    let Some((first, last)) = spec.trim().split_once('-') else {
        return ByteRange::Ignored;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<usize>() else {
            return ByteRange::Ignored;
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Satisfiable(len.saturating_sub(suffix), len - 1);
    }

    let Ok(start) = first.parse::<usize>() else {
        return ByteRange::Ignored;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<usize>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Ignored,
        }
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = end.map_or(len - 1, |end| end.min(len - 1));
    ByteRange::Satisfiable(start, end)
}

fn not_modified(full: &OriginResponse) -> OriginResponse {
    let mut headers = HeaderMap::new();
    for name in &NOT_MODIFIED_HEADERS {
        for value in full.headers.get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    OriginResponse {
        status: StatusCode::NOT_MODIFIED,
        headers,
        body: Bytes::new(),
    }
}

fn precondition_failed(full: &OriginResponse) -> OriginResponse {
    let mut headers = HeaderMap::new();
    if let Some(etag) = full.headers.get(header::ETAG) {
        headers.insert(header::ETAG, etag.clone());
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    OriginResponse {
        status: StatusCode::PRECONDITION_FAILED,
        headers,
        body: Bytes::new(),
    }
}

fn partial(full: OriginResponse, start: usize, end: usize) -> OriginResponse {
    let total = full.body.len();
    let mut headers = full.headers;
    if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")) {
        headers.insert(header::CONTENT_RANGE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start + 1));
    OriginResponse {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
        body: full.body.slice(start..=end),
    }
}

fn range_not_satisfiable(full: OriginResponse) -> OriginResponse {
    let total = full.body.len();
    let mut headers = full.headers;
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
        headers.insert(header::CONTENT_RANGE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    OriginResponse {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        body: Bytes::new(),
    }
}
