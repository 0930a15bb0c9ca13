//! Correlation headers threaded through a request and its response

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Conversation identifier supplied by the caller and echoed back
pub const CONVERSATION_ID: HeaderName = HeaderName::from_static("conversationid");

/// Client-supplied request timestamp, echoed back
pub const REQUEST_TIMESTAMP: HeaderName = HeaderName::from_static("requestts");

/// Server completion timestamp (epoch millis), stamped on every response
pub const CLIENT_TIMESTAMP: HeaderName = HeaderName::from_static("clientts");

/// Copy correlation headers from the request onto the response and stamp the
/// completion time.
///
/// Values already present on the response are left untouched, so calling this
/// more than once never overwrites what a handler set. The request is never
/// mutated.
pub fn ensure_correlation(request: &HeaderMap, response: &mut HeaderMap) {
    let now = chrono::Utc::now().timestamp_millis();
    ensure_correlation_at(request, response, now);
}

/// Same as [`ensure_correlation`] with an explicit completion time
pub fn ensure_correlation_at(request: &HeaderMap, response: &mut HeaderMap, now_millis: i64) {
    for name in [CONVERSATION_ID, REQUEST_TIMESTAMP] {
        if response.contains_key(&name) {
            continue;
        }
        if let Some(value) = request.get(&name) {
            response.insert(name, value.clone());
        }
    }

    response.insert(CLIENT_TIMESTAMP, HeaderValue::from(now_millis));
}

/// Read a header as UTF-8, ignoring values that are not
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_echoed() {
        let mut request = HeaderMap::new();
        request.insert(CONVERSATION_ID, HeaderValue::from_static("4"));
        let mut response = HeaderMap::new();

        ensure_correlation(&request, &mut response);

        assert_eq!(response.get(CONVERSATION_ID).unwrap(), "4");
        assert!(response.contains_key(CLIENT_TIMESTAMP));
        assert!(!response.contains_key(REQUEST_TIMESTAMP));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut request = HeaderMap::new();
        request.insert(
            HeaderName::from_bytes(b"ConversationId").unwrap(),
            HeaderValue::from_static("abc"),
        );
        request.insert(
            HeaderName::from_bytes(b"RequestTS").unwrap(),
            HeaderValue::from_static("1638453187000"),
        );
        let mut response = HeaderMap::new();

        ensure_correlation(&request, &mut response);

        assert_eq!(header_str(&response, &CONVERSATION_ID), Some("abc"));
        assert_eq!(header_str(&response, &REQUEST_TIMESTAMP), Some("1638453187000"));
    }

    #[test]
    fn test_existing_response_values_are_kept() {
        let mut request = HeaderMap::new();
        request.insert(CONVERSATION_ID, HeaderValue::from_static("from-request"));
        request.insert(REQUEST_TIMESTAMP, HeaderValue::from_static("1"));
        let mut response = HeaderMap::new();
        response.insert(CONVERSATION_ID, HeaderValue::from_static("from-handler"));

        ensure_correlation_at(&request, &mut response, 100);
        ensure_correlation_at(&request, &mut response, 200);

        assert_eq!(response.get(CONVERSATION_ID).unwrap(), "from-handler");
        assert_eq!(response.get(REQUEST_TIMESTAMP).unwrap(), "1");
        assert_eq!(response.get(CLIENT_TIMESTAMP).unwrap(), "200");
        assert_eq!(response.get_all(CONVERSATION_ID).iter().count(), 1);
    }

    #[test]
    fn test_request_is_not_mutated() {
        let mut request = HeaderMap::new();
        request.insert(CONVERSATION_ID, HeaderValue::from_static("4"));
        let before = request.clone();
        let mut response = HeaderMap::new();

        ensure_correlation(&request, &mut response);

        assert_eq!(request, before);
    }
}
