//! W3C trace context extraction and injection
//!
//! All propagation goes through explicit carriers. Anything that reads and
//! writes string key/value pairs can carry context via the
//! [`Extractor`]/[`Injector`] traits; the header wrappers cover the common
//! HTTP case.

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Reads trace context headers from an [`http::HeaderMap`]
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Writes trace context headers into an [`http::HeaderMap`]
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl<'a> Injector for HeaderInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(key),
            http::header::HeaderValue::try_from(value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Extract a parent context from any carrier.
///
/// A missing or malformed `traceparent` yields a context with no remote
/// parent, so the caller starts a new trace instead of failing.
pub fn extract_context(carrier: &dyn Extractor) -> Context {
    let propagator = TraceContextPropagator::new();
    propagator.extract_with_context(&Context::new(), carrier)
}

/// Extract a parent context from HTTP headers
pub fn extract_from_headers(headers: &http::HeaderMap) -> Context {
    extract_context(&HeaderExtractor(headers))
}

/// Inject `cx` into any carrier as W3C `traceparent`/`tracestate`
pub fn inject_context(cx: &Context, carrier: &mut dyn Injector) {
    let propagator = TraceContextPropagator::new();
    propagator.inject_context(cx, carrier);
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TraceContextExt;
    use std::collections::HashMap;

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_extract_valid_traceparent() {
        let mut carrier = HashMap::new();
        carrier.insert("traceparent".to_string(), TRACEPARENT.to_string());

        let cx = extract_context(&carrier);
        let span_context = cx.span().span_context().clone();
        assert!(span_context.is_valid());
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(span_context.span_id().to_string(), "b7ad6b7169203331");
        assert!(span_context.is_sampled());
    }

    #[test]
    fn test_extract_missing_traceparent() {
        let carrier: HashMap<String, String> = HashMap::new();
        let cx = extract_context(&carrier);
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_extract_malformed_traceparent() {
        let malformed = [
            "not-a-traceparent",
            "00-zzzz-yyyy-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
            "",
        ];
        for value in malformed {
            let mut carrier = HashMap::new();
            carrier.insert("traceparent".to_string(), value.to_string());
            let cx = extract_context(&carrier);
            assert!(
                !cx.span().span_context().is_valid(),
                "expected invalid context for {:?}",
                value
            );
        }
    }

    #[test]
    fn test_round_trip_preserves_trace_id() {
        let mut inbound = HashMap::new();
        inbound.insert("traceparent".to_string(), TRACEPARENT.to_string());
        let cx = extract_context(&inbound);

        let mut outbound: HashMap<String, String> = HashMap::new();
        inject_context(&cx, &mut outbound);

        assert_eq!(outbound.get("traceparent").map(String::as_str), Some(TRACEPARENT));
    }

    #[test]
    fn test_header_map_round_trip() {
        let mut inbound = http::HeaderMap::new();
        inbound.insert(
            "traceparent",
            http::header::HeaderValue::from_static(TRACEPARENT),
        );

        let cx = extract_from_headers(&inbound);
        assert!(cx.span().span_context().is_valid());

        let mut outbound = http::HeaderMap::new();
        inject_context(&cx, &mut HeaderInjector(&mut outbound));
        let value = outbound
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(value, TRACEPARENT);
    }

    #[test]
    fn test_inject_invalid_context_writes_nothing() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject_context(&Context::new(), &mut carrier);
        assert!(!carrier.contains_key("traceparent"));
    }
}
