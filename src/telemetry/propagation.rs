//! W3C trace context in envelope headers.

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context};
use tracing_opentelemetry::OpenTelemetrySpanExt;

struct HeaderInjector<'a>(&'a mut BTreeMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a BTreeMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Serialize `cx` with the global propagator.
pub fn inject(cx: &Context) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(&mut headers));
    });
    headers
}

/// Headers for the current tracing span. Empty when tracing is off.
pub fn inject_current() -> BTreeMap<String, String> {
    inject(&tracing::Span::current().context())
}

pub fn extract(headers: &BTreeMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Make `span` a child of the context carried in `headers`, if any.
pub fn set_parent(span: &tracing::Span, headers: &BTreeMap<String, String>) {
    if headers.is_empty() {
        return;
    }
    span.set_parent(extract(headers));
}
