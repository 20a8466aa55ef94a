use fastrace::collector::SpanContext;
use fastrace::Span;

use crate::common::ContextPropagationHeader;

/// Extracts the parent span context from the `traceparent` header, if any.
/// Header names are matched case-insensitively and the first decodable value wins.
pub fn span_context_from_headers<'a, I, V>(headers: I) -> Option<SpanContext>
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: IntoIterator<Item = &'a str>,
{
    headers
        .into_iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case(ContextPropagationHeader::TRACEPARENT))
        .flat_map(|(_, values)| values)
        .find_map(SpanContext::decode_w3c_traceparent)
}

/// Creates a root span chained to the given parent, or a no-op span when there is no parent.
pub fn root_span_with_parent(name: &'static str, parent: Option<SpanContext>) -> Span {
    match parent {
        Some(parent) => Span::root(name, parent),
        None => Span::noop(),
    }
}
