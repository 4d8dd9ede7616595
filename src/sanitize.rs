// Output sanitization for the client-bound copy of response text.
//
// History keeps the raw model output; only the bytes written to the
// client socket pass through a sanitizer.

/// Filters response text before it is written to a client.
///
/// Implementations must be pure: same input, same output, no I/O.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

/// Keeps printable ASCII plus `\n`, `\r` and `\t`, drops everything
/// else. The clients this relay serves render on code pages that
/// predate UTF-8, so multi-byte and control characters turn into
/// garbage on their end.
pub struct LegacyCharsetFilter;

impl Sanitizer for LegacyCharsetFilter {
    fn sanitize(&self, text: &str) -> String {
        text.chars()
            .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (' '..='~').contains(&c))
            .collect()
    }
}
