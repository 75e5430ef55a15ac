//! The Response Relay: rewrites every literal occurrence of the upstream base URL to
//! the proxy's externally-visible base URL via a rolling byte-matcher (so a match split
//! across chunk boundaries is still found). `RollingRewriter` is fed incrementally: the
//! pipeline's streaming path (`Pipeline::relay_stream`, used whenever no post-processor
//! needs a parsed body) feeds it one upstream chunk at a time via `feed`/`finish`,
//! so a large Bundle or Binary response is never buffered whole. `rewrite_body` below
//! is the single-call convenience wrapper used by the buffered post-processor path
//! (`Pipeline::relay_response`), which also re-encodes as gzip when the client accepts
//! it; the streaming path does not gzip-encode (see its own doc comment).

use async_compression::tokio::write::GzipEncoder;
use tokio::io::AsyncWriteExt;

/// Headers copied verbatim from the upstream response to the client. `Content-Length`
/// and `Content-Encoding` are always recomputed by the relay itself, never copied.
const COPIED_HEADERS: &[&str] = &[
    "content-type",
    "etag",
    "last-modified",
    "location",
    "content-disposition",
    "cache-control",
];

pub fn copyable_headers(upstream_headers: &[(String, String)]) -> Vec<(String, String)> {
    upstream_headers
        .iter()
        .filter(|(name, _)| COPIED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

/// A streaming search-and-replace matcher for a single fixed needle, able to resume a
/// partial match across chunk boundaries.
pub struct RollingRewriter {
    from: Vec<u8>,
    to: Vec<u8>,
    pending: Vec<u8>,
}

impl RollingRewriter {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.as_bytes().to_vec(),
            to: to.as_bytes().to_vec(),
            pending: Vec::new(),
        }
    }

    /// Feeds one chunk, returning the portion of output that is now final (bytes that
    /// cannot still turn out to be a partial match of `from`).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::with_capacity(self.pending.len());

        loop {
            match find_subslice(&self.pending, &self.from) {
                Some(pos) => {
                    out.extend_from_slice(&self.pending[..pos]);
                    out.extend_from_slice(&self.to);
                    self.pending.drain(..pos + self.from.len());
                }
                None => break,
            }
        }

        // Keep back a suffix that could be the start of a split match.
        let keep = longest_prefix_overlap(&self.pending, &self.from);
        let flush_len = self.pending.len() - keep;
        out.extend_from_slice(&self.pending[..flush_len]);
        self.pending.drain(..flush_len);

        out
    }

    /// Flushes anything still held back (a partial match that never completed).
    pub fn finish(mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The length of the longest suffix of `buf` that is also a prefix of `needle` (and
/// therefore might grow into a full match once more bytes arrive).
fn longest_prefix_overlap(buf: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if buf[buf.len() - len..] == needle[..len] {
            return len;
        }
    }
    0
}

/// Rewrites every occurrence of `from` to `to` in `body`, fed through the rolling
/// matcher as a single chunk.
pub fn rewrite_body(body: &[u8], from: &str, to: &str) -> Vec<u8> {
    let mut rewriter = RollingRewriter::new(from, to);
    let mut out = rewriter.feed(body);
    out.extend(rewriter.finish());
    out
}

/// Re-encodes `body` as gzip if `accept_encoding` indicates the client accepts it.
/// Returns `(body, content_encoding)`.
pub async fn maybe_gzip(body: Vec<u8>, accept_encoding: Option<&str>) -> (Vec<u8>, Option<&'static str>) {
    let accepts_gzip = accept_encoding
        .map(|h| h.split(',').any(|enc| enc.trim().starts_with("gzip")))
        .unwrap_or(false);

    if !accepts_gzip {
        return (body, None);
    }

    let mut encoder = GzipEncoder::new(Vec::new());
    if encoder.write_all(&body).await.is_err() || encoder.shutdown().await.is_err() {
        return (body, None);
    }
    (encoder.into_inner(), Some("gzip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_single_occurrence() {
        let body = b"see https://upstream.example/Patient/1 for details";
        let out = rewrite_body(body, "https://upstream.example", "https://proxy.example");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "see https://proxy.example/Patient/1 for details"
        );
    }

    #[test]
    fn rewrites_multiple_occurrences() {
        let body = b"https://upstream.example/a https://upstream.example/b";
        let out = rewrite_body(body, "https://upstream.example", "https://proxy.example");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "https://proxy.example/a https://proxy.example/b"
        );
    }

    #[test]
    fn match_split_across_feed_calls_is_still_found() {
        let mut rewriter = RollingRewriter::new("https://upstream.example", "https://proxy.example");
        let mut out = rewriter.feed(b"prefix https://upstream.ex");
        out.extend(rewriter.feed(b"ample/Patient/1 suffix"));
        out.extend(rewriter.finish());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "prefix https://proxy.example/Patient/1 suffix"
        );
    }

    #[test]
    fn body_without_match_passes_through_unchanged() {
        let body = b"no match here";
        let out = rewrite_body(body, "https://upstream.example", "https://proxy.example");
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn gzip_is_skipped_without_accept_encoding() {
        let (body, encoding) = maybe_gzip(b"hello".to_vec(), None).await;
        assert_eq!(body, b"hello");
        assert!(encoding.is_none());
    }

    #[tokio::test]
    async fn gzip_is_applied_when_accepted() {
        let (body, encoding) = maybe_gzip(b"hello world".to_vec(), Some("gzip, deflate")).await;
        assert_eq!(encoding, Some("gzip"));
        assert_ne!(body, b"hello world");
    }
}
