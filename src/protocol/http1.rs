use std::io::{self, Read};

use memchr::memmem;

/// Minimal HTTP/1.1 support for the demo worker: collect a request head,
/// pull the request line out of it, and render a close-delimited response.

// ============================================================================
// Request Head Buffer
// ============================================================================

/// Fixed-capacity buffer that fills until the blank line ending the head.
pub struct HeadBuf {
    buf: Vec<u8>,
    end: usize,
}

impl HeadBuf {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            end: 0,
        }
    }

    /// Read from `src` until the head is complete. Returns the head length
    /// including the final CRLF, or `None` if the peer closed first.
    pub fn fill_from(&mut self, src: &mut impl Read) -> io::Result<Option<usize>> {
        loop {
            if let Some(end) = self.find_head_end() {
                return Ok(Some(end));
            }
            if self.end == self.buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            let n = src.read(&mut self.buf[self.end..])?;
            if n == 0 {
                return Ok(None);
            }
            self.end += n;
        }
    }

    /// Search for \r\n\r\n in what has been read so far
    pub fn find_head_end(&self) -> Option<usize> {
        memmem::find(self.window(), b"\r\n\r\n").map(|pos| pos + 4)
    }

    pub fn window(&self) -> &[u8] {
        &self.buf[..self.end]
    }
}

// ============================================================================
// Request Line
// ============================================================================

/// Request line fields (zero-copy - references the input buffer)
#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a [u8],
    pub path: &'a [u8],
    pub version: &'a [u8],
}

/// Parse the request line at the start of `head`.
///
/// Returns Err("Incomplete message") if the line has not fully arrived.
pub fn parse_request_line(head: &[u8]) -> Result<RequestLine<'_>, &'static str> {
    let Some(line_end) = memmem::find(head, b"\r\n") else {
        return Err("Incomplete message");
    };
    let mut fields = head[..line_end].split(|&b| b == b' ');
    let method = fields.next().ok_or("Bad request line")?;
    let path = fields.next().ok_or("Bad request line")?;
    let version = fields.next().ok_or("Bad request line")?;

    if method.is_empty() || path.is_empty() || fields.next().is_some() {
        return Err("Bad request line");
    }
    if !version.starts_with(b"HTTP/1.") || version.len() != 8 {
        return Err("Unsupported version");
    }
    Ok(RequestLine {
        method,
        path,
        version,
    })
}

// ============================================================================
// Responses
// ============================================================================

pub fn render_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}
