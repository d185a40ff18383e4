//! Response body sources beyond an in-memory buffer.
//!
//! [`Response::body`](crate::Response::body)/[`body_with`
//! ](crate::Response::body_with) cover the common case of a body that's
//! already fully materialized. [`Body`] adds two more sources for the cases
//! where copying the payload into the response buffer first would be
//! wasteful: a file descriptor range, and a pull-style callback.

use std::io;
use tokio::fs::File;

/// Result of one invocation of a [`Body::Callback`] producer.
pub enum CallbackResult {
    /// More data was written into the provided buffer; call again for more.
    More,
    /// No more data remains; the buffer holds the final (possibly empty)
    /// chunk.
    Done,
    /// The producer failed; abort the response and close the connection.
    Err(io::Error),
}

type Producer = Box<dyn FnMut(&mut Vec<u8>) -> CallbackResult + Send>;

/// A deferred response body source, sent after the headers are flushed.
pub enum Body {
    /// A byte range of an already-open file, read directly into the socket
    /// without passing through the response buffer.
    Fd {
        file: File,
        offset: u64,
        length: u64,
    },
    /// A pull producer invoked repeatedly until it reports [`CallbackResult::Done`].
    ///
    /// When `total_length` is known up front, the response carries a plain
    /// `content-length` header and the callback's output is written as-is.
    /// When it's `None`, the producer's size isn't known in advance: on
    /// HTTP/1.1 the response is framed with `transfer-encoding: chunked`
    /// (each invocation's output becomes one wire chunk); on HTTP/1.0, where
    /// chunked encoding doesn't exist, the connection is closed once the
    /// producer reports [`CallbackResult::Done`] and that close is the
    /// client's only length signal.
    Callback {
        producer: Producer,
        block_size: usize,
        total_length: Option<u64>,
    },
}

impl Body {
    /// Builds a file-backed body for the byte range `[offset, offset+length)`.
    pub fn from_file(file: File, offset: u64, length: u64) -> Self {
        Body::Fd {
            file,
            offset,
            length,
        }
    }

    /// Builds a callback-backed body of exactly `total_length` bytes.
    ///
    /// `producer` is called with a scratch buffer of capacity `block_size`;
    /// it should extend the buffer with the next chunk and return
    /// [`CallbackResult::More`], or return [`CallbackResult::Done`] once
    /// nothing more remains.
    pub fn from_callback<F>(producer: F, block_size: usize, total_length: u64) -> Self
    where
        F: FnMut(&mut Vec<u8>) -> CallbackResult + Send + 'static,
    {
        Body::Callback {
            producer: Box::new(producer),
            block_size,
            total_length: Some(total_length),
        }
    }

    /// Builds a callback-backed body whose length isn't known until the
    /// producer finishes. See [`Body::Callback`] for how this is framed on
    /// the wire.
    pub fn from_callback_unsized<F>(producer: F, block_size: usize) -> Self
    where
        F: FnMut(&mut Vec<u8>) -> CallbackResult + Send + 'static,
    {
        Body::Callback {
            producer: Box::new(producer),
            block_size,
            total_length: None,
        }
    }

    pub(crate) fn declared_length(&self) -> Option<u64> {
        match self {
            Body::Fd { length, .. } => Some(*length),
            Body::Callback { total_length, .. } => *total_length,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Fd { offset, length, .. } => f
                .debug_struct("Body::Fd")
                .field("offset", offset)
                .field("length", length)
                .finish(),
            Body::Callback {
                block_size,
                total_length,
                ..
            } => f
                .debug_struct("Body::Callback")
                .field("block_size", block_size)
                .field("total_length", total_length)
                .finish(),
        }
    }
}
