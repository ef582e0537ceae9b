//! Message processing for the runtime.
//!
//! Provides synchronous message handling that works with raw byte buffers
//! and is shared by inline and pooled dispatch.

use crate::config::ProtocolType;
use crate::protocols::reverse::reverse_words;
use crate::protocols::sentinel::is_end_of_message;
use crate::protocols::transmogrify::transmogrify;
use bytes::BytesMut;

/// Protocol type for message processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Transmogrify,
    Reverse,
}

impl From<ProtocolType> for Protocol {
    fn from(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Transmogrify => Protocol::Transmogrify,
            ProtocolType::Reverse => Protocol::Reverse,
        }
    }
}

/// Result of processing one message.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Reply written to the output buffer.
    Response { response_len: usize },
    /// Client sent the end-of-session sentinel.
    Quit,
}

impl Protocol {
    /// Process a single message.
    ///
    /// The reply is appended to `output`. Sentinel messages produce no reply.
    pub fn process(self, input: &[u8], output: &mut BytesMut) -> ProcessResult {
        if is_end_of_message(input) {
            return ProcessResult::Quit;
        }

        let start = output.len();
        match self {
            Protocol::Transmogrify => transmogrify(input, output),
            Protocol::Reverse => {
                let reversed = reverse_words(&String::from_utf8_lossy(input));
                output.extend_from_slice(reversed.as_bytes());
            }
        }

        ProcessResult::Response {
            response_len: output.len() - start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_reverse() {
        let mut out = BytesMut::new();
        let result = Protocol::Reverse.process(b"Hi This is Sumit", &mut out);
        assert_eq!(result, ProcessResult::Response { response_len: 16 });
        assert_eq!(&out[..], b"iH sihT si timuS");
    }

    #[test]
    fn test_process_transmogrify() {
        let mut out = BytesMut::new();
        let result = Protocol::Transmogrify.process(b"A5", &mut out);
        assert_eq!(result, ProcessResult::Response { response_len: 2 });
        assert_eq!(&out[..], b"a5");
    }

    #[test]
    fn test_sentinel_produces_no_reply() {
        for protocol in [Protocol::Reverse, Protocol::Transmogrify] {
            let mut out = BytesMut::new();
            assert_eq!(protocol.process(b" EOM\n", &mut out), ProcessResult::Quit);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn test_reverse_of_separators_is_empty() {
        let mut out = BytesMut::new();
        let result = Protocol::Reverse.process(b"\r\n", &mut out);
        assert_eq!(result, ProcessResult::Response { response_len: 0 });
    }

    #[test]
    fn test_protocol_from_config() {
        assert_eq!(Protocol::from(ProtocolType::Reverse), Protocol::Reverse);
        assert_eq!(
            Protocol::from(ProtocolType::Transmogrify),
            Protocol::Transmogrify
        );
    }
}
