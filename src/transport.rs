//! Scoped exclusive access to one contactless card.
//!
//! The PC/SC reader driver itself is an external collaborator;
//! this module owns only the APDU exchange contract and the automatic
//! chunking used for long unauthenticated writes. [`CardTransport`] is
//! the trait the rest of the crate programs against; [`PcscTransport`]
//! is the real implementation over the `pcsc` crate, and
//! [`mock::MockTransport`] (test-only) lets the provisioning state
//! machine be exercised without hardware.

use std::time::{Duration, Instant};

use crate::apdu;
use crate::error::{Error, Result, StatusWord};

/// Default per-APDU timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Threshold above which `ISOUpdateBinary` auto-chunks.
pub const CHUNK_SIZE: usize = 52;

/// Exclusive access to one contactless card for the duration of the
/// borrow. `exchange` is the only operation; there is no retry — a
/// failure here is final for the current session.
pub trait CardTransport {
    fn exchange(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, StatusWord)>;
}

/// Issue one `00 D6` (`ISOUpdateBinary`) APDU per 52-byte slice of
/// `data`, with advancing offsets, returning once every slice has
/// returned `9000`. Transparent to the caller, which passes the full
/// payload and never sees the slicing.
pub fn iso_update_binary_chunked(
    transport: &mut dyn CardTransport,
    offset: u16,
    data: &[u8],
) -> Result<()> {
    for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
        let chunk_offset = offset + (i * CHUNK_SIZE) as u16;
        let [p1, p2] = chunk_offset.to_be_bytes();
        let cmd = apdu::build(apdu::CLA_ISO, 0xD6, p1, p2, chunk, None);
        let (_, sw) = transport.exchange(&cmd)?;
        if apdu::classify(sw) != apdu::Outcome::Success {
            return Err(Error::from_status_word("ISOUpdateBinary", sw));
        }
    }
    Ok(())
}

/// A live PC/SC connection to one card, released on drop.
pub struct PcscTransport {
    card: pcsc::Card,
    timeout: Duration,
}

impl PcscTransport {
    /// Connect exclusively to `reader_name` on `ctx`. The connection (and
    /// the reader's exclusive lock) is released when the returned value
    /// is dropped, on every exit path including `?`-propagated errors.
    pub fn connect(ctx: &pcsc::Context, reader_name: &std::ffi::CStr) -> Result<Self> {
        let card = ctx
            .connect(reader_name, pcsc::ShareMode::Exclusive, pcsc::Protocols::ANY)
            .map_err(|e| Error::TransportError(format!("connect failed: {e}")))?;
        Ok(Self {
            card,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CardTransport for PcscTransport {
    fn exchange(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, StatusWord)> {
        let started = Instant::now();
        let mut recv_buffer = vec![0u8; pcsc::MAX_BUFFER_SIZE];
        let response = self
            .card
            .transmit(apdu, &mut recv_buffer)
            .map_err(|e| Error::TransportError(format!("transmit failed: {e}")))?;
        if started.elapsed() > self.timeout {
            return Err(Error::TransportError(format!(
                "APDU exchange exceeded {:?} timeout",
                self.timeout
            )));
        }
        apdu::parse_response(response)
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        // Disconnect with Leave: do not reset or power down the field,
        // other applications may still want the card selected.
        let _ = self.card.disconnect(pcsc::Disposition::LeaveCard);
    }
}

/// In-memory transport driven by a scripted APDU -> response table, used
/// to exercise the provisioning state machine without hardware.
#[cfg(any(test, feature = "mock-transport"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Each step asserts the next `exchange` call's APDU equals `expect`
    /// (when `Some`) and returns `respond`.
    pub struct Step {
        pub expect: Option<Vec<u8>>,
        pub respond: Result<(Vec<u8>, StatusWord)>,
    }

    #[derive(Default)]
    pub struct MockTransport {
        steps: VecDeque<Step>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, expect: Option<Vec<u8>>, respond: Result<(Vec<u8>, StatusWord)>) {
            self.steps.push_back(Step { expect, respond });
        }

        pub fn push_ok(&mut self, body: Vec<u8>, sw: StatusWord) {
            self.push(None, Ok((body, sw)));
        }

        pub fn is_empty(&self) -> bool {
            self.steps.is_empty()
        }
    }

    impl CardTransport for MockTransport {
        fn exchange(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, StatusWord)> {
            let step = self
                .steps
                .pop_front()
                .unwrap_or_else(|| panic!("MockTransport: unexpected exchange, apdu={apdu:02X?}"));
            if let Some(expect) = &step.expect {
                assert_eq!(expect.as_slice(), apdu, "unexpected APDU");
            }
            step.respond
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_chunking_boundaries_182_bytes() {
        let mut t = MockTransport::new();
        for len in [52, 52, 52, 26] {
            t.push(None, Ok((vec![], 0x9000)));
            let _ = len;
        }
        let data = vec![0xAAu8; 182];
        iso_update_binary_chunked(&mut t, 0, &data).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn test_chunking_offsets() {
        let mut t = MockTransport::new();
        t.push(
            Some(apdu::build(apdu::CLA_ISO, 0xD6, 0x00, 0x00, &[0xAA; 52], None)),
            Ok((vec![], 0x9000)),
        );
        t.push(
            Some(apdu::build(apdu::CLA_ISO, 0xD6, 0x00, 52, &[0xAA; 52], None)),
            Ok((vec![], 0x9000)),
        );
        t.push(
            Some(apdu::build(apdu::CLA_ISO, 0xD6, 0x00, 104, &[0xAA; 52], None)),
            Ok((vec![], 0x9000)),
        );
        t.push(
            Some(apdu::build(apdu::CLA_ISO, 0xD6, 0x00, 156, &[0xAA; 26], None)),
            Ok((vec![], 0x9000)),
        );
        iso_update_binary_chunked(&mut t, 0, &vec![0xAAu8; 182]).unwrap();
        assert!(t.is_empty());
    }
}
