use crate::transport::RelayLink;
use hub_common::envelope::{self, Envelope};
use hub_common::PeerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Encode and queue one envelope from `source`.
pub(crate) fn send_envelope<L, P>(
    link: &L,
    message_type: &str,
    source: &PeerId,
    target: PeerId,
    payload: P,
) -> bool
where
    L: RelayLink + ?Sized,
    P: Serialize,
{
    match envelope::encode(message_type, source.clone(), target, payload) {
        Ok(text) => {
            let queued = link.send_text(text);
            if !queued {
                debug!(message_type, "relay link down, frame dropped");
            }
            queued
        }
        Err(e) => {
            warn!(error = %e, message_type, "failed to encode envelope");
            false
        }
    }
}

/// Second decode stage; malformed payloads are logged and skipped.
pub(crate) fn decode_payload<P: DeserializeOwned>(text: &str) -> Option<Envelope<P>> {
    match envelope::decode::<P>(text) {
        Ok(env) => Some(env),
        Err(e) => {
            debug!(error = %e, "ignoring undecodable payload");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::transport::RelayLink;
    use hub_common::envelope::{self, EnvelopeHeader};
    use serde::de::DeserializeOwned;
    use std::sync::Mutex;

    /// Link double that records every frame and the last dialed URL.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingLink {
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) dialed: Mutex<Vec<String>>,
        pub(crate) closed: Mutex<usize>,
        pub(crate) offline: bool,
    }

    impl RelayLink for RecordingLink {
        fn connect(&self, url: &str) {
            self.dialed.lock().unwrap().push(url.to_string());
        }

        fn send_text(&self, text: String) -> bool {
            if self.offline {
                return false;
            }
            self.sent.lock().unwrap().push(text);
            true
        }

        fn close(&self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    impl RecordingLink {
        pub(crate) fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        pub(crate) fn take_headers(&self) -> Vec<EnvelopeHeader> {
            self.take()
                .iter()
                .map(|t| envelope::decode_header(t).unwrap())
                .collect()
        }

        /// Drain recorded frames and decode the single one of `message_type`.
        pub(crate) fn take_one<P: DeserializeOwned>(
            &self,
            message_type: &str,
        ) -> envelope::Envelope<P> {
            let frames = self.take();
            let matching: Vec<&String> = frames
                .iter()
                .filter(|t| envelope::decode_header(t).unwrap().message_type == message_type)
                .collect();
            assert_eq!(matching.len(), 1, "expected one {message_type} in {frames:?}");
            envelope::decode(matching[0]).unwrap()
        }
    }
}
