//! Wire protocol types and codec.
//!
//! Protocol: newline-delimited JSON (ndjson) over Unix socket.
//!
//! Each line is one complete envelope, a tagged union distinguished by which
//! field is populated:
//!
//! `{"event": {"kind": "state_changed", "scope": 3, "timestamp": "...", "sequence": 7}}`
//! `{"subscribe": {"scope": 3}}`
//! `{"ping": true}`
//! `{"pong": true}`

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::ProtocolError;

// =============================================================================
// Scope
// =============================================================================

/// Identifier of the subset of data a notification covers.
///
/// `0` is reserved to mean "all scopes": a subscriber with scope 0 receives
/// every event, and an event published with scope 0 reaches every subscriber.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Scope(pub u64);

impl Scope {
    /// The wildcard scope.
    pub const ALL: Scope = Scope(0);

    pub fn is_all(self) -> bool {
        self.0 == 0
    }

    /// Whether a subscriber with this scope should see `event_scope`.
    pub fn matches(self, event_scope: Scope) -> bool {
        self.is_all() || event_scope.is_all() || self == event_scope
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Scope {
    fn from(raw: u64) -> Self {
        Scope(raw)
    }
}

// =============================================================================
// Event
// =============================================================================

/// The kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Persistent state changed; subscribers should reload their view.
    StateChanged,
}

/// A change notification.
///
/// Deliberately coarse: it says *that* something changed within a scope,
/// never *what*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub scope: Scope,
    /// Wall-clock creation time (RFC 3339), diagnostics only.
    pub timestamp: String,
    /// Per-process counter, diagnostics only. Not globally unique and not a
    /// basis for ordering.
    pub sequence: u64,
}

impl Event {
    pub fn state_changed(scope: Scope, sequence: u64) -> Self {
        Self {
            kind: EventKind::StateChanged,
            scope,
            timestamp: now_rfc3339(),
            sequence,
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

// =============================================================================
// Envelope
// =============================================================================

/// Declares or changes a connection's interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub scope: Scope,
}

/// The only thing that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    #[serde(rename = "event")]
    Event(Event),
    #[serde(rename = "subscribe")]
    Subscribe(Subscribe),
    #[serde(rename = "ping")]
    Ping(bool),
    #[serde(rename = "pong")]
    Pong(bool),
}

impl Envelope {
    pub fn ping() -> Self {
        Envelope::Ping(true)
    }

    pub fn pong() -> Self {
        Envelope::Pong(true)
    }

    pub fn subscribe(scope: Scope) -> Self {
        Envelope::Subscribe(Subscribe { scope })
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encode an envelope to bytes, newline-terminated.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode an envelope from a line.
pub fn decode_envelope(line: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(line)?)
}

/// Read envelopes from a stream until EOF or error.
///
/// Empty lines are skipped; a malformed line yields an `Err` item and the
/// iterator continues, so one bad document never kills the connection.
pub fn read_envelopes<R: Read>(stream: R) -> impl Iterator<Item = Result<Envelope, ProtocolError>> {
    let reader = BufReader::new(stream);
    reader.lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(decode_envelope(&line)),
        Err(e) => Some(Err(ProtocolError::Io(e))),
    })
}

/// Write one envelope under a write deadline.
///
/// The deadline is cleared again before returning, on success and failure
/// both: a timeout left behind on the stream would make the next unrelated
/// write fail spuriously.
pub fn write_envelope(
    stream: &mut UnixStream,
    envelope: &Envelope,
    deadline: Duration,
) -> Result<(), ProtocolError> {
    let bytes = encode_envelope(envelope)?;
    stream.set_write_timeout(Some(deadline))?;
    let result = stream
        .write_all(&bytes)
        .and_then(|()| stream.flush())
        .map_err(ProtocolError::Io);
    let cleared = stream.set_write_timeout(None).map_err(ProtocolError::Io);
    result.and(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let event = Event::state_changed(Scope(3), 7);
        let envelope = Envelope::Event(event.clone());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"event\""));
        assert!(json.contains("\"state_changed\""));
        let parsed = decode_envelope(&json).unwrap();
        assert_eq!(parsed, Envelope::Event(event));
    }

    #[test]
    fn ping_pong_shapes() {
        assert_eq!(
            serde_json::to_string(&Envelope::ping()).unwrap(),
            r#"{"ping":true}"#
        );
        assert_eq!(
            decode_envelope(r#"{"pong":true}"#).unwrap(),
            Envelope::pong()
        );
    }

    #[test]
    fn subscribe_shape() {
        let parsed = decode_envelope(r#"{"subscribe":{"scope":5}}"#).unwrap();
        assert_eq!(parsed, Envelope::subscribe(Scope(5)));
    }

    #[test]
    fn malformed_document_is_an_error_not_a_panic() {
        assert!(decode_envelope("{not json").is_err());
        assert!(decode_envelope(r#"{"frobnicate":true}"#).is_err());
    }

    #[test]
    fn stream_of_documents_without_length_prefix() {
        let input = concat!(
            r#"{"subscribe":{"scope":1}}"#,
            "\n",
            "\n",
            r#"{"ping":true}"#,
            "\n",
            "{broken\n",
            r#"{"pong":true}"#,
            "\n",
        );
        let items: Vec<_> = read_envelopes(input.as_bytes()).collect();
        assert_eq!(items.len(), 4);
        assert_eq!(
            *items[0].as_ref().unwrap(),
            Envelope::subscribe(Scope(1))
        );
        assert_eq!(*items[1].as_ref().unwrap(), Envelope::ping());
        assert!(items[2].is_err());
        assert_eq!(*items[3].as_ref().unwrap(), Envelope::pong());
    }

    #[test]
    fn scope_matching() {
        assert!(Scope::ALL.matches(Scope(4)));
        assert!(Scope(4).matches(Scope::ALL));
        assert!(Scope(4).matches(Scope(4)));
        assert!(!Scope(4).matches(Scope(5)));
    }

    #[test]
    fn write_deadline_cleared_after_success_and_failure() {
        let (mut a, b) = UnixStream::pair().unwrap();

        write_envelope(&mut a, &Envelope::ping(), Duration::from_millis(100)).unwrap();
        assert_eq!(a.write_timeout().unwrap(), None);

        // Closing the peer makes the next write fail; the deadline must still
        // be cleared afterwards.
        drop(b);
        let _ = write_envelope(&mut a, &Envelope::ping(), Duration::from_millis(100));
        let _ = write_envelope(&mut a, &Envelope::ping(), Duration::from_millis(100));
        assert_eq!(a.write_timeout().unwrap(), None);
    }
}
