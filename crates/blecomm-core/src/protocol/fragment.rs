//! Wire fragment codec and the application message unit.
//!
//! Every attribute-sized unit on the wire is a fragment:
//!
//! ```text
//! [id: 4 symbols][seq: 3 symbols][kind: 1 symbol][payload...]
//! ```
//!
//! `id` identifies the whole message, `seq` orders fragments within it, and
//! `kind` marks whether more fragments follow. Acknowledgements carry just the
//! 7 byte id+seq prefix back to the sender.

use serde::{Deserialize, Serialize};

use crate::errors::FragmentError;
use crate::protocol::sequence::{symbol_rank, MessageId, SeqNumber};
use crate::types::Peer;

/// Width of the message id prefix.
pub const ID_LEN: usize = 4;
/// Width of the sequence number field.
pub const SEQ_LEN: usize = 3;
/// Width of the kind field.
pub const KIND_LEN: usize = 1;
/// Total fragment header width.
pub const HEADER_LEN: usize = ID_LEN + SEQ_LEN + KIND_LEN;

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

/// Whether a fragment closes its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    NonFinal,
    Final,
}

impl FragmentKind {
    pub fn symbol(self) -> u8 {
        match self {
            FragmentKind::NonFinal => b'1',
            FragmentKind::Final => b'2',
        }
    }

    pub fn from_symbol(symbol: u8) -> Result<Self, FragmentError> {
        match symbol {
            b'1' => Ok(FragmentKind::NonFinal),
            b'2' => Ok(FragmentKind::Final),
            other => Err(FragmentError::UnknownKind(other)),
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, FragmentKind::Final)
    }
}

/// One attribute-sized unit of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: MessageId,
    pub seq: SeqNumber,
    pub kind: FragmentKind,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn new(id: MessageId, seq: SeqNumber, kind: FragmentKind, payload: Vec<u8>) -> Self {
        Self { id, seq, kind, payload }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.id.to_symbols());
        out.extend_from_slice(&self.seq.to_symbols());
        out.push(self.kind.symbol());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse from wire bytes. The payload must be non-empty.
    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() <= HEADER_LEN {
            return Err(FragmentError::TooShort(bytes.len()));
        }
        let id = MessageId::from_symbols(&bytes[..ID_LEN])?;
        let seq = SeqNumber::from_symbols(&bytes[ID_LEN..ID_LEN + SEQ_LEN])?;
        let kind = FragmentKind::from_symbol(bytes[ID_LEN + SEQ_LEN])?;
        Ok(Self {
            id,
            seq,
            kind,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// The acknowledgement token identifying this fragment.
    pub fn ack_token(&self) -> AckToken {
        AckToken { id: self.id, seq: self.seq }
    }
}

/// Split a message payload into fragments of at most `max_payload` bytes.
///
/// Sequence numbers ascend from zero; the last fragment is marked final.
pub fn split_payload(
    id: MessageId,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<Fragment>, FragmentError> {
    if payload.is_empty() {
        return Err(FragmentError::EmptyPayload);
    }
    if max_payload == 0 {
        return Err(FragmentError::Malformed("zero fragment size".into()));
    }
    let mut fragments = Vec::with_capacity(payload.len().div_ceil(max_payload));
    let mut seq = SeqNumber::zero();
    let mut chunks = payload.chunks(max_payload).peekable();
    while let Some(chunk) = chunks.next() {
        let kind = if chunks.peek().is_some() {
            FragmentKind::NonFinal
        } else {
            FragmentKind::Final
        };
        fragments.push(Fragment::new(id, seq, kind, chunk.to_vec()));
        seq.increment();
    }
    Ok(fragments)
}

// ----------------------------------------------------------------------------
// Acknowledgement Token
// ----------------------------------------------------------------------------

/// The id+seq prefix a receiver echoes back to acknowledge a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckToken {
    pub id: MessageId,
    pub seq: SeqNumber,
}

impl AckToken {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ID_LEN + SEQ_LEN);
        out.extend_from_slice(&self.id.to_symbols());
        out.extend_from_slice(&self.seq.to_symbols());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < ID_LEN + SEQ_LEN {
            return Err(FragmentError::TooShort(bytes.len()));
        }
        Ok(Self {
            id: MessageId::from_symbols(&bytes[..ID_LEN])?,
            seq: SeqNumber::from_symbols(&bytes[ID_LEN..ID_LEN + SEQ_LEN])?,
        })
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// The application-level unit of exchange.
///
/// The one-symbol header lets applications multiplex message types over a
/// single pipe. On the wire the header byte is prepended to the payload
/// before fragmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Option<Peer>,
    pub receiver: Option<Peer>,
    pub header: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(header: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender: None,
            receiver: None,
            header,
            payload: payload.into(),
        }
    }

    pub fn text(header: u8, text: &str) -> Self {
        Self::new(header, text.as_bytes().to_vec())
    }

    /// Address this message to a single peer instead of every connected one.
    pub fn with_receiver(mut self, receiver: Peer) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Payload as it travels on the wire: header symbol then body.
    pub fn wire_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Rebuild a message from a reassembled wire payload.
    pub fn from_wire(sender: Peer, bytes: &[u8]) -> Result<Self, FragmentError> {
        let (&header, payload) = bytes
            .split_first()
            .ok_or(FragmentError::EmptyPayload)?;
        symbol_rank(header).map_err(|_| {
            FragmentError::Malformed(format!("invalid header symbol {header:#04x}"))
        })?;
        Ok(Self {
            sender: Some(sender),
            receiver: None,
            header,
            payload: payload.to_vec(),
        })
    }

    /// Payload interpreted as UTF-8 text.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_wire_layout() {
        let frag = Fragment::new(
            MessageId::zero(),
            SeqNumber::zero().next(),
            FragmentKind::Final,
            b"hello".to_vec(),
        );
        let bytes = frag.encode();
        assert_eq!(&bytes[..4], b"    ");
        assert_eq!(&bytes[4..7], b"  !");
        assert_eq!(bytes[7], b'2');
        assert_eq!(&bytes[8..], b"hello");

        let decoded = Fragment::decode(&bytes).unwrap();
        assert_eq!(decoded, frag);
    }

    #[test]
    fn decode_rejects_short_and_malformed_input() {
        assert_eq!(
            Fragment::decode(b"       2"),
            Err(FragmentError::TooShort(8))
        );
        let mut bytes = Fragment::new(
            MessageId::zero(),
            SeqNumber::zero(),
            FragmentKind::Final,
            b"x".to_vec(),
        )
        .encode();
        bytes[7] = b'9';
        assert_eq!(Fragment::decode(&bytes), Err(FragmentError::UnknownKind(b'9')));
    }

    #[test]
    fn split_marks_only_last_fragment_final() {
        let payload = vec![0xAB; 10];
        let frags = split_payload(MessageId::zero(), &payload, 4).unwrap();
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].kind, FragmentKind::NonFinal);
        assert_eq!(frags[1].kind, FragmentKind::NonFinal);
        assert_eq!(frags[2].kind, FragmentKind::Final);
        assert_eq!(frags[2].payload.len(), 2);
        assert!(frags[0].seq < frags[1].seq);
        assert!(frags[1].seq < frags[2].seq);
    }

    #[test]
    fn split_rejects_empty_payload() {
        assert_eq!(
            split_payload(MessageId::zero(), &[], 4),
            Err(FragmentError::EmptyPayload)
        );
    }

    #[test]
    fn ack_token_round_trip() {
        let frag = Fragment::new(
            MessageId::zero().next(),
            SeqNumber::zero().next(),
            FragmentKind::NonFinal,
            b"x".to_vec(),
        );
        let token = frag.ack_token();
        assert_eq!(AckToken::decode(&token.encode()).unwrap(), token);
    }

    #[test]
    fn message_wire_round_trip_strips_header() {
        let msg = Message::text(b'c', "ciao");
        let wire = msg.wire_payload();
        assert_eq!(wire[0], b'c');
        let rebuilt = Message::from_wire(Peer::new("aliceXY", None), &wire).unwrap();
        assert_eq!(rebuilt.header, b'c');
        assert_eq!(rebuilt.payload_text(), "ciao");
    }

    #[test]
    fn message_from_empty_wire_payload_is_malformed() {
        assert_eq!(
            Message::from_wire(Peer::new("aliceXY", None), &[]),
            Err(FragmentError::EmptyPayload)
        );
    }
}
