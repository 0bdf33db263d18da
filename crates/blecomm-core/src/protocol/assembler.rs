//! Inbound fragment reassembly with duplicate suppression.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::protocol::fragment::Fragment;
use crate::protocol::sequence::{MessageId, SeqNumber};

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// Outcome of feeding one fragment to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Fragment absorbed, message not yet complete.
    Incomplete,
    /// Final fragment arrived: the full wire payload of the message.
    Complete(Vec<u8>),
    /// Fragment of a message that already completed. The caller still
    /// acknowledges it so the sender stops retrying.
    Duplicate,
    /// Out-of-order or replayed fragment of an in-progress message; ignored.
    Stale,
}

#[derive(Debug)]
struct Partial {
    seq: SeqNumber,
    payload: Vec<u8>,
}

/// Reassembles the fragments of one peer's pipe back into messages.
///
/// Fragments merge only when their sequence number is strictly greater than
/// the partial's current one, so retransmissions of an already absorbed
/// fragment are dropped without corrupting the payload. Completed message ids
/// are remembered for the lifetime of the channel.
#[derive(Debug, Default)]
pub struct Reassembler {
    partials: HashMap<MessageId, Partial>,
    completed: HashSet<MessageId>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, fragment: Fragment) -> Reassembly {
        if self.completed.contains(&fragment.id) {
            trace!(id = %fragment.id, "duplicate fragment for completed message");
            return Reassembly::Duplicate;
        }

        match self.partials.get_mut(&fragment.id) {
            None => {
                if fragment.kind.is_final() {
                    self.completed.insert(fragment.id);
                    return Reassembly::Complete(fragment.payload);
                }
                self.partials.insert(
                    fragment.id,
                    Partial { seq: fragment.seq, payload: fragment.payload },
                );
                Reassembly::Incomplete
            }
            Some(partial) => {
                if fragment.seq <= partial.seq {
                    trace!(id = %fragment.id, seq = %fragment.seq, "stale fragment");
                    return Reassembly::Stale;
                }
                partial.seq = fragment.seq;
                partial.payload.extend_from_slice(&fragment.payload);
                if fragment.kind.is_final() {
                    if let Some(done) = self.partials.remove(&fragment.id) {
                        self.completed.insert(fragment.id);
                        return Reassembly::Complete(done.payload);
                    }
                }
                Reassembly::Incomplete
            }
        }
    }

    /// Drop all partial and completed state, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.partials.clear();
        self.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment::split_payload;

    fn fragments(id: MessageId, payload: &[u8], max: usize) -> Vec<Fragment> {
        split_payload(id, payload, max).unwrap()
    }

    #[test]
    fn reassembles_in_order_fragments() {
        let mut asm = Reassembler::new();
        let payload = b"the quick brown fox".to_vec();
        let frags = fragments(MessageId::zero(), &payload, 5);

        let mut result = Reassembly::Incomplete;
        for frag in frags {
            result = asm.accept(frag);
        }
        assert_eq!(result, Reassembly::Complete(payload));
    }

    #[test]
    fn single_final_fragment_completes_immediately() {
        let mut asm = Reassembler::new();
        let frags = fragments(MessageId::zero(), b"tiny", 100);
        assert_eq!(frags.len(), 1);
        assert_eq!(
            asm.accept(frags.into_iter().next().unwrap()),
            Reassembly::Complete(b"tiny".to_vec())
        );
    }

    #[test]
    fn retransmitted_fragment_is_stale_not_duplicated_into_payload() {
        let mut asm = Reassembler::new();
        let frags = fragments(MessageId::zero(), b"aabbcc", 2);

        assert_eq!(asm.accept(frags[0].clone()), Reassembly::Incomplete);
        assert_eq!(asm.accept(frags[0].clone()), Reassembly::Stale);
        assert_eq!(asm.accept(frags[1].clone()), Reassembly::Incomplete);
        assert_eq!(
            asm.accept(frags[2].clone()),
            Reassembly::Complete(b"aabbcc".to_vec())
        );
    }

    #[test]
    fn completed_message_reports_duplicates() {
        let mut asm = Reassembler::new();
        let frags = fragments(MessageId::zero(), b"done", 100);
        assert_eq!(
            asm.accept(frags[0].clone()),
            Reassembly::Complete(b"done".to_vec())
        );
        assert_eq!(asm.accept(frags[0].clone()), Reassembly::Duplicate);
    }

    #[test]
    fn interleaved_messages_reassemble_independently() {
        let mut asm = Reassembler::new();
        let a = fragments(MessageId::zero(), b"first!", 3);
        let b = fragments(MessageId::zero().next(), b"second", 3);

        assert_eq!(asm.accept(a[0].clone()), Reassembly::Incomplete);
        assert_eq!(asm.accept(b[0].clone()), Reassembly::Incomplete);
        assert_eq!(asm.accept(a[1].clone()), Reassembly::Complete(b"first!".to_vec()));
        assert_eq!(asm.accept(b[1].clone()), Reassembly::Complete(b"second".to_vec()));
    }

    #[test]
    fn clear_forgets_completed_ids() {
        let mut asm = Reassembler::new();
        let frags = fragments(MessageId::zero(), b"x!", 100);
        assert!(matches!(asm.accept(frags[0].clone()), Reassembly::Complete(_)));
        asm.clear();
        assert!(matches!(asm.accept(frags[0].clone()), Reassembly::Complete(_)));
    }
}
