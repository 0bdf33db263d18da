//! Fixed-width counters over the supported symbol alphabet.
//!
//! Message identifiers and fragment sequence numbers are short strings of
//! printable ASCII symbols so they survive transports that only move text
//! cleanly. The alphabet is the 95 printable ASCII characters `' '..='~'` in
//! ascending order, which makes symbol rank arithmetic a plain byte offset.

use core::fmt;

use crate::errors::SequenceError;

/// First symbol of the alphabet.
pub const ALPHABET_FIRST: u8 = b' ';
/// Last symbol of the alphabet.
pub const ALPHABET_LAST: u8 = b'~';
/// Number of symbols in the alphabet.
pub const ALPHABET_SIZE: u8 = ALPHABET_LAST - ALPHABET_FIRST + 1;

/// Rank of a wire symbol, or an error if it falls outside the alphabet.
pub fn symbol_rank(symbol: u8) -> Result<u8, SequenceError> {
    if (ALPHABET_FIRST..=ALPHABET_LAST).contains(&symbol) {
        Ok(symbol - ALPHABET_FIRST)
    } else {
        Err(SequenceError::UnsupportedSymbol(symbol))
    }
}

/// True when every byte is an alphabet symbol.
pub fn is_symbol_text(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (ALPHABET_FIRST..=ALPHABET_LAST).contains(&b))
}

// ----------------------------------------------------------------------------
// Sequence Number
// ----------------------------------------------------------------------------

/// A fixed-width counter of `W` alphabet symbols, most significant first.
///
/// Ordering is lexicographic over symbol ranks. Incrementing carries like an
/// odometer and saturates silently once every symbol is at the alphabet
/// maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber<const W: usize> {
    ranks: [u8; W],
}

/// Identifier of a whole outbound message (4 symbols).
pub type MessageId = SequenceNumber<4>;

/// Position of a fragment within a message (3 symbols).
pub type SeqNumber = SequenceNumber<3>;

impl<const W: usize> SequenceNumber<W> {
    /// The all-minimum value.
    pub fn zero() -> Self {
        Self { ranks: [0; W] }
    }

    /// Advance to the next value. Saturates at all-max without error.
    pub fn increment(&mut self) {
        for i in (0..W).rev() {
            if self.ranks[i] < ALPHABET_SIZE - 1 {
                self.ranks[i] += 1;
                for rank in &mut self.ranks[i + 1..] {
                    *rank = 0;
                }
                return;
            }
        }
        // All symbols at max: saturate.
    }

    /// Return the successor without mutating.
    pub fn next(&self) -> Self {
        let mut next = *self;
        next.increment();
        next
    }

    pub fn is_zero(&self) -> bool {
        self.ranks.iter().all(|&r| r == 0)
    }

    pub fn is_max(&self) -> bool {
        self.ranks.iter().all(|&r| r == ALPHABET_SIZE - 1)
    }

    /// Encode as wire symbols.
    pub fn to_symbols(&self) -> [u8; W] {
        let mut out = [0u8; W];
        for (o, r) in out.iter_mut().zip(self.ranks.iter()) {
            *o = ALPHABET_FIRST + r;
        }
        out
    }

    /// Decode from wire symbols.
    pub fn from_symbols(symbols: &[u8]) -> Result<Self, SequenceError> {
        if symbols.len() != W {
            return Err(SequenceError::WrongWidth {
                expected: W,
                actual: symbols.len(),
            });
        }
        let mut ranks = [0u8; W];
        for (rank, &symbol) in ranks.iter_mut().zip(symbols.iter()) {
            *rank = symbol_rank(symbol)?;
        }
        Ok(Self { ranks })
    }
}

impl<const W: usize> Default for SequenceNumber<W> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<const W: usize> fmt::Display for SequenceNumber<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for symbol in self.to_symbols() {
            write!(f, "{}", symbol as char)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_strictly_increasing() {
        let mut seq = SeqNumber::zero();
        let mut previous = seq;
        for _ in 0..10_000 {
            seq.increment();
            assert!(seq > previous);
            assert!(seq.to_symbols() > previous.to_symbols(), "wire order must agree");
            previous = seq;
        }
    }

    #[test]
    fn carry_rolls_lower_symbols_over() {
        let mut seq = SeqNumber::from_symbols(b" !~").unwrap();
        seq.increment();
        assert_eq!(&seq.to_symbols(), b" \" ");
    }

    #[test]
    fn saturates_at_max() {
        let mut seq = SeqNumber::from_symbols(b"~~~").unwrap();
        assert!(seq.is_max());
        seq.increment();
        assert!(seq.is_max());
        assert_eq!(&seq.to_symbols(), b"~~~");
    }

    #[test]
    fn rejects_out_of_alphabet_symbols() {
        assert_eq!(
            SeqNumber::from_symbols(&[b'a', 0x7f, b'c']),
            Err(SequenceError::UnsupportedSymbol(0x7f))
        );
        assert_eq!(
            SeqNumber::from_symbols(b"abcd"),
            Err(SequenceError::WrongWidth { expected: 3, actual: 4 })
        );
    }

    #[test]
    fn symbol_text_covers_only_printable_ascii() {
        assert!(is_symbol_text(b"aliceXY"));
        assert!(is_symbol_text(b" ~"));
        assert!(!is_symbol_text("alic\u{e9}XY".as_bytes()));
        assert!(!is_symbol_text(b"tab\there"));
    }

    #[test]
    fn round_trips_through_symbols() {
        let mut id = MessageId::zero();
        for _ in 0..300 {
            id.increment();
        }
        let decoded = MessageId::from_symbols(&id.to_symbols()).unwrap();
        assert_eq!(id, decoded);
    }
}
