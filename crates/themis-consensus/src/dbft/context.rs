// DBFT per-height consensus context.
//
// SAFETY INVARIANTS:
// 1. primary_index == primary_index(height, view, N) at all times
// 2. signatures[i].is_some() implies the signature verified against
//    bookkeepers[i] over the current header hash
// 3. Once SignatureSent is set for a height, this node never signs a
//    different header at that height (the bit survives view changes)
// 4. expected_view[i] never decreases within a height

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};
use themis_core::{Address, Block, Ledger, Transaction};
use themis_crypto::{Hash256, KeyPair, PublicKey, Signature};

use crate::engine::{ConsensusError, ConsensusResult};

/// Bit-set over the DBFT round states.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsensusState(u8);

impl ConsensusState {
    pub const INITIAL: ConsensusState = ConsensusState(0x00);
    pub const PRIMARY: ConsensusState = ConsensusState(0x01);
    pub const BACKUP: ConsensusState = ConsensusState(0x02);
    pub const REQUEST_SENT: ConsensusState = ConsensusState(0x04);
    pub const REQUEST_RECEIVED: ConsensusState = ConsensusState(0x08);
    pub const SIGNATURE_SENT: ConsensusState = ConsensusState(0x10);
    pub const BLOCK_GENERATED: ConsensusState = ConsensusState(0x20);

    pub fn has(self, flag: ConsensusState) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ConsensusState {
    type Output = ConsensusState;
    fn bitor(self, rhs: Self) -> Self {
        ConsensusState(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConsensusState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ConsensusState {
    type Output = ConsensusState;
    fn bitand(self, rhs: Self) -> Self {
        ConsensusState(self.0 & rhs.0)
    }
}

impl BitAndAssign for ConsensusState {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ConsensusState, &str); 6] = [
            (ConsensusState::PRIMARY, "Primary"),
            (ConsensusState::BACKUP, "Backup"),
            (ConsensusState::REQUEST_SENT, "RequestSent"),
            (ConsensusState::REQUEST_RECEIVED, "RequestReceived"),
            (ConsensusState::SIGNATURE_SENT, "SignatureSent"),
            (ConsensusState::BLOCK_GENERATED, "BlockGenerated"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.has(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "Initial")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// `(height - view) mod n`, adding `n` when the difference is negative.
pub fn primary_index(height: u32, view: u8, n: usize) -> usize {
    let n = n as i64;
    let mut p = (height as i64 - view as i64) % n;
    if p < 0 {
        p += n;
    }
    p as usize
}

/// Signing quorum `M = N - (N-1)/3`.
pub fn quorum(n: usize) -> usize {
    n - (n - 1) / 3
}

pub struct ConsensusContext {
    pub state: ConsensusState,
    pub prev_hash: Hash256,
    pub prev_timestamp: u32,
    pub height: u32,
    pub view: u8,
    pub bookkeepers: Vec<PublicKey>,
    pub next_bookkeepers: Vec<PublicKey>,
    pub owner: PublicKey,
    /// This node's slot in `bookkeepers`, if it is one.
    pub my_index: Option<usize>,
    pub primary_index: usize,
    pub timestamp: u32,
    pub nonce: u64,
    pub next_bookkeeper: Address,
    pub transactions: Vec<Transaction>,
    pub signatures: Vec<Option<Signature>>,
    /// Responses received before the header, verified once it arrives.
    pub pending_signatures: Vec<Option<Signature>>,
    pub expected_view: Vec<u8>,
    header: Option<Block>,
}

impl ConsensusContext {
    pub fn new(owner: PublicKey) -> Self {
        ConsensusContext {
            state: ConsensusState::INITIAL,
            prev_hash: Hash256::ZERO,
            prev_timestamp: 0,
            height: 0,
            view: 0,
            bookkeepers: Vec::new(),
            next_bookkeepers: Vec::new(),
            owner,
            my_index: None,
            primary_index: 0,
            timestamp: 0,
            nonce: 0,
            next_bookkeeper: Address::ZERO,
            transactions: Vec::new(),
            signatures: Vec::new(),
            pending_signatures: Vec::new(),
            expected_view: Vec::new(),
            header: None,
        }
    }

    /// Start a fresh round on top of the ledger tip.
    pub fn reset(&mut self, ledger: &dyn Ledger) -> ConsensusResult<()> {
        let bookkeepers = ledger.get_bookkeepers();
        if bookkeepers.is_empty() {
            return Err(ConsensusError::Config("empty bookkeeper set".into()));
        }
        let tip = ledger.current_block_height();
        let parent = ledger.get_header(tip)?;
        let n = bookkeepers.len();

        self.state = ConsensusState::INITIAL;
        self.prev_hash = ledger.current_block_hash();
        self.prev_timestamp = parent.timestamp;
        self.height = tip + 1;
        self.view = 0;
        self.my_index = bookkeepers.iter().position(|pk| *pk == self.owner);
        self.next_bookkeepers = bookkeepers.clone();
        self.next_bookkeeper = Address::from_bookkeepers(&bookkeepers);
        self.bookkeepers = bookkeepers;
        self.primary_index = primary_index(self.height, 0, n);
        self.timestamp = 0;
        self.nonce = 0;
        self.transactions.clear();
        self.signatures = vec![None; n];
        self.pending_signatures = vec![None; n];
        self.expected_view = vec![0; n];
        self.header = None;
        Ok(())
    }

    /// Move to `view` at the current height.
    ///
    /// Only SignatureSent survives. A node that already signed keeps its
    /// header and its own signature; every other collected signature is
    /// discarded.
    pub fn change_view(&mut self, view: u8) {
        let n = self.bookkeepers.len();
        self.state &= ConsensusState::SIGNATURE_SENT;
        self.view = view;
        self.primary_index = primary_index(self.height, view, n);
        let own = self
            .my_index
            .and_then(|i| self.signatures.get(i).copied().flatten());
        self.signatures = vec![None; n];
        self.pending_signatures = vec![None; n];
        if self.state == ConsensusState::INITIAL {
            self.transactions.clear();
            self.header = None;
        } else if let (Some(i), Some(sig)) = (self.my_index, own) {
            self.signatures[i] = Some(sig);
        }
    }

    pub fn n(&self) -> usize {
        self.bookkeepers.len()
    }

    pub fn m(&self) -> usize {
        quorum(self.n())
    }

    /// Own index as carried in a payload envelope; `None` for observers and
    /// for indexes past the 16-bit envelope field.
    pub fn envelope_index(&self) -> Option<u16> {
        self.my_index.and_then(|i| u16::try_from(i).ok())
    }

    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index)
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_some()).count()
    }

    pub fn header(&self) -> Option<&Block> {
        self.header.as_ref()
    }

    pub fn header_hash(&self) -> Option<Hash256> {
        self.header.as_ref().map(Block::hash)
    }

    /// Assemble the unsigned block for the current round fields.
    pub fn build_block(&self, ledger: &dyn Ledger) -> Block {
        let tx_root = Block::transactions_root_of(&self.transactions);
        Block::new(
            self.prev_hash,
            ledger.block_root_with_new_tx_root(tx_root),
            self.timestamp,
            self.height,
            self.nonce,
            Vec::new(),
            self.next_bookkeeper,
            self.transactions.clone(),
        )
    }

    /// Install the round's header. Refuses to replace a header this node
    /// already signed with a different one.
    pub fn set_header(&mut self, block: Block) -> ConsensusResult<()> {
        if self.state.has(ConsensusState::SIGNATURE_SENT) {
            if let Some(existing) = &self.header {
                if existing.hash() != block.hash() {
                    return Err(ConsensusError::Auth(format!(
                        "already signed a different header at height {}",
                        self.height
                    )));
                }
                return Ok(());
            }
        }
        self.header = Some(block);
        Ok(())
    }

    /// Sign the header as this node and record the signature in our slot.
    pub fn sign_header(&mut self, keypair: &KeyPair) -> Option<Signature> {
        let index = self.my_index?;
        let hash = self.header_hash()?;
        let sig = keypair.sign(hash.as_bytes());
        self.signatures[index] = Some(sig);
        self.state |= ConsensusState::SIGNATURE_SENT;
        Some(sig)
    }

    /// Record a signature for slot `index`, verifying it against the header.
    /// Without a header the signature is parked until one arrives.
    pub fn add_signature(&mut self, index: usize, sig: Signature) -> ConsensusResult<bool> {
        if index >= self.n() {
            return Err(ConsensusError::Auth(format!("bookkeeper index {} out of range", index)));
        }
        if self.signatures[index].is_some() {
            return Ok(false);
        }
        match self.header_hash() {
            Some(hash) => {
                if !self.bookkeepers[index].verify(hash.as_bytes(), &sig) {
                    return Err(ConsensusError::Auth(format!(
                        "bad header signature from bookkeeper {}",
                        index
                    )));
                }
                self.signatures[index] = Some(sig);
                Ok(true)
            }
            None => {
                self.pending_signatures[index] = Some(sig);
                Ok(false)
            }
        }
    }

    /// Verify parked signatures against the now-known header. Returns the
    /// slots whose parked signature failed verification.
    pub fn drain_pending(&mut self) -> Vec<usize> {
        let mut rejected = Vec::new();
        let Some(hash) = self.header_hash() else {
            return rejected;
        };
        for i in 0..self.n() {
            if let Some(sig) = self.pending_signatures[i].take() {
                if self.signatures[i].is_some() {
                    continue;
                }
                if self.bookkeepers[i].verify(hash.as_bytes(), &sig) {
                    self.signatures[i] = Some(sig);
                } else {
                    rejected.push(i);
                }
            }
        }
        rejected
    }

    /// The header with all collected signatures attached, in slot order.
    pub fn finalized_block(&self) -> Option<Block> {
        let mut block = self.header.clone()?;
        let signers = self
            .signatures
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|sig| (self.bookkeepers[i].clone(), sig)))
            .collect();
        block.set_signatures(signers);
        Some(block)
    }

    /// Collected signatures as `(slot, signature)` pairs.
    pub fn signature_list(&self) -> Vec<(u16, Signature)> {
        self.signatures
            .iter()
            .enumerate()
            .filter_map(|(i, s)| Some((u16::try_from(i).ok()?, (*s)?)))
            .collect()
    }

    /// Number of bookkeepers (including this node) expecting a view of at least `view`.
    pub fn expected_view_count(&self, view: u8) -> usize {
        self.expected_view.iter().filter(|v| **v >= view).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use themis_core::{GenesisConfig, MemLedger};

    fn keys(n: u8) -> Vec<KeyPair> {
        (1..=n).map(|i| KeyPair::from_seed(&[i; 32]).unwrap()).collect()
    }

    fn context_for(keys: &[KeyPair], me: usize) -> (MemLedger, ConsensusContext) {
        let ledger = MemLedger::new(GenesisConfig {
            bookkeepers: keys.iter().map(|k| k.public().clone()).collect(),
            timestamp: 100,
            storage: Vec::new(),
        });
        let mut ctx = ConsensusContext::new(keys[me].public().clone());
        ctx.reset(&ledger).unwrap();
        (ledger, ctx)
    }

    #[test]
    fn test_primary_index_examples() {
        assert_eq!(primary_index(1, 0, 4), 1);
        assert_eq!(primary_index(1, 1, 4), 0);
        assert_eq!(primary_index(1, 2, 4), 3);
        assert_eq!(primary_index(0, 5, 4), 3);
    }

    #[test]
    fn test_quorum_values() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(7), 5);
        assert_eq!(quorum(10), 7);
    }

    proptest! {
        #[test]
        fn prop_primary_index_in_range_and_congruent(height in 0u32..1_000_000, view in any::<u8>(), n in 1usize..50) {
            let p = primary_index(height, view, n);
            prop_assert!(p < n);
            let diff = height as i64 - view as i64;
            prop_assert_eq!((p as i64 - diff).rem_euclid(n as i64), 0);
        }
    }

    #[test]
    fn test_reset_tracks_ledger_tip() {
        let ks = keys(4);
        let (ledger, ctx) = context_for(&ks, 2);
        assert_eq!(ctx.height, 1);
        assert_eq!(ctx.prev_hash, ledger.current_block_hash());
        assert_eq!(ctx.my_index, Some(2));
        assert_eq!(ctx.primary_index, 1);
        assert_eq!(ctx.m(), 3);
    }

    #[test]
    fn test_change_view_preserves_signature_sent_and_own_signature() {
        let ks = keys(4);
        let (ledger, mut ctx) = context_for(&ks, 2);
        ctx.state |= ConsensusState::BACKUP | ConsensusState::REQUEST_RECEIVED;
        ctx.timestamp = 101;
        let block = ctx.build_block(&ledger);
        ctx.set_header(block.clone()).unwrap();
        ctx.sign_header(&ks[2]).unwrap();
        let sig1 = ks[1].sign(block.hash().as_bytes());
        assert!(ctx.add_signature(1, sig1).unwrap());

        ctx.change_view(1);
        assert_eq!(ctx.state, ConsensusState::SIGNATURE_SENT);
        assert_eq!(ctx.primary_index, 0);
        assert_eq!(ctx.signature_count(), 1);
        assert!(ctx.signatures[2].is_some());

        // a different header at the same height is refused
        let mut other = block.clone();
        other.header.timestamp += 1;
        assert!(ctx.set_header(other.clone()).is_err());
        assert!(ctx.set_header(block.clone()).is_ok());

        // a second view change still keeps the signed header
        ctx.change_view(2);
        assert_eq!(ctx.state, ConsensusState::SIGNATURE_SENT);
        assert_eq!(ctx.primary_index, 3);
        assert_eq!(ctx.signature_count(), 1);
        assert!(ctx.header().is_some());
        assert!(ctx.set_header(other).is_err());
        assert!(ctx.set_header(block).is_ok());
    }

    #[test]
    fn test_change_view_without_signature_clears_round() {
        let ks = keys(4);
        let (ledger, mut ctx) = context_for(&ks, 2);
        ctx.state |= ConsensusState::BACKUP;
        ctx.transactions.push(Transaction::new(1, Address([1u8; 20]), vec![]));
        let block = ctx.build_block(&ledger);
        ctx.set_header(block).unwrap();
        ctx.change_view(2);
        assert_eq!(ctx.state, ConsensusState::INITIAL);
        assert!(ctx.header().is_none());
        assert!(ctx.transactions.is_empty());
        assert_eq!(ctx.primary_index, 3);
    }

    #[test]
    fn test_parked_signatures_verified_when_header_arrives() {
        let ks = keys(4);
        let (ledger, mut ctx) = context_for(&ks, 0);
        ctx.timestamp = 101;
        let block = ctx.build_block(&ledger);
        let good = ks[2].sign(block.hash().as_bytes());
        let bad = ks[3].sign(b"something else");
        assert!(!ctx.add_signature(2, good).unwrap());
        assert!(!ctx.add_signature(3, bad).unwrap());
        assert_eq!(ctx.signature_count(), 0);

        ctx.set_header(block).unwrap();
        let rejected = ctx.drain_pending();
        assert_eq!(rejected, vec![3]);
        assert_eq!(ctx.signature_count(), 1);
        assert!(ctx.signatures[2].is_some());
    }

    #[test]
    fn test_duplicate_and_forged_signatures() {
        let ks = keys(4);
        let (ledger, mut ctx) = context_for(&ks, 0);
        ctx.timestamp = 101;
        let block = ctx.build_block(&ledger);
        ctx.set_header(block.clone()).unwrap();
        let sig = ks[1].sign(block.hash().as_bytes());
        assert!(ctx.add_signature(1, sig).unwrap());
        assert!(!ctx.add_signature(1, sig).unwrap());
        // slot 2 signed by key 1
        assert!(ctx.add_signature(2, sig).is_err());
        assert!(ctx.add_signature(9, sig).is_err());
    }

    #[test]
    fn test_expected_view_count() {
        let ks = keys(4);
        let (_, mut ctx) = context_for(&ks, 0);
        ctx.expected_view = vec![1, 2, 0, 1];
        assert_eq!(ctx.expected_view_count(1), 3);
        assert_eq!(ctx.expected_view_count(2), 1);
    }

    #[test]
    fn test_envelope_index_fits_u16() {
        let ks = keys(4);
        let (_, mut ctx) = context_for(&ks, 3);
        assert_eq!(ctx.envelope_index(), Some(3));
        ctx.my_index = Some(usize::from(u16::MAX) + 1);
        assert_eq!(ctx.envelope_index(), None);
        ctx.my_index = None;
        assert_eq!(ctx.envelope_index(), None);
    }

    #[test]
    fn test_state_debug_names() {
        let s = ConsensusState::BACKUP | ConsensusState::SIGNATURE_SENT;
        assert_eq!(format!("{:?}", s), "Backup|SignatureSent");
        assert_eq!(format!("{:?}", ConsensusState::INITIAL), "Initial");
        assert!(!ConsensusState::INITIAL.has(ConsensusState::INITIAL));
    }
}
