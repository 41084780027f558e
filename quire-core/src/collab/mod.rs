use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update, XmlFragment, XmlFragmentRef};

use crate::{Block, DocumentId};

mod tree;

/// Name of the shared XML fragment holding the block tree.
pub const FRAGMENT_NAME: &str = "prosemirror";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::MalformedUpdate(e.to_string())
    }
}

/// A replicated rich-text document.
///
/// Merge is delegated to yrs, so applying updates is commutative,
/// associative and idempotent. All methods take `&self`; yrs serializes
/// transactions internally, callers serialize mutation per document.
pub struct Document {
    doc: Doc,
    fragment: XmlFragmentRef,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let doc = Doc::new();
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT_NAME);
        Self { doc, fragment }
    }

    /// Rebuild a document from a full-state encoding.
    pub fn from_state(state: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.apply_update(state)?;
        Ok(document)
    }

    /// Build the initial tree for a first-time document.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        let document = Self::new();
        let mut ordered: Vec<&Block> = blocks.iter().collect();
        ordered.sort_by_key(|b| b.order);
        {
            let mut txn = document.doc.transact_mut();
            for (index, block) in ordered.into_iter().enumerate() {
                tree::insert_block(&document.fragment, &mut txn, index as u32, block);
            }
        }
        document
    }

    /// Decode an update without applying it.
    pub fn validate_update(update: &[u8]) -> Result<(), DocumentError> {
        Update::decode_v1(update)?;
        Ok(())
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Full state, sufficient to initialize an empty peer.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Delta bringing a peer at `state_vector` up to this document's state.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Derive the block list in tree order.
    pub fn to_blocks(&self, document_id: &DocumentId) -> Vec<Block> {
        let txn = self.doc.transact();
        tree::read_blocks(&self.fragment, &txn, document_id)
    }

    /// Structural equality of the block trees, independent of encoding.
    pub fn content_eq(&self, other: &Document) -> bool {
        let id = DocumentId::new("");
        self.to_blocks(&id) == other.to_blocks(&id)
    }

    pub fn block_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.fragment.len(&txn)
    }

    /// Insert a block locally and return the delta to send to peers.
    /// `index` past the end appends.
    pub fn insert_block(&self, index: u32, block: &Block) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let index = index.min(self.fragment.len(&txn));
        tree::insert_block(&self.fragment, &mut txn, index, block);
        txn.encode_update_v1()
    }

    /// Remove the block at `index`, returning the delta if one existed.
    pub fn remove_block(&self, index: u32) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        if index >= self.fragment.len(&txn) {
            return None;
        }
        self.fragment.remove_range(&mut txn, index, 1);
        Some(txn.encode_update_v1())
    }
}
