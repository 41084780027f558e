use quire_core::{DocumentError, DocumentId};
use thiserror::Error;

use crate::collaborators::{Access, CollaboratorError};
use crate::storage::StoreError;

/// Errors surfaced by the sync engine and its transports.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisted state for the document cannot be replayed. Never retried
    /// silently; the document stays unloaded until repaired.
    #[error("document {document_id} is unrecoverable{}: {reason}", at_seq(.seq))]
    Unrecoverable {
        document_id: DocumentId,
        seq: Option<u64>,
        reason: String,
    },

    #[error("permission denied: {access} access to {document_id}")]
    PermissionDenied {
        document_id: DocumentId,
        access: Access,
    },

    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("collaborator error: {0}")]
    Collaborator(String),
}

fn at_seq(seq: &Option<u64>) -> String {
    seq.map(|s| format!(" at seq {s}")).unwrap_or_default()
}

impl From<CollaboratorError> for SyncError {
    fn from(e: CollaboratorError) -> Self {
        SyncError::Collaborator(e.0)
    }
}

impl SyncError {
    /// Wire error code shared by the WebSocket and HTTP surfaces.
    pub fn code(&self) -> u16 {
        match self {
            SyncError::Document(_) | SyncError::InvalidDocumentId(_) => 400,
            SyncError::PermissionDenied { .. } => 403,
            SyncError::Unrecoverable { .. } | SyncError::Store(_) | SyncError::Collaborator(_) => 500,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
