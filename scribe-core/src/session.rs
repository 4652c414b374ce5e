//! Authoritative state of one shared document.
//!
//! A [`Session`] holds the current text, the append-only history of committed
//! operations and the registry of connected participants. The revision a
//! client talks about is simply an index into the history: revision `r` is the
//! document after the first `r` operations were applied.
//!
//! ```text
//!   client op @ rev r ──► transform against history[r..] ──► apply ──► push
//!                             (selection re-mapped too)
//! ```
//!
//! The session is not synchronized; callers must serialize access to it.

use std::collections::HashMap;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::TextEncoding;
use crate::error::OtError;
use crate::operation::Operation;
use crate::selection::Selection;
use crate::transform::transform;

pub type ClientId = Uuid;

/// A participant of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub selection: Selection,
}

#[derive(Debug, Clone)]
pub struct Session {
    document: String,
    operations: Vec<Operation>,
    clients: HashMap<ClientId, Client>,
    encoding: TextEncoding,
}

impl Session {
    pub fn new(document: impl Into<String>) -> Self {
        Self::with_encoding(document, TextEncoding::default())
    }

    pub fn with_encoding(document: impl Into<String>, encoding: TextEncoding) -> Self {
        Self {
            document: document.into(),
            operations: Vec::new(),
            clients: HashMap::new(),
            encoding,
        }
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Number of committed operations.
    pub fn revision(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Register `id` with an empty name and selection, replacing any
    /// previous entry.
    pub fn add_client(&mut self, id: ClientId) {
        self.clients.insert(id, Client::default());
    }

    pub fn remove_client(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Unknown ids are ignored.
    pub fn set_name(&mut self, id: &ClientId, name: impl Into<String>) {
        if let Some(client) = self.clients.get_mut(id) {
            client.name = name.into();
        }
    }

    /// Unknown ids are ignored.
    pub fn set_selection(&mut self, id: &ClientId, selection: Selection) {
        if let Some(client) = self.clients.get_mut(id) {
            client.selection = selection;
        }
    }

    pub fn client(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn clients(&self) -> &HashMap<ClientId, Client> {
        &self.clients
    }

    /// Rebase `op`, written against `revision`, onto the current document and
    /// commit it.
    ///
    /// The operation is transformed against every operation committed since
    /// `revision`, and its selection meta is re-mapped through the same
    /// operations. On success the rebased operation (carrying the rebased
    /// selection) becomes the newest history entry and is returned. On
    /// failure the document and history are left untouched.
    pub fn add_operation(
        &mut self,
        revision: usize,
        mut op: Operation,
    ) -> Result<Operation, OtError> {
        let current = self.operations.len();
        if revision > current {
            return Err(OtError::InvalidRevision {
                revision: i64::try_from(revision).unwrap_or(i64::MAX),
                current,
            });
        }
        if op.encoding() != self.encoding {
            return Err(OtError::EncodingMismatch {
                left: op.encoding(),
                right: self.encoding,
            });
        }

        let mut meta = op.take_meta();
        for concurrent in &self.operations[revision..] {
            let (rebased, _) = transform(&op, concurrent)?;
            meta = meta.map(|selection| selection.transform(concurrent));
            op = rebased;
        }

        let document = op.apply(&self.document).map_err(|err| {
            error!(
                "rebased operation does not fit document at revision {}: {}",
                current, err
            );
            err
        })?;

        debug!(
            "committed revision {} (client was at {}, {} concurrent)",
            current + 1,
            revision,
            current - revision
        );

        op.set_meta(meta);
        self.document = document;
        self.operations.push(op.clone());
        Ok(op)
    }
}
