use super::dialog::{DialogInner, DialogStateSender};
use super::server_dialog::{Dialog, ServerInviteDialog};
use super::DialogId;
use crate::dialog::authenticate::DigestAuthenticator;
use crate::message::Uri;
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionRole;
use crate::transaction::transaction::Transaction;
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

pub struct DialogLayerInner {
    pub dialogs: RwLock<HashMap<DialogId, Dialog>>,
    last_seq: AtomicU32,
}

/// Owns the dialog table. Dialogs and transactions never reference each
/// other directly; both sides are looked up by id and events whose id
/// matches nothing are dropped.
#[derive(Clone)]
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: Arc<DialogLayerInner>,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        DialogLayer {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                dialogs: RwLock::new(HashMap::new()),
                last_seq: AtomicU32::new(0),
            }),
        }
    }

    /// CSeq for the next dialog-initiating request.
    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Finds a dialog by id. Tries the id as-is, then with the tags
    /// swapped (requests from the peer name us in To), then without the
    /// to-tag (early dialog).
    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read().unwrap();
        if let Some(dialog) = dialogs.get(id) {
            return Some(dialog.clone());
        }
        if let Some(dialog) = dialogs.get(&id.reversed()) {
            return Some(dialog.clone());
        }
        let early = DialogId {
            call_id: id.call_id.clone(),
            from_tag: id.from_tag.clone(),
            to_tag: String::new(),
        };
        dialogs.get(&early).cloned()
    }

    pub fn insert_dialog(&self, dialog: Dialog) {
        let id = dialog.id();
        debug!("dialog stored: {}", id);
        self.inner.dialogs.write().unwrap().insert(id, dialog);
    }

    /// Re-indexes a dialog whose id gained the remote tag.
    pub fn reindex_dialog(&self, old_id: &DialogId, dialog: Dialog) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        dialogs.remove(old_id);
        dialogs.insert(dialog.id(), dialog);
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        info!("dialog removed: {}", id);
        let mut dialogs = self.inner.dialogs.write().unwrap();
        if dialogs.remove(id).is_none() {
            dialogs.remove(&id.reversed());
        }
    }

    /// Creates the UAS dialog for an incoming INVITE server transaction.
    /// The transaction must already carry our To tag (i.e. after the
    /// first non-100 response) for the id to be complete; an id without
    /// the local tag still works and is re-indexed later.
    pub fn create_server_invite_dialog(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
        contact: Option<Uri>,
    ) -> Result<ServerInviteDialog> {
        let id = DialogId::try_from(&tx.original)?;
        let inner = DialogInner::new(
            TransactionRole::Server,
            id,
            tx.original.clone(),
            self.endpoint.clone(),
            state_sender,
            authenticator,
            contact,
        )?;
        inner.capture_from_request(&tx.original);
        let dialog = ServerInviteDialog {
            inner: Arc::new(inner),
        };
        self.insert_dialog(Dialog::ServerInvite(dialog.clone()));
        Ok(dialog)
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
