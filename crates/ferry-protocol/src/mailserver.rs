//! Seam between the node and an attached store-and-forward server.
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::peer::Peer;
use crate::wire::{MessagesRequest, SyncMailRequest};

/// A mail server archives every envelope the node admits and answers
/// historic requests from peers.
///
/// The node calls [`archive`](MailServer::archive) once per newly pooled
/// envelope and once per envelope received in a sync page. Requests are
/// handed over on a separate task; the server replies through the given
/// peer.
#[async_trait::async_trait]
pub trait MailServer: Send + Sync {
    /// Hand an envelope to the archive. Called on the admission path, so it
    /// must return without waiting on storage. Failures are the server's to
    /// log and count.
    fn archive(&self, envelope: &Envelope);

    /// Serve a request carried in an encrypted envelope.
    async fn deliver_mail(&self, peer: Arc<Peer>, request: Envelope);

    /// Serve a structured request.
    async fn deliver(&self, peer: Arc<Peer>, request: MessagesRequest);

    /// Stream a slice of the archive to another mail server. The request
    /// has already passed [`SyncMailRequest::validate`].
    async fn sync_mail(&self, peer: Arc<Peer>, request: SyncMailRequest);
}
