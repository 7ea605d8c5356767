//! A peer replicant bound to the client that carries its traffic.

use std::ops::Deref;

use serde_json::Value;
use switchboard_core::{Replicant, ReplicantKey, ReplicantOptions};

use crate::client::SyncClient;
use crate::protocol::ProtocolError;

/// Peer-side handle: the local [`Replicant`] plus the connection it
/// declares, proposes and resyncs through. Derefs to the replicant, so
/// reads, writes and listeners work as on any replicant.
#[derive(Clone)]
pub struct PeerReplicant {
    replicant: Replicant,
    client: SyncClient,
}

impl PeerReplicant {
    /// Create (or reuse) the client's replicant for `key`. Nothing is sent
    /// until [`declare`](Self::declare).
    pub fn new(client: &SyncClient, key: ReplicantKey, options: ReplicantOptions) -> Self {
        Self {
            replicant: client.replicant(key, options),
            client: client.clone(),
        }
    }

    /// Create and declare in one step.
    pub async fn declared(
        client: &SyncClient,
        key: ReplicantKey,
        options: ReplicantOptions,
    ) -> Result<Self, ProtocolError> {
        let peer = Self::new(client, key, options);
        peer.declare().await?;
        Ok(peer)
    }

    pub fn replicant(&self) -> &Replicant {
        &self.replicant
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub async fn declare(&self) -> Result<(), ProtocolError> {
        self.client.declare(&self.replicant).await
    }

    /// The authority's current value, without touching the local copy.
    pub async fn read(&self) -> Result<Option<Value>, ProtocolError> {
        Ok(self.client.read(self.replicant.key()).await?.value)
    }

    pub async fn resync(&self) -> Result<(), ProtocolError> {
        self.client.resync(&self.replicant).await
    }

    /// Leave the room. The replicant stays usable locally but is no longer
    /// synchronized.
    pub async fn leave(self) -> Result<Replicant, ProtocolError> {
        self.client.leave(self.replicant.key()).await?;
        Ok(self.replicant)
    }
}

impl Deref for PeerReplicant {
    type Target = Replicant;

    fn deref(&self) -> &Replicant {
        &self.replicant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::server::SyncServer;
    use serde_json::json;
    use switchboard_core::ReplicantStatus;

    #[tokio::test]
    async fn test_peer_replicant_lifecycle() {
        let server = SyncServer::with_defaults();
        let key = ReplicantKey::new("lobby", "players");
        server
            .registry()
            .declare(key.clone(), ReplicantOptions::default().with_default(json!(["ada"])))
            .await
            .unwrap();
        let client = SyncClient::connect_local(&server, ClientConfig::for_testing("local"))
            .await
            .unwrap();

        let peer = PeerReplicant::declared(&client, key.clone(), ReplicantOptions::default())
            .await
            .unwrap();
        assert_eq!(peer.status(), ReplicantStatus::Declared);
        assert_eq!(peer.value(), Some(json!(["ada"])));

        let again = PeerReplicant::new(&client, key, ReplicantOptions::default());
        assert!(again.replicant().ptr_eq(peer.replicant()));

        peer.root().unwrap().push(json!("grace")).unwrap();
        peer.flush_operations();
        for _ in 0..200 {
            if peer.revision() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(peer.read().await.unwrap(), Some(json!(["ada", "grace"])));
        assert_eq!(peer.value(), Some(json!(["ada", "grace"])));

        let local = peer.leave().await.unwrap();
        assert_eq!(local.status(), ReplicantStatus::Undeclared);
    }
}
