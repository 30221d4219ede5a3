// Connection registry for the websocket channel.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Frames buffered per connection before it is considered stuck.
const CONNECTION_BUFFER: usize = 32;

struct Connection {
    tx: mpsc::Sender<String>,
}

/// Every live websocket, keyed by connection id. Frames are broadcast to all
/// of them; the trusted proxy on the other end routes by `targets`.
#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<RwLock<HashMap<Uuid, Connection>>>,
}

impl Hub {
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        self.connections.write().await.insert(id, Connection { tx });
        tracing::info!(connection = %id, "Realtime connection opened");
        (id, rx)
    }

    pub async fn unregister(&self, id: Uuid) {
        if self.connections.write().await.remove(&id).is_some() {
            tracing::info!(connection = %id, "Realtime connection closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Sends `frame` to every connection without waiting on any of them.
    /// Connections whose buffer is full or closed are dropped. Returns how
    /// many connections accepted the frame.
    pub async fn broadcast(&self, frame: String) -> usize {
        let snapshot: Vec<(Uuid, mpsc::Sender<String>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, conn)| (*id, conn.tx.clone()))
            .collect();

        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, tx) in snapshot {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write().await;
            for id in dead {
                connections.remove(&id);
                tracing::warn!(connection = %id, "Dropping unresponsive realtime connection");
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let hub = Hub::default();
        let (_a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;

        assert_eq!(hub.broadcast("hello".into()).await, 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn closed_connection_is_removed() {
        let hub = Hub::default();
        let (_a, rx_a) = hub.register().await;
        let (_b, _rx_b) = hub.register().await;
        drop(rx_a);

        assert_eq!(hub.broadcast("ping".into()).await, 1);
        assert_eq!(hub.len().await, 1);
    }

    #[tokio::test]
    async fn stuck_connection_is_removed() {
        let hub = Hub::default();
        let (_id, _rx) = hub.register().await;

        for _ in 0..CONNECTION_BUFFER {
            assert_eq!(hub.broadcast("x".into()).await, 1);
        }
        assert_eq!(hub.broadcast("overflow".into()).await, 0);
        assert_eq!(hub.len().await, 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::default();
        let (id, _rx) = hub.register().await;
        hub.unregister(id).await;
        hub.unregister(id).await;
        assert_eq!(hub.len().await, 0);
    }
}
