use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tether_application::{PushOutcome, PushSubscriber, PushSubscription, PushTransport};
use tether_core::{AppError, AppResult};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_CONNECTION_BUFFER: usize = 256;

type Routes = Arc<RwLock<HashMap<String, Route>>>;

#[derive(Debug)]
struct Route {
    generation: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

/// In-process push transport for sockets held by this process.
///
/// A connection is known while its subscription stream is alive; dropping
/// the stream removes the route.
#[derive(Debug)]
pub struct LocalPushHub {
    routes: Routes,
    next_generation: AtomicU64,
    buffer: usize,
}

impl Default for LocalPushHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPushHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_CONNECTION_BUFFER)
    }

    /// Creates a hub with a per-connection payload buffer.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Number of connections with a live subscription.
    pub async fn connection_count(&self) -> usize {
        self.routes
            .read()
            .await
            .values()
            .filter(|route| !route.sender.is_closed())
            .count()
    }
}

#[async_trait]
impl PushTransport for LocalPushHub {
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> AppResult<PushOutcome> {
        let route = self
            .routes
            .read()
            .await
            .get(connection_id)
            .map(|route| (route.generation, route.sender.clone()));
        let Some((generation, sender)) = route else {
            return Ok(PushOutcome::Gone);
        };

        match sender.try_send(payload) {
            Ok(()) => Ok(PushOutcome::Delivered),
            Err(TrySendError::Full(_)) => Err(AppError::ServiceUnavailable(format!(
                "push buffer of connection '{connection_id}' is full"
            ))),
            Err(TrySendError::Closed(_)) => {
                remove_route(&mut *self.routes.write().await, connection_id, generation);
                Ok(PushOutcome::Gone)
            }
        }
    }
}

#[async_trait]
impl PushSubscriber for LocalPushHub {
    async fn subscribe(&self, connection_id: &str) -> AppResult<PushSubscription> {
        if connection_id.trim().is_empty() {
            return Err(AppError::Validation(
                "connection_id must not be empty".to_owned(),
            ));
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut routes = self.routes.write().await;
            // Catches routes whose guard could not take the lock on drop.
            routes.retain(|_, route| !route.sender.is_closed());
            routes.insert(connection_id.to_owned(), Route { generation, sender });
        }

        Ok(HubSubscription {
            receiver: ReceiverStream::new(receiver),
            routes: self.routes.clone(),
            connection_id: connection_id.to_owned(),
            generation,
        }
        .boxed())
    }
}

fn remove_route(routes: &mut HashMap<String, Route>, connection_id: &str, generation: u64) {
    if routes
        .get(connection_id)
        .is_some_and(|route| route.generation == generation)
    {
        routes.remove(connection_id);
    }
}

/// Subscription stream that unregisters its route when dropped.
struct HubSubscription {
    receiver: ReceiverStream<Vec<u8>>,
    routes: Routes,
    connection_id: String,
    generation: u64,
}

impl Stream for HubSubscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Drop for HubSubscription {
    fn drop(&mut self) {
        if let Ok(mut routes) = self.routes.try_write() {
            remove_route(&mut routes, self.connection_id.as_str(), self.generation);
        }
    }
}
