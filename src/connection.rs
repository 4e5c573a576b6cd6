//! `Connection`/`ConnectionBuilder` — the bus-ready handshake in front of a [`Router`] (§5).
//!
//! A bare `Router::new` wraps a transport without ever calling `Hello`, so it stays usable
//! against non-bus transports (a direct peer-to-peer [`crate::transport::ChannelTransport`] in
//! tests, say). `ConnectionBuilder` is the piece that turns a connected transport into a bus
//! connection: it spawns the dispatch loop, runs `Hello` against a configurable timeout, and
//! fails with [`Error::BusNotReady`] if the daemon never answers (§5 "Cancellation and timeouts").

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{select, Either};

use crate::error::{Error, Result};
use crate::fdo;
use crate::names::OwnedUniqueName;
use crate::router::Router;
use crate::transport::Transport;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A bus connection: a [`Router`] whose `Hello` handshake has already completed. `Deref`s to the
/// underlying `Router` so callers that only ever needed `Arc<Router>` keep working unchanged.
pub struct Connection {
    router: Arc<Router>,
    unique_name: OwnedUniqueName,
}

impl Connection {
    /// The unique name the daemon assigned this connection during `Hello`.
    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    /// The underlying router, for APIs (`Service::new`, `ProxyBuilder::new`) that take one
    /// directly.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

impl Deref for Connection {
    type Target = Router;

    fn deref(&self) -> &Router {
        &self.router
    }
}

/// Builds a [`Connection`], mirroring the teacher's own builder chaining convention
/// (`ConnectionBuilder::new(transport).handshake_timeout(..).build()`).
pub struct ConnectionBuilder {
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
}

impl ConnectionBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the `Hello` handshake timeout (default 5s, §5).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Spawn the dispatch loop and complete the `Hello` handshake. Fails with
    /// [`Error::BusNotReady`] if the daemon hasn't replied within the configured timeout.
    pub async fn build(self) -> Result<Arc<Connection>> {
        let router = Router::new(self.transport);

        let dispatch = router.clone();
        async_io::Task::detach(async_io::Task::spawn(async move {
            dispatch.run().await;
        }));

        let hello = Box::pin(fdo::hello(&router));
        let timeout = Box::pin(async_io::Timer::after(self.handshake_timeout));
        let unique_name = match select(hello, timeout).await {
            Either::Left((result, _)) => result?,
            Either::Right(((), _)) => return Err(Error::BusNotReady),
        };

        Ok(Arc::new(Connection { router, unique_name }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[test]
    fn handshake_times_out_when_nothing_answers_hello() {
        async_io::block_on(async {
            let (client, _server) = ChannelTransport::pair();
            let result = ConnectionBuilder::new(client as Arc<dyn Transport>)
                .handshake_timeout(Duration::from_millis(50))
                .build()
                .await;
            assert!(matches!(result, Err(Error::BusNotReady)));
        });
    }
}
