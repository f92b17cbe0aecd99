//! Message routing.
//!
//! The router maps a message id to a [`Handler`]. Handlers are registered
//! while the server is being built; once the server starts the table is
//! frozen behind an `Arc` and only read.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::RouterError;
use crate::net::Request;

/// Processing stages for one message id.
///
/// The three stages run strictly in order on the same task for a given
/// request. Only [`Handler::handle`] is required.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn pre_handle(&self, _request: &Request) {}

    async fn handle(&self, request: &Request);

    async fn post_handle(&self, _request: &Request) {}
}

/// Message id → handler table.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_id`.
    ///
    /// A second registration for the same id is rejected and the first one
    /// stays in place.
    pub fn add_handler<H: Handler>(&mut self, msg_id: u32, handler: H) -> Result<(), RouterError> {
        self.add_shared(msg_id, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn add_shared(&mut self, msg_id: u32, handler: Arc<dyn Handler>) -> Result<(), RouterError> {
        if self.handlers.contains_key(&msg_id) {
            return Err(RouterError::DuplicateHandler(msg_id));
        }
        self.handlers.insert(msg_id, handler);
        debug!(msg_id, "Handler registered");
        Ok(())
    }

    pub fn contains(&self, msg_id: u32) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for the request's message id.
    ///
    /// An unknown id is logged and the request dropped; the connection stays
    /// open.
    pub async fn do_msg_handler(&self, request: Request) {
        let msg_id = request.msg_id();
        let conn = request.connection();

        let Some(handler) = self.handlers.get(&msg_id) else {
            warn!(conn_id = conn.id(), msg_id, "No handler registered for message");
            conn.metrics().error();
            return;
        };

        trace!(conn_id = conn.id(), msg_id, "Dispatching message");
        let started = Instant::now();

        handler.pre_handle(&request).await;
        handler.handle(&request).await;
        handler.post_handle(&request).await;

        conn.metrics().handling_time(started.elapsed());
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Router").field("msg_ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::test_support::Harness;
    use parking_lot::Mutex;

    /// Records the order stages ran in.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn pre_handle(&self, request: &Request) {
            self.log.lock().push(format!("{}:pre:{}", self.tag, request.msg_id()));
        }

        async fn handle(&self, request: &Request) {
            // Yield between stages to make reordering observable if it happened
            tokio::task::yield_now().await;
            self.log.lock().push(format!("{}:handle:{}", self.tag, request.msg_id()));
        }

        async fn post_handle(&self, request: &Request) {
            self.log.lock().push(format!("{}:post:{}", self.tag, request.msg_id()));
        }
    }

    struct HandleOnly;

    #[async_trait]
    impl Handler for HandleOnly {
        async fn handle(&self, request: &Request) {
            let _ = request.connection().send_msg(request.msg_id(), request.data().clone());
        }
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();

        router
            .add_handler(1, Recorder { log: log.clone(), tag: "first" })
            .unwrap();
        let err = router
            .add_handler(1, Recorder { log: log.clone(), tag: "second" })
            .unwrap_err();

        assert_eq!(err, RouterError::DuplicateHandler(1));
        assert_eq!(router.len(), 1);
        assert!(router.contains(1));
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        router
            .add_handler(5, Recorder { log: log.clone(), tag: "r" })
            .unwrap();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        router
            .do_msg_handler(Request::new(conn, Message::new(5, &b"x"[..])))
            .await;

        assert_eq!(*log.lock(), vec!["r:pre:5", "r:handle:5", "r:post:5"]);
        assert_eq!(harness.metrics.snapshot().handling_count, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_not_fatal() {
        let mut router = Router::new();
        router.add_handler(1, HandleOnly).unwrap();

        let harness = Harness::new();
        let (conn, _peer) = harness.connect(1).await;
        router
            .do_msg_handler(Request::new(conn.clone(), Message::new(42, &b"?"[..])))
            .await;

        assert!(!conn.is_closed());
        let snap = harness.metrics.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.handling_count, 0);
    }
}
