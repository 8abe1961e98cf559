use std::sync::{Arc, RwLock};

use crate::parse::{HttpMessage, Side};

/// A user-supplied transform over a parsed message head.
///
/// Interceptors run synchronously on the forwarding path, once per message,
/// in registration order. They may rewrite headers, the request method and
/// target, the response status, or the upgrade flag; if a transform changes
/// body framing headers it owns keeping them consistent with the body it
/// lets through.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, message: &mut HttpMessage);
}

impl<F> Interceptor for F
where
    F: Fn(&mut HttpMessage) + Send + Sync,
{
    fn intercept(&self, message: &mut HttpMessage) {
        self(message)
    }
}

/// The two append-only interceptor pipelines of a proxy.
///
/// Registration that races an in-flight message may or may not apply to it;
/// it applies to every message framed afterwards.
#[derive(Default)]
pub struct Interceptors {
    request: RwLock<Vec<Arc<dyn Interceptor>>>,
    response: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("request", &self.request.read().expect("poisoned").len())
            .field("response", &self.response.read().expect("poisoned").len())
            .finish()
    }
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transform to the request pipeline.
    pub fn add_request(&self, interceptor: Arc<dyn Interceptor>) {
        self.request.write().expect("poisoned").push(interceptor);
    }

    /// Appends a transform to the response pipeline.
    pub fn add_response(&self, interceptor: Arc<dyn Interceptor>) {
        self.response.write().expect("poisoned").push(interceptor);
    }

    /// Runs the pipeline for `side` over `message`, in registration order.
    pub fn apply(&self, side: Side, message: &mut HttpMessage) {
        let lock = match side {
            Side::Request => &self.request,
            Side::Response => &self.response,
        };
        // Snapshot outside the transforms so a registration from inside an
        // interceptor cannot deadlock or change this message's pipeline.
        let snapshot: Vec<_> = lock.read().expect("poisoned").clone();
        for interceptor in snapshot {
            interceptor.intercept(message);
        }
    }
}
