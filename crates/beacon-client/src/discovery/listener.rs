//! Discovery notification handlers

/// Receives instance changes from a discovery.
///
/// Invoked on the watch delivery task, one notification at a time, so an
/// implementation sees changes in store order. It must not block for long.
pub trait NotifyHandler: Send + Sync + 'static {
    /// Called with the instance key and its current value (for up) or its
    /// last known value (for down).
    fn notify(&self, key: &str, value: &str);
}

/// A handler that invokes a closure.
pub struct FnNotifyHandler<F>
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnNotifyHandler<F>
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> NotifyHandler for FnNotifyHandler<F>
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn notify(&self, key: &str, value: &str) {
        (self.f)(key, value);
    }
}

/// Handler that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl NotifyHandler for NoopHandler {
    fn notify(&self, _key: &str, _value: &str) {}
}
