use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::error;

use crate::resource::DynamicObject;

/// Returned by handlers which could not process a notification. The error is
/// logged, nothing is retried.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError(err.into())
    }
}

/// What happened to an object, as seen by handlers.
#[derive(Clone, Debug)]
pub enum Notification {
    Added(Arc<DynamicObject>),
    Updated {
        old: Arc<DynamicObject>,
        new: Arc<DynamicObject>,
    },
    Deleted(Arc<DynamicObject>),
}

impl Notification {
    /// The newest state of the object this notification is about.
    pub fn object(&self) -> &DynamicObject {
        match self {
            Notification::Added(obj) | Notification::Deleted(obj) => obj,
            Notification::Updated { new, .. } => new,
        }
    }
}

/// Callbacks for changes of watched objects.
///
/// The store is already updated when a callback runs. Callbacks for one
/// object are invoked in order, one at a time.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, _obj: &DynamicObject) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_update(&self, _old: &DynamicObject, _new: &DynamicObject) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_delete(&self, _obj: &DynamicObject) -> Result<(), HandlerError> {
        Ok(())
    }
}

type AddFn = Box<dyn Fn(&DynamicObject) -> Result<(), HandlerError> + Send + Sync>;
type UpdateFn = Box<dyn Fn(&DynamicObject, &DynamicObject) -> Result<(), HandlerError> + Send + Sync>;
type DeleteFn = AddFn;

/// An [`EventHandler`] built from closures, unset slots do nothing.
#[derive(Default)]
pub struct HandlerFuncs {
    add: Option<AddFn>,
    update: Option<UpdateFn>,
    delete: Option<DeleteFn>,
}

impl HandlerFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&DynamicObject) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&DynamicObject, &DynamicObject) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&DynamicObject) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.delete = Some(Box::new(f));
        self
    }
}

impl EventHandler for HandlerFuncs {
    fn on_add(&self, obj: &DynamicObject) -> Result<(), HandlerError> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> Result<(), HandlerError> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<(), HandlerError> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// Every registered handler, invoked in registration order.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl EventHandler + 'static) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Hand `notification` to every handler. A handler that fails or panics
    /// is logged and does not keep the others from running.
    pub fn dispatch(&self, notification: &Notification) {
        for handler in &self.handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| match notification {
                Notification::Added(obj) => handler.on_add(obj),
                Notification::Updated { old, new } => handler.on_update(old, new),
                Notification::Deleted(obj) => handler.on_delete(obj),
            }));

            let obj = notification.object();
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        message = "event handler failed",
                        %err,
                        name = obj.name(),
                        namespace = obj.namespace().unwrap_or_default(),
                    );
                }
                Err(panic) => {
                    error!(
                        message = "event handler panicked",
                        panic = panic_message(&*panic),
                        name = obj.name(),
                        namespace = obj.namespace().unwrap_or_default(),
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
