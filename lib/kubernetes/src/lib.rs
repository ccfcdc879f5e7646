mod client;
mod config;
mod controller;
mod handler;
mod informer;
mod queue;
mod reflector;
mod resource;
mod source;
mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{
    Bookmark, BookmarkMeta, Client, Error, ErrorResponse, ListParams, MAX_WATCH_TIMEOUT, Version,
    WatchEvent, WatchParams,
};
pub use config::{Auth, Config, Error as ConfigError, KUBECONFIG};
pub use controller::Controller;
pub use handler::{EventHandler, HandlerError, HandlerFuncs, Notification, Registry};
pub use informer::Informer;
pub use queue::{Delta, DeltaFifo, DeltaKind};
pub use reflector::{Reflector, default_backoff};
pub use resource::{
    ApiResource, DynamicObject, ListMeta, ObjectKey, ObjectList, ObjectMeta, ParseError,
    compare_resource_versions,
};
pub use source::{Api, ListWatch, WatchStream};
pub use store::Store;
