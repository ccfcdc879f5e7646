//! In-memory stand-ins for the API server, for tests only.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{Error, ErrorResponse, WatchEvent};
use crate::resource::{DynamicObject, ListMeta, ObjectList, ObjectMeta};
use crate::source::{ListWatch, WatchStream};

pub fn object(namespace: &str, name: &str, resource_version: &str) -> DynamicObject {
    object_with_labels(namespace, name, resource_version, &[])
}

pub fn object_with_labels(
    namespace: &str,
    name: &str,
    resource_version: &str,
    labels: &[(&str, &str)],
) -> DynamicObject {
    let mut data = serde_json::Map::new();
    data.insert("apiVersion".into(), "apps/v1".into());
    data.insert("kind".into(), "Deployment".into());

    DynamicObject {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        },
        data,
    }
}

/// The `ERROR` event an API server sends when the watched resource version
/// was compacted away.
pub fn expired_event() -> WatchEvent<DynamicObject> {
    WatchEvent::Error(ErrorResponse {
        status: "Failure".into(),
        message: "too old resource version".into(),
        reason: "Expired".into(),
        code: 410,
    })
}

pub fn expired_error() -> Error {
    Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: "the provided continue parameter is too old".into(),
        reason: "Expired".into(),
        code: 410,
    })
}

pub fn transport_error() -> Error {
    Error::ReadEvents(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

pub fn malformed_error() -> Error {
    let err = serde_json::from_str::<DynamicObject>("42").unwrap_err();
    Error::Deserialize(err)
}

/// A request the source received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    List,
    Watch(String),
}

enum WatchScript {
    Events(Vec<Result<WatchEvent<DynamicObject>, Error>>),
    Channel(mpsc::UnboundedReceiver<Result<WatchEvent<DynamicObject>, Error>>),
    Fail(Error),
}

#[derive(Default)]
struct Script {
    lists: VecDeque<Result<ObjectList<DynamicObject>, Error>>,
    watches: VecDeque<WatchScript>,
    calls: Vec<Call>,
}

/// A [`ListWatch`] which replays scripted responses in order.
///
/// Once a script runs out the request never completes, like a quiet
/// API server.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<DynamicObject>, resource_version: &str) {
        self.script.lock().lists.push_back(Ok(ObjectList {
            metadata: ListMeta {
                r#continue: None,
                resource_version: Some(resource_version.to_string()),
            },
            items,
        }));
    }

    pub fn push_list_error(&self, err: Error) {
        self.script.lock().lists.push_back(Err(err));
    }

    /// A watch which delivers `events` and is closed by the server afterwards.
    pub fn push_watch(&self, events: Vec<Result<WatchEvent<DynamicObject>, Error>>) {
        self.script
            .lock()
            .watches
            .push_back(WatchScript::Events(events));
    }

    /// A watch which stays open and delivers whatever is sent, it is closed
    /// when the sender is dropped.
    pub fn push_watch_channel(
        &self,
    ) -> mpsc::UnboundedSender<Result<WatchEvent<DynamicObject>, Error>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script
            .lock()
            .watches
            .push_back(WatchScript::Channel(rx));
        tx
    }

    /// A watch request which fails before any event.
    pub fn push_watch_error(&self, err: Error) {
        self.script.lock().watches.push_back(WatchScript::Fail(err));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().calls.clone()
    }
}

#[async_trait]
impl ListWatch for ScriptedSource {
    async fn list(&self) -> Result<ObjectList<DynamicObject>, Error> {
        let next = {
            let mut script = self.script.lock();
            script.calls.push(Call::List);
            script.lists.pop_front()
        };

        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, Error> {
        let next = {
            let mut script = self.script.lock();
            script.calls.push(Call::Watch(resource_version.to_string()));
            script.watches.pop_front()
        };

        match next {
            Some(WatchScript::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(WatchScript::Channel(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(WatchScript::Fail(err)) => Err(err),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}
