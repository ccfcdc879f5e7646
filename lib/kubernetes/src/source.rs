use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::client::{Client, Error, ListParams, WatchEvent, WatchParams};
use crate::resource::{ApiResource, DynamicObject, ObjectList};

pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>, Error>>;

/// Where a reflector gets its objects from.
///
/// `list` returns the complete collection, `watch` a stream of changes
/// since `resource_version`. The stream ends whenever the server decides
/// to close it, that is not an error.
#[async_trait]
pub trait ListWatch: Send + Sync {
    async fn list(&self) -> Result<ObjectList<DynamicObject>, Error>;

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, Error>;
}

/// List and watch one resource type of a real API server.
#[derive(Clone)]
pub struct Api {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    page_size: u32,
    timeout: u32,
    bookmarks: bool,
}

impl Api {
    /// Watch `resource` in every namespace.
    pub fn all(client: Client, resource: ApiResource) -> Self {
        Api {
            client,
            resource,
            namespace: None,
            label_selector: None,
            field_selector: None,
            page_size: 500,
            timeout: 290,
            bookmarks: true,
        }
    }

    /// Watch `resource` in one namespace only.
    pub fn namespaced(client: Client, resource: ApiResource, namespace: impl Into<String>) -> Self {
        Api {
            namespace: Some(namespace.into()),
            ..Api::all(client, resource)
        }
    }

    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    /// Items per list request, `0` disables pagination.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Server side timeout of a single watch request in seconds.
    pub fn timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bookmarks(mut self, enabled: bool) -> Self {
        self.bookmarks = enabled;
        self
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn path(&self) -> String {
        self.resource.url_path(self.namespace.as_deref())
    }

    fn list_params(&self) -> ListParams {
        ListParams {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            limit: (self.page_size > 0).then_some(self.page_size),
            continue_token: None,
        }
    }
}

/// Fetch every page of a collection, following continue tokens. The
/// returned list carries the metadata of the last page.
///
/// The continue token of a long pagination can expire before the last page,
/// then a single unpaginated request still gives a consistent snapshot.
async fn list_pages<F, Fut>(
    params: ListParams,
    mut fetch: F,
) -> Result<ObjectList<DynamicObject>, Error>
where
    F: FnMut(ListParams) -> Fut,
    Fut: Future<Output = Result<ObjectList<DynamicObject>, Error>>,
{
    let paginated = params.limit.is_some();
    let mut next = params.clone();
    let mut items = Vec::new();

    let result = loop {
        let page = match fetch(next.clone()).await {
            Ok(page) => page,
            Err(err) => break Err(err),
        };
        items.extend(page.items);

        match page.metadata.r#continue {
            Some(token) if !token.is_empty() => {
                debug!(message = "fetch next page", items = items.len());
                next.continue_token = Some(token);
            }
            _ => {
                break Ok(ObjectList {
                    metadata: page.metadata,
                    items,
                });
            }
        }
    };

    match result {
        Err(err) if err.is_expired() && paginated => {
            warn!(message = "continue token expired, fall back to a full list", %err);

            fetch(ListParams {
                limit: None,
                continue_token: None,
                ..params
            })
            .await
        }
        result => result,
    }
}

#[async_trait]
impl ListWatch for Api {
    async fn list(&self) -> Result<ObjectList<DynamicObject>, Error> {
        let path = self.path();
        let client = &self.client;

        list_pages(self.list_params(), |params| {
            let path = path.as_str();
            async move { client.list::<DynamicObject>(path, &params).await }
        })
        .await
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream, Error> {
        let params = WatchParams {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            timeout: Some(self.timeout),
            bookmarks: self.bookmarks,
        };

        self.client
            .watch::<DynamicObject>(&self.path(), &params, resource_version)
            .await
    }
}
