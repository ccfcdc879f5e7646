//! List pods once, then follow their changes with plain list/watch calls.
//!
//! cargo run -p kubernetes --example list_watch [namespace]

use futures::StreamExt;
use kubernetes::{Api, ApiResource, Client, ListWatch, WatchEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let client = Client::infer()?;
    match client.version().await {
        Ok(version) => println!("api server {}.{}", version.major, version.minor),
        Err(err) => println!("get version failed, {err}"),
    }

    let pods = "pods.v1.".parse::<ApiResource>()?;
    let api = match std::env::args().nth(1) {
        Some(namespace) => Api::namespaced(client, pods, namespace),
        None => Api::all(client, pods),
    }
    .page_size(2);

    let list = api.list().await?;
    for pod in &list.items {
        println!("{}", pod.key());
    }

    let mut resource_version = list.metadata.resource_version.unwrap_or_default();
    println!("list done, resource version {resource_version}");

    loop {
        let mut stream = api.watch(&resource_version).await?;

        while let Some(result) = stream.next().await {
            let pod = match result {
                Ok(WatchEvent::Added(pod)) => {
                    println!("add pod: {}", pod.key());
                    pod
                }
                Ok(WatchEvent::Modified(pod)) => {
                    println!("modify pod: {}", pod.key());
                    pod
                }
                Ok(WatchEvent::Deleted(pod)) => {
                    println!("delete pod: {}", pod.key());
                    pod
                }
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    resource_version = bookmark.metadata.resource_version;
                    println!("bookmark: {resource_version}");
                    continue;
                }
                Ok(WatchEvent::Error(err)) => {
                    println!("error event: {err:?}");
                    return Ok(());
                }
                Err(err) => {
                    println!("poll next {err}");
                    continue;
                }
            };

            if let Some(rv) = pod.resource_version() {
                resource_version = rv.to_string();
            }
        }

        println!("watch timeout, re-watching pods...")
    }
}
