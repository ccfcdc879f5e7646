use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors from parsing a `resource.version.group` argument
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid resource \"{0}\", expected the form resource.version.group")]
    Format(String),

    #[error("resource name of \"{0}\" is empty")]
    EmptyResource(String),

    #[error("resource version of \"{0}\" is empty")]
    EmptyVersion(String),
}

/// Identifies a resource type served by the API server, e.g. `deployments.v1.apps`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ApiResource {
    /// The group of the resource, or the empty string for the core group.
    pub group: String,

    /// The version of the resource.
    pub version: String,

    /// The plural of this resource, which is used to construct URLs
    pub plural: String,
}

impl ApiResource {
    /// Creates a url path for http requests for this resource
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };

        match namespace {
            Some(namespace) => format!("{prefix}/namespaces/{namespace}/{}", self.plural),
            None => format!("{prefix}/{}", self.plural),
        }
    }
}

impl FromStr for ApiResource {
    type Err = ParseError;

    /// Parses `resource.version.group`. The group may contain dots itself, so only
    /// the first two separators are significant. Core group resources are written
    /// with a trailing dot, e.g. `pods.v1.`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let (Some(plural), Some(version), Some(group)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::Format(s.to_string()));
        };

        if plural.is_empty() {
            return Err(ParseError::EmptyResource(s.to_string()));
        }
        if version.is_empty() {
            return Err(ParseError::EmptyVersion(s.to_string()));
        }

        Ok(ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
        })
    }
}

impl Display for ApiResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.plural, self.version, self.group)
    }
}

/// The subset of `ObjectMeta` this crate looks at. Everything else of an object
/// is kept untyped in [`DynamicObject::data`].
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#objectmeta-v1-meta
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ObjectMeta {
    /// Name must be unique within a namespace.
    #[serde(default)]
    pub name: String,

    /// Namespace defines the space within which each name must be unique. Empty
    /// for cluster scoped resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// UID is the unique in time and space value for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// An opaque value that represents the internal version of this object.
    #[serde(
        default,
        rename = "resourceVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// ListMeta describes metadata that synthetic resources must have, including lists
/// and various status objects.
#[derive(Debug, Default, Deserialize)]
pub struct ListMeta {
    /// continue may be set if the user set a limit on the number of items returned,
    /// and indicates that the server has more data available.
    #[serde(default, rename = "continue")]
    pub r#continue: Option<String>,

    /// String that identifies the server's internal version of this object.
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

/// A generic Kubernetes object list
///
/// This is used instead of a full struct for `DeploymentList`, `PodList`, etc.
#[derive(Debug, Deserialize)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion` and `continue`
    #[serde(default)]
    pub metadata: ListMeta,

    /// These items we are actually interested in.
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// A resource object of any type, only its metadata is understood.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DynamicObject {
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// `apiVersion`, `kind`, `spec`, `status` and everything else, untouched.
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl DynamicObject {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

/// Index of an object within one resource type, `namespace/name` or just `name`
/// for cluster scoped objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(namespace) if !namespace.is_empty() => ObjectKey(format!("{namespace}/{name}")),
            _ => ObjectKey(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compares two resource versions.
///
/// Resource versions are opaque to clients, but every API server in practice
/// hands out etcd revisions, so when both sides are integers they are compared
/// numerically. `None` means the versions can't be ordered.
pub fn compare_resource_versions(a: &str, b: &str) -> Option<Ordering> {
    if a == b {
        return Some(Ordering::Equal);
    }

    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}
