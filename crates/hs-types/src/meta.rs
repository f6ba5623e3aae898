//! Object metadata shared by every stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Label carried by every Trial and Suggestion pointing at its Experiment.
pub const LABEL_EXPERIMENT_NAME: &str = "hypersearch.io/experiment";
/// Label carried by runtime sub-resources pointing at their Suggestion.
pub const LABEL_SUGGESTION_NAME: &str = "hypersearch.io/suggestion";
/// Label selecting the pods of a suggestion deployment.
pub const LABEL_DEPLOYMENT_NAME: &str = "hypersearch.io/deployment";

/// Namespaced identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Points a dependent record at the record that controls it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Option<Uuid>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Whether every `selector` entry is present with the same value.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|l| l == v).unwrap_or(false))
    }

    /// Owner reference pointing at this record.
    pub fn owner_reference(&self, kind: &str) -> Option<OwnerReference> {
        self.uid.map(|uid| OwnerReference {
            kind: kind.to_string(),
            name: self.name.clone(),
            uid,
        })
    }
}

/// A record kept by the resource store: metadata plus a spec document and,
/// for most kinds, a controller-authored status document.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copy the status document of `other` onto `self`, leaving metadata and
    /// spec untouched.
    fn replace_status(&mut self, other: &Self);

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

/// Implement [`Resource`] for a record with `meta` and optional `status` fields.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl $crate::meta::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::meta::ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::meta::ObjectMeta {
                &mut self.meta
            }

            fn replace_status(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
    ($ty:ty, $kind:literal, stateless) => {
        impl $crate::meta::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::meta::ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::meta::ObjectMeta {
                &mut self.meta
            }

            fn replace_status(&mut self, _other: &Self) {}
        }
    };
}
