//! Drift-based reconciliation of child resources
//!
//! A [`Builder`] produces the desired object. [`reconcile`] creates it when
//! missing and otherwise hands the pair to a [`Persister`], which decides
//! whether the live object drifted and patches it if so.

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::resources::common::{FIELD_MANAGER, annotations};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot build {kind} {name}: {reason}")]
    InvalidSpec {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

/// Produces the desired state of one child object
pub trait Builder {
    type Object: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned;

    /// Name of the object this builder manages
    fn resource_name(&self) -> String;

    /// Desired object, including metadata and owner reference
    fn build(&self) -> Result<Self::Object, ResourceError>;
}

/// How drift between desired and live objects is detected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persister {
    /// Every field the builder sets must match the live object
    Default,
    /// Compare a hash of the desired object stored in an annotation
    Annotating,
}

impl Persister {
    /// Whether `existing` needs to be updated to match `desired`
    pub fn drifted<T: Serialize + Resource>(&self, existing: &T, desired: &T) -> Result<bool, ResourceError> {
        match self {
            Persister::Default => {
                let desired = comparable(serde_json::to_value(desired)?);
                let existing = serde_json::to_value(existing)?;
                Ok(!is_subset(&desired, &existing))
            }
            Persister::Annotating => {
                let current = existing
                    .meta()
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(annotations::LAST_APPLIED_HASH));
                let wanted = desired
                    .meta()
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(annotations::LAST_APPLIED_HASH));
                Ok(current.is_none() || current != wanted)
            }
        }
    }

    /// Prepare the desired object before it is written
    fn prepare<T: Serialize + Resource>(&self, desired: &mut T) -> Result<(), ResourceError> {
        if *self == Persister::Annotating {
            let hash = spec_hash(desired)?;
            desired
                .meta_mut()
                .annotations
                .get_or_insert_with(Default::default)
                .insert(annotations::LAST_APPLIED_HASH.to_string(), hash);
        }
        Ok(())
    }
}

/// SHA-256 over the serialized object, ignoring any previous hash annotation
pub fn spec_hash<T: Serialize>(object: &T) -> Result<String, ResourceError> {
    let mut value = serde_json::to_value(object)?;
    if let Some(metadata) = value.pointer_mut("/metadata").and_then(Value::as_object_mut) {
        // Without the hash an empty map and no map at all must hash alike
        let now_empty = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
            .is_some_and(|a| {
                a.remove(annotations::LAST_APPLIED_HASH);
                a.is_empty()
            });
        if now_empty {
            metadata.remove("annotations");
        }
    }
    let bytes = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Create the object if missing, update it if drifted. Returns whether
/// anything was written.
pub async fn reconcile<B: Builder>(
    client: &Client,
    namespace: &str,
    builder: &B,
    persister: Persister,
) -> Result<bool, ResourceError> {
    let api: Api<B::Object> = Api::namespaced(client.clone(), namespace);
    let name = builder.resource_name();
    let mut desired = builder.build()?;
    persister.prepare(&mut desired)?;

    let Some(existing) = api.get_opt(&name).await? else {
        api.create(&PostParams::default(), &desired).await?;
        info!(kind = %<B::Object as Resource>::kind(&()), %name, "created resource");
        return Ok(true);
    };

    if !persister.drifted(&existing, &desired)? {
        debug!(kind = %<B::Object as Resource>::kind(&()), %name, "resource up to date");
        return Ok(false);
    }

    // Guard the write with the observed resourceVersion
    desired.meta_mut().resource_version = existing.resource_version();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&desired),
    )
    .await?;
    info!(kind = %<B::Object as Resource>::kind(&()), %name, "updated drifted resource");
    Ok(true)
}

/// Whether reconciling would write anything, without writing
pub async fn needs_update<B: Builder>(
    client: &Client,
    namespace: &str,
    builder: &B,
    persister: Persister,
) -> Result<bool, ResourceError> {
    let api: Api<B::Object> = Api::namespaced(client.clone(), namespace);
    let mut desired = builder.build()?;
    persister.prepare(&mut desired)?;

    match api.get_opt(&builder.resource_name()).await? {
        None => Ok(true),
        Some(existing) => persister.drifted(&existing, &desired),
    }
}

/// Drop fields that are server-owned or irrelevant to drift
fn comparable(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for key in [
                "resourceVersion",
                "uid",
                "creationTimestamp",
                "generation",
                "managedFields",
            ] {
                meta.remove(key);
            }
        }
        if let Some(spec) = obj.get_mut("spec").and_then(Value::as_object_mut) {
            spec.remove("clusterIP");
            spec.remove("clusterIPs");
        }
    }
    value
}

/// Every field set in `desired` has the same value in `existing`
pub fn is_subset(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(d), Value::Object(e)) => d
            .iter()
            .all(|(k, dv)| dv.is_null() || e.get(k).is_some_and(|ev| is_subset(dv, ev))),
        (Value::Array(d), Value::Array(e)) => {
            d.len() == e.len() && d.iter().zip(e).all(|(dv, ev)| is_subset(dv, ev))
        }
        (d, e) => d == e,
    }
}
