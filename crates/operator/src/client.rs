//! Data-plane client shared by the bootstrapper, the termination handler and
//! the reconcilers.
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::scheme::Scheme;

/// Identity of a namespaced object: (kind, name, namespace).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ObjectKey {
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{} {}/{}", self.kind, self.namespace, self.name) }
}

/// Bound for every namespaced object the client can move over the wire.
pub trait ClusterObject: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<K> ClusterObject for K where K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

#[async_trait]
pub trait DataClient: Clone + Send + Sync + 'static {
    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K>;
    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<()>;
    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<Option<K>>;
}

/// [`DataClient`] backed by the API server. Refuses kinds missing from the
/// scheme so that registration always precedes use.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    scheme: Arc<Scheme>,
}

impl KubeClient {
    pub fn new(client: Client, scheme: Arc<Scheme>) -> Self { Self { client, scheme } }

    pub fn inner(&self) -> &Client { &self.client }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Result<Api<K>> {
        self.scheme.require::<K>()?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

#[async_trait]
impl DataClient for KubeClient {
    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let api = self.api::<K>(&key.namespace)?;
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::AlreadyExists { kind: key.kind, name: key.name, namespace: key.namespace })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<()> {
        let key = ObjectKey::of(obj);
        let api = self.api::<K>(&key.namespace)?;
        api.delete(&key.name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn get<K: ClusterObject>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        let api = self.api::<K>(namespace)?;
        Ok(api.get_opt(name).await?)
    }
}
