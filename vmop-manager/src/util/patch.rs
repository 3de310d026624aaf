use super::{CONFLICT_RETRY_BUDGET, FIELD_MANAGER};
use crate::util::Error;
use kube::{
    Api, Client,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// Applies `f` to a freshly fetched copy of `name`'s status and patches only
/// the resulting diff. Retries on `409 Conflict` by refetching and
/// re-applying `f`, up to [`CONFLICT_RETRY_BUDGET`] attempts, since another
/// writer (or our own previous pass) may have advanced `resourceVersion`
/// between the read and the write.
pub async fn patch_status<T>(
    client: &Client,
    namespace: &str,
    name: &str,
    mut f: impl FnMut(&mut T),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        let current = api.get_status(name).await?;
        let mut modified = current.clone();
        f(&mut modified);

        let patch = Patch::Json::<T>(json_patch::diff(
            &serde_json::to_value(&current)?,
            &serde_json::to_value(&modified)?,
        ));
        match api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &patch)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < CONFLICT_RETRY_BUDGET => {
                attempt += 1;
                continue;
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                return Err(Error::ConflictRetriesExhausted(
                    CONFLICT_RETRY_BUDGET,
                    format!("{namespace}/{name}"),
                ));
            }
            Err(source) => return Err(source.into()),
        }
    }
}

/// Applies `f` to a freshly fetched copy of `name`'s spec/metadata and
/// patches only the resulting diff. Same conflict-retry policy as
/// [`patch_status`].
pub async fn patch_object<T>(
    client: &Client,
    namespace: &str,
    name: &str,
    mut f: impl FnMut(&mut T),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        let current = api.get(name).await?;
        let mut modified = current.clone();
        f(&mut modified);

        let patch = Patch::Json::<T>(json_patch::diff(
            &serde_json::to_value(&current)?,
            &serde_json::to_value(&modified)?,
        ));
        match api.patch(name, &PatchParams::apply(FIELD_MANAGER), &patch).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < CONFLICT_RETRY_BUDGET => {
                attempt += 1;
                continue;
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                return Err(Error::ConflictRetriesExhausted(
                    CONFLICT_RETRY_BUDGET,
                    format!("{namespace}/{name}"),
                ));
            }
            Err(source) => return Err(source.into()),
        }
    }
}
