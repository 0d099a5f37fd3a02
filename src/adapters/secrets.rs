//! Backend secret lookup

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::error::{Error, Result};

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .get(name)
        .await
        .map_err(|e| match e {
            kube::Error::Api(api_err) if api_err.code == 404 => {
                Error::SecretNotFound(format!("{}/{}", namespace, name))
            }
            other => Error::Kube(other),
        })
}

/// Ensure the repository secret of a backend exists and is readable
pub async fn ensure_backend_secret(
    client: &Client,
    namespace: &str,
    storage_secret_name: &str,
    owner: &str,
) -> Result<()> {
    if storage_secret_name.is_empty() {
        return Err(Error::validation(format!(
            "Missing repository secret name for {}",
            owner
        )));
    }
    get_secret(client, storage_secret_name, namespace).await?;
    Ok(())
}
