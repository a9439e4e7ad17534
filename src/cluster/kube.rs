use crate::errors::Error;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use std::path::Path;
use tracing::{debug, instrument};

async fn load(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::Kubeconfig(path.to_path_buf(), e.to_string()))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Kubeconfig(path.to_path_buf(), e.to_string()))
}

/// Build a client from the kubeconfig `talosctl kubeconfig` wrote, not from the ambient
/// environment
pub async fn client_from(path: &Path) -> Result<Client, Error> {
    Ok(Client::try_from(load(path).await?)?)
}

/// `host:port` of the API server the kubeconfig's current context talks to
pub async fn api_server_of(path: &Path) -> Result<String, Error> {
    load(path)
        .await?
        .cluster_url
        .authority()
        .map(|authority| authority.as_str().to_string())
        .ok_or_else(|| Error::Kubeconfig(path.to_path_buf(), String::from("server has no host")))
}

pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Number of registered nodes reporting `Ready=True`
#[instrument]
pub async fn count_ready_nodes(kubeconfig: &Path) -> Result<usize, Error> {
    let nodes: Api<Node> = Api::all(client_from(kubeconfig).await?);
    let list = nodes.list(&ListParams::default()).await?;
    let ready = list.items.iter().filter(|node| node_is_ready(node)).count();
    debug!("{ready} of {} nodes Ready", list.items.len());
    Ok(ready)
}
