use thiserror::Error;

pub mod nad;
pub mod setting;
pub mod v1alpha1;

use kube::CustomResourceExt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("vlan id {0} out of range 1-4094")]
    InvalidVlan(u16),
}

pub fn crd_gen_hostnetwork() -> Result<()> {
    print!(
        "---\n{}",
        serde_yaml::to_string(&v1alpha1::hostnetwork::HostNetwork::crd())?
    );
    Ok(())
}

pub fn crd_gen_all() -> Result<()> {
    let crds = vec![
        v1alpha1::hostnetwork::HostNetwork::crd(),
        nad::NetworkAttachmentDefinition::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
