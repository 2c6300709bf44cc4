//! Cluster-wide settings of the virtualization platform. Only read here.

use std::borrow::Cow;

use k8s_openapi::ClusterResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the setting selecting the VLAN uplink.
pub const DEFAULT_NETWORK_SETTING: &str = "vlan";

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
pub struct Setting {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub default: String,
}

impl Resource for Setting {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Setting".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "harvester.cattle.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1alpha1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "settings".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Decoded value of the network setting.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
pub struct NetworkSetting {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub nic: String,
}

impl Setting {
    /// `value` when set, the platform default otherwise.
    pub fn effective_value(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }

    pub fn network_setting(&self) -> Result<NetworkSetting> {
        let value = self.effective_value().trim();
        if value.is_empty() {
            return Ok(NetworkSetting::default());
        }
        serde_json::from_str(value).map_err(|source| Error::Decode {
            what: "network setting",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(value: &str, default: &str) -> Setting {
        Setting {
            metadata: ObjectMeta {
                name: Some(DEFAULT_NETWORK_SETTING.into()),
                ..Default::default()
            },
            value: value.into(),
            default: default.into(),
        }
    }

    #[test]
    fn test_value_overrides_default() {
        let s = setting(r#"{"enable":true,"nic":"eth1"}"#, r#"{"enable":false,"nic":""}"#);
        assert_eq!(
            s.network_setting().unwrap(),
            NetworkSetting {
                enable: true,
                nic: "eth1".into()
            }
        );
    }

    #[test]
    fn test_falls_back_to_default() {
        let s = setting("", r#"{"enable":false,"nic":"eth2"}"#);
        assert_eq!(s.network_setting().unwrap().nic, "eth2");
        assert_eq!(setting("", "").network_setting().unwrap(), NetworkSetting::default());
    }

    #[test]
    fn test_bad_value_is_an_error() {
        assert!(matches!(
            setting("eth1", "").network_setting(),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_resource_identity() {
        assert_eq!(Setting::api_version(&()), "harvester.cattle.io/v1alpha1");
        assert_eq!(Setting::plural(&()), "settings");
    }

    #[test]
    fn test_deserializes_platform_object() {
        let s: Setting = serde_json::from_value(serde_json::json!({
            "apiVersion": "harvester.cattle.io/v1alpha1",
            "kind": "Setting",
            "metadata": {"name": "vlan"},
            "default": "{\"enable\":false,\"nic\":\"\"}",
            "value": "{\"enable\":true,\"nic\":\"eth1\"}"
        }))
        .unwrap();
        assert_eq!(s.network_setting().unwrap().nic, "eth1");
    }

    #[test]
    fn test_settings_compare_by_content() {
        let a = setting(r#"{"enable":true,"nic":"eth1"}"#, "");
        assert_eq!(a, a.clone());
        assert_ne!(a, setting(r#"{"enable":true,"nic":"eth2"}"#, ""));
    }
}
