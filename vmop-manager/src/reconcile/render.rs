//! Everything the sub-reconcilers need to turn a VM's spec into rendered
//! Kubernetes objects. There is no templating engine: each sub-reconciler
//! builds its own typed `k8s_openapi` struct directly from this model, the
//! same way the rest of this operator builds child resources.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use vmop_types::VirtualMachine;

use crate::config::ReconcilerConfig;
use crate::model::VmDefinition;
use crate::util::annotations::{LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_NAME};
use crate::util::{APP_NAME, MANAGED_BY};

/// Inputs every sub-reconciler is handed for one reconcile pass.
pub struct RenderModel<'a> {
    pub vm: &'a VmDefinition,
    pub config: &'a ReconcilerConfig,
    pub operator_version: &'static str,
}

impl<'a> RenderModel<'a> {
    pub fn new(vm: &'a VmDefinition, config: &'a ReconcilerConfig) -> Self {
        Self {
            vm,
            config,
            operator_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.vm.namespace
    }

    pub fn vm_name(&self) -> &str {
        &self.vm.name
    }

    /// Management labels every child resource of this VM carries.
    pub fn labels(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), APP_NAME.to_string()),
            (LABEL_INSTANCE.to_string(), self.vm.name.clone()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_COMPONENT.to_string(), component.to_string()),
        ])
    }

    pub fn owner_reference(&self) -> OwnerReference {
        self.vm
            .object
            .controller_owner_ref(&())
            .expect("VirtualMachine is namespaced and has a uid")
    }
}

/// Parses a Kubernetes quantity string (`"4Gi"`, `"500m"`) into mebibytes,
/// applying the overcommit factor the way the runner config map expects it.
pub fn scaled_ram_mib(quantity: &str, overcommit: f64) -> Result<u64, crate::util::Error> {
    let bytes = parse_quantity_bytes(quantity)?;
    let mib = bytes as f64 / (1024.0 * 1024.0);
    Ok((mib * overcommit) as u64)
}

pub fn parse_quantity_bytes(quantity: &str) -> Result<u64, crate::util::Error> {
    let quantity = quantity.trim();
    let split_at = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split_at);
    let number: f64 = number
        .parse()
        .map_err(|_| crate::util::Error::Template(format!("invalid quantity: {quantity}")))?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        other => {
            return Err(crate::util::Error::Template(format!(
                "unsupported quantity suffix: {other}"
            )));
        }
    };
    Ok((number * multiplier) as u64)
}

pub fn vm_object(vm: &VmDefinition) -> &VirtualMachine {
    &vm.object
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity_bytes("40Gi").unwrap(), 40 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity_bytes("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity_bytes("1024").unwrap(), 1024);
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(parse_quantity_bytes("4Xi").is_err());
    }
}
