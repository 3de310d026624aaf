use kube::CustomResourceExt;
use std::fs;
use vmop_types::{VirtualMachine, VmPool};

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/vmoperator.jdrupes.org_virtualmachines_crd.yaml",
        serde_yaml::to_string(&VirtualMachine::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/vmoperator.jdrupes.org_vmpools_crd.yaml",
        serde_yaml::to_string(&VmPool::crd()).unwrap(),
    )
    .unwrap();
}
