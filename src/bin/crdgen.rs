//! Prints the Bootstrap CustomResourceDefinition as YAML, for installing
//! the operator's own API type.

use kube::CustomResourceExt;

fn main() {
    let crd = crd_bootstrap::Bootstrap::crd();
    match serde_yaml::to_string(&crd) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => {
            eprintln!("failed to render CRD: {e}");
            std::process::exit(1);
        }
    }
}
