//! Prints the CustomResourceDefinitions of this workspace as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds.yaml`

use crds::Pool;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Pool::crd())?);
    Ok(())
}
