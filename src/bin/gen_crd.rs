//! Print the CanaryRelease CRD as YAML, for applying out-of-band.

use kube::CustomResourceExt;
use peippo::crd::CanaryRelease;

fn main() -> anyhow::Result<()> {
    let crd = CanaryRelease::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
