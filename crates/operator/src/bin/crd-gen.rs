use kube::CustomResourceExt;
use observability_operator::Observability;

fn main() -> anyhow::Result<()> {
    let crd = Observability::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{yaml}");
    Ok(())
}
