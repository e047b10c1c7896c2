use kube::CustomResourceExt;

use apim_operator::resources::apidefinitions::ApiDefinition;
use apim_operator::resources::managementcontexts::ManagementContext;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ManagementContext::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ApiDefinition::crd())?);
    Ok(())
}
