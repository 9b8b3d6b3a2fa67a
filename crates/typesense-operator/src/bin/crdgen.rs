use kube::core::CustomResourceExt;
use typesense_operator::crds::cluster::TypesenseCluster;

fn main() {
    let crd = TypesenseCluster::crd();
    println!("{}", serde_yaml::to_string(&crd).expect("serialize crd"));
}
