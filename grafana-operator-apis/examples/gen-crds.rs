use grafana_operator_apis::{Grafana, GrafanaDashboard, GrafanaNotificationChannel};
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Grafana::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&GrafanaDashboard::crd()).unwrap());
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&GrafanaNotificationChannel::crd()).unwrap()
    );
}
