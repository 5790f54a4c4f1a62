//! `netwarden identity`: show the cluster identity this host would use.

use netwarden_cluster::ClusterSettings;
use netwarden_config::NetwardenConfig;

pub fn run(config: &NetwardenConfig) {
    let settings = ClusterSettings::from_config(&config.cluster);
    println!("instance id:     {}", settings.instance_id);
    println!("hostname:        {}", settings.hostname);
    println!("master priority: {}", settings.master_priority);
    println!("runner priority: {}", settings.runner_priority);
    println!("runner weight:   {}", settings.runner_weight);
    println!(
        "clustering:      {}",
        if config.cluster.enabled { "enabled" } else { "disabled" }
    );
}
