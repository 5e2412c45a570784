//! Host and backend report, `diplo status`.

use anyhow::Result;
use console::style;
use diplo::config::DiploConfig;
use diplo::runtime::factory::RuntimeSettings;
use diplo::runtime::{RuntimeFactory, RuntimeProvider, RuntimeType};

pub async fn cmd_status(config: &DiploConfig) -> Result<()> {
    let factory = RuntimeFactory::detect(RuntimeSettings {
        docker: config.docker.clone(),
        lxc: config.lxc.clone(),
    })
    .await;
    let report = factory.report().await;
    let system = &report.system;

    println!();
    println!("{}", style("Host").bold());
    println!("  os:           {} ({})", system.os, system.arch);
    if !system.distribution.is_empty() {
        println!("  distribution: {} {}", system.distribution, system.version);
    }
    println!("  hostname:     {}", system.hostname);
    println!(
        "  container: {}  vm: {}  arm: {}  raspberry pi: {}",
        system.is_container, system.is_vm, system.is_arm, system.is_raspberry
    );
    println!();
    println!("{}", style("Backends").bold());
    for runtime_type in RuntimeType::ALL {
        let available = report.available.contains(&runtime_type);
        let mark = if available {
            style("available").green()
        } else {
            style("unavailable").dim()
        };
        let preferred = if runtime_type == report.preferred {
            " (preferred)"
        } else {
            ""
        };
        println!("  {:<12} {}{}", runtime_type.to_string(), mark, preferred);
    }
    for info in factory.runtime_infos().await {
        println!(
            "  {:<12} version {} ({}/{})",
            info.runtime_type.to_string(),
            info.version,
            info.os,
            info.architecture
        );
    }
    println!();
    for warning in config.validate() {
        println!("{} {}", style("warning:").yellow(), warning);
    }
    Ok(())
}
