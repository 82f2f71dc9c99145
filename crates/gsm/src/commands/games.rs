use colored::Colorize;
use gsm_core::{Catalog, Runtime};

pub fn handle(catalog: &Catalog) {
    println!(
        "{}",
        format!(
            "{:<12} {:<16} {:<12} {:<8} {:<24} {}",
            "GAME", "NAME", "INSTANCE", "DISK", "PORTS", "REQUIRED"
        )
        .bold()
    );
    println!("{}", "─".repeat(90).dimmed());

    for definition in catalog.iter() {
        let ports: Vec<String> = definition.ports.iter().map(|p| p.spec()).collect();
        let required = if definition.required_config.is_empty() {
            "-".to_string()
        } else {
            definition.required_config.join(",")
        };
        let kind = match &definition.runtime {
            Runtime::Docker { .. } => "",
            Runtime::Agent { .. } => " (agent)",
        };

        println!(
            "{:<12} {:<16} {:<12} {:<8} {:<24} {}",
            definition.name.cyan(),
            format!("{}{}", definition.display_name, kind),
            definition.default_instance_type,
            format!("{}GB", definition.disk_size_gb),
            ports.join(" "),
            required.yellow()
        );
    }
}
