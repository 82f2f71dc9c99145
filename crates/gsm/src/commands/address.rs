use crate::utils;
use colored::Colorize;
use gsm_core::Fleet;

pub async fn pin(fleet: &Fleet, server: &str, allocation: Option<&str>) -> anyhow::Result<()> {
    let (record, address) = fleet.pin(server, allocation).await?;

    println!(
        "{}",
        format!("✓ {} pinned to {}", record.name, address.public_ip)
            .green()
            .bold()
    );
    println!("  allocation {}", address.allocation_id);
    println!(
        "  {}",
        "The address is billed while the server is paused".dimmed()
    );
    Ok(())
}

pub async fn unpin(fleet: &Fleet, server: &str, yes: bool) -> anyhow::Result<()> {
    if !yes {
        println!(
            "{}",
            "The address is released and cannot be recovered. Re-run with --yes to confirm."
                .yellow()
        );
    }
    let record = fleet.unpin(server, yes).await?;

    println!(
        "{}",
        format!("✓ {} unpinned", record.name).green().bold()
    );
    println!("  address {}", utils::opt(&record.public_ip));
    Ok(())
}

pub async fn list(fleet: &Fleet) -> anyhow::Result<()> {
    let listed = fleet.list_addresses().await?;
    utils::print_drift(&listed.drift);

    if listed.value.is_empty() {
        println!("{}", "No addresses".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<28} {:<18} {}", "ALLOCATION", "ADDRESS", "HOLDER").bold()
    );
    println!("{}", "─".repeat(70).dimmed());

    for address in &listed.value {
        let holder = match (&address.holder, address.associated) {
            (Some(holder), _) => holder.normal(),
            (None, true) => "associated, no server".yellow(),
            (None, false) => "unused (still billed)".yellow(),
        };
        println!(
            "{:<28} {:<18} {}",
            address.allocation_id, address.public_ip, holder
        );
    }
    Ok(())
}
