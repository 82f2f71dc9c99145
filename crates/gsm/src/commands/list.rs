use crate::utils;
use colored::Colorize;
use gsm_core::Fleet;

pub async fn list(fleet: &Fleet) -> anyhow::Result<()> {
    let listed = fleet.list().await?;
    utils::print_drift(&listed.drift);

    if listed.value.is_empty() {
        println!("{}", "No servers".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<14} {:<20} {:<10} {:<18} {:<22} {}",
            "ID", "NAME", "GAME", "STATUS", "ADDRESS", "INSTANCE"
        )
        .bold()
    );
    println!("{}", "─".repeat(105).dimmed());

    for record in &listed.value {
        let address = match record.connection_string() {
            Some(connect) if record.is_pinned() => format!("{} *", connect),
            Some(connect) => connect,
            None => "-".to_string(),
        };
        println!(
            "{:<14} {:<20} {:<10} {:<18} {:<22} {}",
            record.id,
            record.name,
            record.game,
            utils::status_colored(record.status),
            address,
            utils::opt(&record.instance_id)
        );
    }
    Ok(())
}

pub async fn info(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    let info = fleet.info(server).await?;
    utils::print_drift(&info.drift);
    utils::print_record(&info.value);
    Ok(())
}
