use crate::utils;
use colored::Colorize;
use gsm_core::Fleet;

pub async fn pause(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    println!("{}", format!("Pausing {}...", server).yellow());
    let record = fleet.pause(server).await?;

    println!(
        "{}",
        format!("✓ {} is paused", record.name).green().bold()
    );
    if record.is_pinned() {
        println!("  Address {} stays reserved", utils::opt(&record.public_ip).cyan());
    }
    Ok(())
}

pub async fn resume(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    println!("{}", format!("Resuming {}...", server).blue());
    let record = fleet.resume(server).await?;

    println!(
        "{}",
        format!("✓ {} is running", record.name).green().bold()
    );
    if let Some(connect) = record.connection_string() {
        println!("  Connect to {}", connect.cyan());
    }
    Ok(())
}

pub async fn stop(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    println!("{}", format!("Stopping the game on {}...", server).yellow());
    let record = fleet.stop(server).await?;

    println!(
        "{}",
        format!("✓ {} stopped (instance still running)", record.name)
            .green()
            .bold()
    );
    println!(
        "  {}",
        format!("Run `gsm resume {}` to start it again", record.name).dimmed()
    );
    Ok(())
}

pub async fn destroy(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    println!("{}", format!("Destroying {}...", server).red());
    let record = fleet.destroy(server).await?;

    println!(
        "{}",
        format!("✓ {} destroyed", record.name).green().bold()
    );
    Ok(())
}
