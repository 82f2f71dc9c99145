use colored::Colorize;
use gsm_core::Fleet;

pub async fn create(fleet: &Fleet, server: &str) -> anyhow::Result<()> {
    println!("{}", format!("Snapshotting {}...", server).blue());
    let snapshot = fleet.snapshot(server).await?;

    println!(
        "{}",
        format!("✓ Snapshot {} ({})", snapshot.id, snapshot.snapshot_id)
            .green()
            .bold()
    );
    println!(
        "  {}",
        format!(
            "Restore with `gsm launch --from-snapshot {} --name <name>`",
            snapshot.id
        )
        .dimmed()
    );
    Ok(())
}

pub async fn list(fleet: &Fleet) -> anyhow::Result<()> {
    let listed = fleet.list_snapshots().await?;
    crate::utils::print_drift(&listed.drift);

    if listed.value.is_empty() {
        println!("{}", "No snapshots".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<14} {:<24} {:<20} {:<10} {:<8} {}",
            "ID", "SNAPSHOT", "SOURCE", "GAME", "SIZE", "CREATED"
        )
        .bold()
    );
    println!("{}", "─".repeat(100).dimmed());

    for snapshot in &listed.value {
        println!(
            "{:<14} {:<24} {:<20} {:<10} {:<8} {}",
            snapshot.id,
            snapshot.snapshot_id,
            snapshot.source_server_name,
            snapshot.game,
            format!("{}GB", snapshot.size_gb),
            snapshot.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn delete(fleet: &Fleet, snapshot: &str) -> anyhow::Result<()> {
    let deleted = fleet.delete_snapshot(snapshot).await?;
    println!(
        "{}",
        format!("✓ Deleted snapshot {} ({})", deleted.id, deleted.snapshot_id)
            .green()
            .bold()
    );
    Ok(())
}
