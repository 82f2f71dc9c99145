use crate::utils;
use colored::Colorize;
use gsm_core::{Fleet, LaunchRequest, config};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Turn the launch arguments into a request, rejecting malformed overrides
pub fn request(
    game: Option<String>,
    name: Option<String>,
    instance_type: Option<String>,
    overrides: &[String],
    config_file: Option<PathBuf>,
    from_snapshot: Option<String>,
    pin: bool,
) -> anyhow::Result<LaunchRequest> {
    if game.is_none() && from_snapshot.is_none() {
        anyhow::bail!("Specify a game to launch (see `gsm games`) or --from-snapshot");
    }

    let overrides = overrides
        .iter()
        .map(|pair| config::parse_override(pair))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(LaunchRequest {
        game: game.unwrap_or_default(),
        name,
        instance_type,
        config_file,
        overrides,
        from_snapshot,
        pin,
    })
}

pub async fn handle(fleet: &Fleet, request: &LaunchRequest) -> anyhow::Result<()> {
    match &request.from_snapshot {
        Some(snapshot) => println!(
            "{}",
            format!("Restoring snapshot {} in {}...", snapshot, fleet.region()).blue()
        ),
        None => println!(
            "{}",
            format!("Launching {} in {}...", request.game, fleet.region()).blue()
        ),
    }

    let launched = fleet.launch(request).await?;
    utils::print_drift(&launched.drift);

    let record = launched.value;
    println!();
    println!(
        "{}",
        format!("✓ {} is running", record.name).green().bold()
    );
    if let Some(connect) = record.connection_string() {
        println!("  Connect to {}", connect.cyan());
    }
    println!();
    utils::print_record(&record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_arguments() {
        let request = request(
            Some("factorio".to_string()),
            Some("alpha".to_string()),
            None,
            &["SAVE_NAME=world".to_string(), "A=b=c".to_string()],
            None,
            None,
            true,
        )
        .unwrap();

        assert_eq!(request.game, "factorio");
        assert_eq!(request.overrides["SAVE_NAME"], "world");
        assert_eq!(request.overrides["A"], "b=c");
        assert!(request.pin);
    }

    #[test]
    fn test_request_needs_game_or_snapshot() {
        assert!(request(None, None, None, &[], None, None, false).is_err());

        let restore = request(None, None, None, &[], None, Some("abc".to_string()), false).unwrap();
        assert!(restore.game.is_empty());
    }

    #[test]
    fn test_request_rejects_malformed_override() {
        let result = request(
            Some("factorio".to_string()),
            None,
            None,
            &["novalue".to_string()],
            None,
            None,
            false,
        );
        assert!(result.is_err());
    }
}
