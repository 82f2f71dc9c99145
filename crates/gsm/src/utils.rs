use colored::{ColoredString, Colorize};
use gsm_core::{DriftAction, ServerRecord, ServerStatus};
use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "gsm=info,gsm_core=info,gsm_cloud=info,gsm_cloud_aws=info,gsm_config=info",
        1 => "gsm=debug,gsm_core=debug,gsm_cloud=debug,gsm_cloud_aws=debug,gsm_config=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Single-quote for a POSIX shell
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn status_colored(status: ServerStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ServerStatus::Running => text.green(),
        ServerStatus::ContainerStopped => text.yellow(),
        ServerStatus::Paused => text.blue(),
        ServerStatus::Provisioning => text.cyan(),
        ServerStatus::Destroyed => text.dimmed(),
    }
}

/// Corrections made by reconciliation, one line each
pub fn print_drift(drift: &[DriftAction]) {
    for action in drift {
        println!("{} {}", "↻".yellow(), action.to_string().dimmed());
    }
}

pub fn print_record(record: &ServerRecord) {
    println!("{}", record.name.bold());
    println!("  {:<14} {}", "id", record.id);
    println!("  {:<14} {}", "game", record.game);
    println!("  {:<14} {}", "status", status_colored(record.status));
    println!("  {:<14} {}", "region", record.region);
    println!(
        "  {:<14} {}",
        "address",
        record
            .connection_string()
            .unwrap_or_else(|| "-".to_string())
            .cyan()
    );
    if let Some(allocation) = &record.allocation_id {
        println!("  {:<14} {} (pinned)", "allocation", allocation);
    }
    println!("  {:<14} {}", "instance", opt(&record.instance_id));
    println!("  {:<14} {}", "volume", opt(&record.volume_id));
    println!("  {:<14} {}", "security group", opt(&record.security_group_id));
    println!("  {:<14} {}", "container", record.container_name);
    println!(
        "  {:<14} {}",
        "created",
        record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if !record.config.is_empty() {
        println!("  {}", "config".dimmed());
        for (key, value) in &record.config {
            println!("    {}={}", key, value);
        }
    }
}

pub fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("hello"), "'hello'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }
}
