use crate::buckets::Interval;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "app-metrics-sidecar",
    version,
    about = "App metrics ingest sidecar and query tool"
)]
pub struct Cli {
    /// Defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume the metrics stream until interrupted.
    Serve,
    /// Re-validate dead letters and commit the ones that now parse.
    RedriveDeadLetters(RedriveArgs),
    DeliveryRate(DeliveryRateArgs),
    TimeSeries(TimeSeriesArgs),
    Errors(ErrorArgs),
    ErrorSamples(ErrorSampleArgs),
}

#[derive(Args, Debug)]
pub struct RedriveArgs {
    #[arg(long, default_value_t = 1000)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct DeliveryRateArgs {
    #[arg(long)]
    pub team_id: i64,
    /// RFC 3339; rows strictly after this instant are counted.
    #[arg(long)]
    pub from: DateTime<Utc>,
}

#[derive(Args, Debug, Clone)]
pub struct IntegrationArgs {
    #[arg(long)]
    pub team_id: i64,
    #[arg(long)]
    pub plugin_config_id: i64,
    #[arg(long, default_value = "processEvent")]
    pub category: String,
    /// Omit to include every job; pass an empty string for rows without a job.
    #[arg(long)]
    pub job_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    #[command(flatten)]
    pub integration: IntegrationArgs,
    /// Inclusive, RFC 3339.
    #[arg(long)]
    pub from: DateTime<Utc>,
    /// Exclusive, RFC 3339.
    #[arg(long)]
    pub to: DateTime<Utc>,
}

#[derive(Args, Debug)]
pub struct TimeSeriesArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
    #[arg(long, default_value = "day")]
    pub interval: Interval,
    #[arg(long, default_value = "UTC")]
    pub timezone: String,
}

#[derive(Args, Debug)]
pub struct ErrorArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
}

/// The newest samples regardless of age.
#[derive(Args, Debug)]
pub struct ErrorSampleArgs {
    #[command(flatten)]
    pub integration: IntegrationArgs,
    #[arg(long)]
    pub error_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve() {
        let cli = Cli::try_parse_from(["app-metrics-sidecar"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_time_series_arguments() {
        let cli = Cli::try_parse_from([
            "app-metrics-sidecar",
            "time-series",
            "--team-id",
            "2",
            "--plugin-config-id",
            "7",
            "--job-id",
            "",
            "--from",
            "2024-01-01T00:00:00Z",
            "--to",
            "2024-01-03T00:00:00Z",
            "--interval",
            "week",
            "--timezone",
            "Europe/Berlin",
        ])
        .unwrap();
        let Some(Command::TimeSeries(args)) = cli.command else {
            panic!("expected time-series");
        };
        assert_eq!(args.scope.integration.team_id, 2);
        assert_eq!(args.scope.integration.job_id.as_deref(), Some(""));
        assert_eq!(args.scope.integration.category, "processEvent");
        assert_eq!(args.interval, Interval::Week);
    }

    #[test]
    fn rejects_unknown_interval() {
        let result = Cli::try_parse_from([
            "app-metrics-sidecar",
            "time-series",
            "--team-id",
            "2",
            "--plugin-config-id",
            "7",
            "--from",
            "2024-01-01T00:00:00Z",
            "--to",
            "2024-01-03T00:00:00Z",
            "--interval",
            "fortnight",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn error_samples_take_no_time_range() {
        let cli = Cli::try_parse_from([
            "app-metrics-sidecar",
            "error-samples",
            "--team-id",
            "2",
            "--plugin-config-id",
            "7",
            "--error-type",
            "TypeError",
        ])
        .unwrap();
        let Some(Command::ErrorSamples(args)) = cli.command else {
            panic!("expected error-samples");
        };
        assert_eq!(args.integration.plugin_config_id, 7);
        assert_eq!(args.error_type, "TypeError");

        let result = Cli::try_parse_from([
            "app-metrics-sidecar",
            "error-samples",
            "--team-id",
            "2",
            "--plugin-config-id",
            "7",
            "--error-type",
            "TypeError",
            "--from",
            "2024-01-01T00:00:00Z",
        ]);
        assert!(result.is_err());
    }
}
