use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use leasehold::SubscriptionConfig;

/// Runtime configuration for the `leasehold-demo` binary.
///
/// The demo seeds an in-memory queue with `message_count` messages spread
/// over `group_count` ordering groups, then consumes them with a single
/// subscription. All values are parsed from CLI arguments or environment
/// variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "leasehold-demo",
    version,
    about = "Consumes a seeded in-memory queue with a leasehold subscription"
)]
pub struct CliArgs {
    /// Queue to publish to and consume from.
    ///
    /// Environment variable: `QUEUE`
    #[arg(long, env = "QUEUE", default_value_t = String::from("demo"))]
    pub queue: String,

    /// Maximum number of messages handled concurrently. Also the number of
    /// workers.
    ///
    /// Environment variable: `MAX_MESSAGES`
    #[arg(long, env = "MAX_MESSAGES", default_value_t = 8)]
    pub max_messages: usize,

    /// Upper bound on messages fetched by a single receive. Defaults to
    /// `min(MAX_MESSAGES, 10)`.
    ///
    /// Environment variable: `BATCH_SIZE`
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Number of messages published before consuming starts.
    ///
    /// Environment variable: `MESSAGE_COUNT`
    #[arg(long, env = "MESSAGE_COUNT", default_value_t = 200)]
    pub message_count: u64,

    /// Number of distinct group ids the messages are spread over.
    ///
    /// Environment variable: `GROUP_COUNT`
    #[arg(long, env = "GROUP_COUNT", default_value_t = 4)]
    pub group_count: u64,

    /// Simulated processing time per message, in milliseconds.
    ///
    /// Environment variable: `HANDLER_MS`
    #[arg(long, env = "HANDLER_MS", default_value_t = 50)]
    pub handler_ms: u64,

    /// Leave the first delivery of every n-th message unacknowledged so it
    /// is redelivered after its lease lapses. `0` disables this.
    ///
    /// Environment variable: `SKIP_EVERY`
    #[arg(long, env = "SKIP_EVERY", default_value_t = 0)]
    pub skip_every: u64,

    /// Long-poll wait of one receive, in seconds.
    ///
    /// Environment variable: `WAIT_TIME_SECS`
    #[arg(long, env = "WAIT_TIME_SECS", default_value_t = 1)]
    pub wait_time_secs: u64,

    /// Lease granted on receive, in seconds.
    ///
    /// Environment variable: `VISIBILITY_TIMEOUT_SECS`
    #[arg(long, env = "VISIBILITY_TIMEOUT_SECS", default_value_t = 10)]
    pub visibility_timeout_secs: u64,

    /// Delay between lease extensions, in seconds.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_SECS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 3)]
    pub heartbeat_interval_secs: u64,

    /// Lease requested by each extension, in seconds.
    ///
    /// Environment variable: `HEARTBEAT_EXTENSION_SECS`
    #[arg(long, env = "HEARTBEAT_EXTENSION_SECS", default_value_t = 6)]
    pub heartbeat_extension_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub subscription: SubscriptionConfig,
    pub message_count: u64,
    pub group_count: u64,
    pub handler_time: Duration,
    pub skip_every: u64,
}

impl TryFrom<CliArgs> for DemoConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.message_count == 0 {
            bail!("MESSAGE_COUNT must be greater than 0");
        }
        if args.group_count == 0 {
            bail!("GROUP_COUNT must be greater than 0");
        }

        let mut subscription = SubscriptionConfig::new(args.queue, args.max_messages)
            .with_wait_time(Duration::from_secs(args.wait_time_secs))
            .with_visibility_timeout(Duration::from_secs(args.visibility_timeout_secs))
            .with_heartbeat(
                Duration::from_secs(args.heartbeat_interval_secs),
                Duration::from_secs(args.heartbeat_extension_secs),
            );
        if let Some(batch_size) = args.batch_size {
            subscription = subscription.with_batch_size(batch_size);
        }

        if let Err(e) = subscription.validate() {
            bail!("{e}");
        }

        Ok(Self {
            subscription,
            message_count: args.message_count,
            group_count: args.group_count,
            handler_time: Duration::from_millis(args.handler_ms),
            skip_every: args.skip_every,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<DemoConfig> {
        let args = CliArgs::try_parse_from(
            core::iter::once("leasehold-demo").chain(args.iter().copied()),
        )?;
        DemoConfig::try_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.subscription.max_messages, 8);
        assert_eq!(config.subscription.batch_size, 8);
        assert_eq!(config.message_count, 200);
    }

    #[test]
    fn batch_size_override() {
        let config = parse(&["--max-messages", "32", "--batch-size", "5"]).unwrap();
        assert_eq!(config.subscription.batch_size, 5);
    }

    #[test]
    fn rejects_invalid_heartbeat() {
        let err = parse(&[
            "--heartbeat-interval-secs",
            "10",
            "--heartbeat-extension-secs",
            "5",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat_extension"));
    }

    #[test]
    fn rejects_empty_workload() {
        assert!(parse(&["--message-count", "0"]).is_err());
        assert!(parse(&["--max-messages", "0"]).is_err());
    }
}
