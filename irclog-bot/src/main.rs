mod config;

use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use irclog_sdk::log::{BufferedSink, DailyFileSink, LogFormat, LogObserver};
use irclog_sdk::{Client, Error, Subscription};
use tracing_subscriber::EnvFilter;

use crate::config::{BotConfig, Cli};

/// Lines buffered by the file logger between flushes.
const FILE_BUFFER_LINES: usize = 128;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("irclog=info".parse()?)
                .add_directive("irclog_sdk=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let bot = BotConfig::load(&cli.config).context("cannot load configuration")?;
    tracing::info!(
        servers = bot.servers.len(),
        channels = bot.channels.len(),
        tls = bot.use_tls,
        log_path = %bot.log_path,
        "Starting logger"
    );

    let mut client = Client::new(bot.client_config(&cli));
    client.add_observer(
        Rc::new(LogObserver::new(
            LogFormat::Raw,
            DailyFileSink::new(bot.log_path.clone(), FILE_BUFFER_LINES),
        )),
        Subscription {
            auto_flush: true,
            ..Subscription::default()
        },
    );
    if !bot.silenced {
        client.add_observer(
            Rc::new(LogObserver::new(
                LogFormat::Pretty,
                BufferedSink::new(std::io::stdout(), 0),
            )),
            Subscription {
                send: false,
                ..Subscription::default()
            },
        );
    }

    match client.run().await {
        Ok(()) | Err(Error::Interrupted) => {
            tracing::info!("Logger stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
