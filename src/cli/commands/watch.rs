//! Watch command - run the pipeline until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::args::WatchArgs;
use crate::config::Settings;
use crate::watcher::{CommandGenerator, NotificationBroker, Pipeline};

/// Apply command-line overrides on top of loaded settings.
pub fn apply_overrides(settings: &mut Settings, args: &WatchArgs) {
    if let Some(root) = &args.root {
        settings.watch.watch_root = root.clone();
    }
    if let Some(output) = &args.output {
        settings.watch.output_root = output.clone();
    }
    if let Some(debounce_ms) = args.debounce_ms {
        settings.watch.debounce_ms = debounce_ms;
    }
    if !args.command.is_empty() {
        settings.generator.command = args.command.clone();
    }
}

/// Run the watch command.
pub async fn run(args: WatchArgs, mut settings: Settings) -> Result<()> {
    apply_overrides(&mut settings, &args);
    settings.validate().context("invalid configuration")?;

    let generator = CommandGenerator::new(
        settings.generator.command.clone(),
        &settings.watch.output_root,
        &settings.generator.extension,
    )
    .context("no generator command configured; pass one after `--`")?;

    let broker = NotificationBroker::new(settings.notifications.queue_capacity);
    let pipeline = Pipeline::builder()
        .config(settings.watch.clone())
        .generator(Arc::new(generator))
        .broker(broker.clone())
        .build()
        .context("invalid watch configuration")?;

    let printer = args.events.then(|| {
        let mut subscription = broker.subscribe();
        tokio::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                println!("{}", notification.to_frame());
            }
        })
    });

    pipeline.start().await?;
    eprintln!(
        "Watching {} (Ctrl-C to stop)",
        settings.watch.watch_root.display()
    );

    shutdown_signal().await;
    pipeline.stop().await;

    if let Some(printer) = printer {
        printer.abort();
    }

    println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[watch] failed to install Ctrl-C handler: {e}");
        return;
    }
    eprintln!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_overrides_replace_settings() {
        let mut settings = Settings::default();
        let args = WatchArgs {
            root: Some(PathBuf::from("src")),
            output: Some(PathBuf::from("out")),
            debounce_ms: Some(250),
            events: false,
            command: vec!["cat".to_string()],
        };

        apply_overrides(&mut settings, &args);

        assert_eq!(settings.watch.watch_root, PathBuf::from("src"));
        assert_eq!(settings.watch.output_root, PathBuf::from("out"));
        assert_eq!(settings.watch.debounce_ms, 250);
        assert_eq!(settings.generator.command, vec!["cat"]);
    }

    #[test]
    fn test_missing_overrides_keep_settings() {
        let mut settings = Settings::default();
        apply_overrides(&mut settings, &WatchArgs::default());

        assert_eq!(settings.watch.watch_root, PathBuf::from("apps"));
        assert_eq!(settings.watch.debounce_ms, 2000);
        assert!(settings.generator.command.is_empty());
    }
}
