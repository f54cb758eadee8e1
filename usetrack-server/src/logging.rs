//! Subscriber setup for the server binary.

use tracing_subscriber::EnvFilter;

const VERBOSE_FILTER: &str =
    "info,usetrack_common=debug,usetrack_store=debug,usetrack_tracker=debug,usetrack_server=debug";

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { "info" }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use usetrack_common::Config;
    use usetrack_tracker::Trackers;

    #[test]
    fn verbose_raises_only_our_crates() {
        assert_eq!(default_filter(false), "info");
        let verbose = default_filter(true);
        assert!(verbose.starts_with("info,"));
        assert!(verbose.contains("usetrack_tracker=debug"));
        assert!(EnvFilter::try_new(verbose).is_ok());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn overflow_log(verbose: bool) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(default_filter(verbose)))
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let mut config = Config::default();
        config.trackers.max_units = 1;
        config.verbose = verbose;
        let trackers = Trackers::new(&config);
        tracing::subscriber::with_default(subscriber, || {
            trackers.views().record("posts/index");
            trackers.views().record("posts/show");
        });
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn verbose_filter_shows_dropped_observations() {
        let log = overflow_log(true);
        assert!(log.contains("observation dropped"), "{log}");
        assert!(log.contains("view:posts/show"), "{log}");
        assert!(overflow_log(false).is_empty());
    }
}
