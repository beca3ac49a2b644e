use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Handle returned by [TracingBuilder::build]. Held for the lifetime of the
/// process; dropping it does not tear down the subscriber.
#[derive(Clone)]
pub struct TracingHandle {
    _private: (),
}

pub struct TracingBuilder {
    level: Level,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
        }
    }
}

impl TracingBuilder {
    /// Set the default log level for the stderr layer. `RUST_LOG` still
    /// takes priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Installs a stderr-writing, compact-formatted subscriber, filtered by
    /// `RUST_LOG` (falling back to the configured level).
    pub fn build(self) -> Result<TracingHandle, Error> {
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new().compact().with_filter(
                EnvFilter::builder()
                    .with_default_directive(self.level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            ),
        );

        subscriber.try_init()?;
        Ok(TracingHandle { _private: () })
    }
}
