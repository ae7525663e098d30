use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::assign;
use crate::conf::Settings;
use crate::extend;
use crate::logger::{self, Logger};
use crate::stats::Stats;
use crate::{BrokerError, Result};

/// State shared by every component of one broker instance.
#[derive(Clone)]
pub struct BrokerContext {
    inner: Arc<BrokerContextInner>,
}

pub struct BrokerContextInner {
    pub settings: Settings,
    pub logger: Logger,
    pub extends: extend::Manager,
    pub stats: Stats,
    pub shutdown: CancellationToken,
}

impl Deref for BrokerContext {
    type Target = BrokerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl BrokerContext {
    pub fn new(settings: Settings) -> Result<Self> {
        let logger = logger::build_logger(&settings.log)?;
        if !settings.log.to.off() && !logger::install(&logger, settings.log.level) {
            slog::debug!(logger, "log facade already routed to another logger");
        }
        Self::with_logger(settings, logger)
    }

    pub fn with_logger(settings: Settings, logger: Logger) -> Result<Self> {
        settings.validate().map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;
        let assignor = assign::by_name(&settings.consumer.assignor)
            .ok_or_else(|| BrokerError::InvalidConfig(format!("unknown assignor {}", settings.consumer.assignor)))?;
        Ok(BrokerContext {
            inner: Arc::new(BrokerContextInner {
                settings,
                logger,
                extends: extend::Manager::new(assignor),
                stats: Stats::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A context that logs nowhere and stores under `data_dir`, with `f` adjusting the
/// remaining settings.
#[cfg(test)]
pub(crate) fn test_context<F>(data_dir: &std::path::Path, f: F) -> BrokerContext
where
    F: FnOnce(&mut crate::conf::Inner),
{
    let mut inner = crate::conf::Inner::default();
    inner.log.to = crate::conf::logging::To::Off;
    inner.storage.data_dir = data_dir.to_path_buf();
    f(&mut inner);
    BrokerContext::new(Settings::from(inner)).unwrap()
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BrokerContext ...")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::logging::To;
    use crate::conf::Inner;

    #[tokio::test]
    async fn builds_configured_assignor() {
        let mut inner = Inner::default();
        inner.log.to = To::Off;
        inner.consumer.assignor = "key_hash".into();
        let ctx = BrokerContext::new(Settings::from(inner)).unwrap();
        assert_eq!(ctx.extends.assignor().await.name(), "key_hash");
        assert!(!ctx.is_shutdown());
    }

    #[test]
    fn rejects_unknown_assignor() {
        let mut inner = Inner::default();
        inner.log.to = To::Off;
        inner.consumer.assignor = "sticky".into();
        assert!(matches!(BrokerContext::new(Settings::from(inner)), Err(BrokerError::InvalidConfig(_))));
    }
}
