//! In-process tick callbacks

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::tick::Tick;

/// Consumer invoked with every tick of the symbol it was registered for.
///
/// Each registered handler runs on its own worker task, so a slow or failing
/// handler only affects itself. Returned errors are logged and counted.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, tick: &Tick) -> anyhow::Result<()>;
}

/// Adapter for plain synchronous closures
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> TickHandler for FnHandler<F>
where
    F: Fn(&Tick) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn on_tick(&self, tick: &Tick) -> anyhow::Result<()> {
        (self.0)(tick)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn TickHandler>
where
    F: Fn(&Tick) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Logs last/bid/ask of every tick
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl TickHandler for LoggingHandler {
    async fn on_tick(&self, tick: &Tick) -> anyhow::Result<()> {
        info!(
            symbol = %tick.symbol,
            last = ?tick.last,
            bid = ?tick.bid,
            ask = ?tick.ask,
            "Tick"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::Symbol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handler_fn_forwards_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |tick| {
            counter.fetch_add(1, Ordering::SeqCst);
            if tick.symbol.as_str() == "FAIL" {
                anyhow::bail!("rejected");
            }
            Ok(())
        });

        assert!(handler.on_tick(&Tick::new(Symbol::parse("AAPL").unwrap())).await.is_ok());
        assert!(handler.on_tick(&Tick::new(Symbol::parse("FAIL").unwrap())).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logging_handler_never_fails() {
        let tick = Tick::new(Symbol::parse("TSLA").unwrap());
        assert!(LoggingHandler.on_tick(&tick).await.is_ok());
    }
}
