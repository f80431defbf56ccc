//! Notice handling.
//!
//! Server notices (warnings, `RAISE NOTICE`, …) are passed through a chain of
//! handlers, most recently registered first. A handler returns
//! [`ControlFlow::Break`] to stop the notice from reaching older handlers.
//! When every handler lets a notice through it is logged.

use std::ops::ControlFlow;
use std::sync::Arc;

/// Receives server notices.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, notice: &str) -> ControlFlow<()>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&str) -> ControlFlow<()> + Send + Sync,
{
    fn handle(&self, notice: &str) -> ControlFlow<()> {
        self(notice)
    }
}

/// Swallows every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuietErrorHandler;

impl ErrorHandler for QuietErrorHandler {
    fn handle(&self, _notice: &str) -> ControlFlow<()> {
        ControlFlow::Break(())
    }
}

/// Identifies a registered handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

#[derive(Default)]
pub(crate) struct HandlerChain {
    handlers: Vec<(HandlerToken, Arc<dyn ErrorHandler>)>,
    next_token: u64,
}

impl HandlerChain {
    pub(crate) fn register(&mut self, handler: Arc<dyn ErrorHandler>) -> HandlerToken {
        let token = HandlerToken(self.next_token);
        self.next_token += 1;
        self.handlers.push((token, handler));
        token
    }

    pub(crate) fn unregister(&mut self, token: HandlerToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Run the chain; returns true if some handler stopped the notice.
    pub(crate) fn dispatch(&self, notice: &str) -> bool {
        for (_, handler) in self.handlers.iter().rev() {
            if handler.handle(notice).is_break() {
                return true;
            }
        }
        tracing::info!(target: "pgcore::notice", "{}", notice.trim_end());
        false
    }
}
