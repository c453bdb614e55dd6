//! Onion-style middleware composition.
//!
//! A [`Pipeline`] runs its handlers in order; each handler receives a [`Next`]
//! continuation and may run code before and after delegating. Past the last
//! handler, the terminal callback runs. Each continuation index may be entered
//! at most once per run; a second `next.run()` fails with
//! [`Error::DoubleNext`].

use futures::future::{FutureExt, LocalBoxFuture};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use crate::envelope::Event;
use crate::types::{Error, Result};

/// One step of a pipeline.
pub type MiddlewareHandler = Rc<dyn Fn(Rc<Event>, Next) -> LocalBoxFuture<'static, Result<()>>>;

/// Callback run once the pipeline is exhausted.
pub type Terminal = Rc<dyn Fn(Rc<Event>) -> LocalBoxFuture<'static, Result<()>>>;

/// Wrap an async closure as a [`MiddlewareHandler`].
pub fn handler<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Rc<Event>, Next) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(move |event, next| f(event, next).boxed_local())
}

/// Wrap an async closure as a [`Terminal`].
pub fn terminal<F, Fut>(f: F) -> Terminal
where
    F: Fn(Rc<Event>) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(move |event| f(event).boxed_local())
}

/// Ordered, composed list of middleware handlers.
#[derive(Clone, Default)]
pub struct Pipeline {
    handlers: Rc<Vec<MiddlewareHandler>>,
}

impl Pipeline {
    pub fn compose(handlers: Vec<MiddlewareHandler>) -> Self {
        Self {
            handlers: Rc::new(handlers),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the pipeline over `event`, finishing in `terminal`.
    pub async fn run(&self, event: Rc<Event>, terminal: Terminal) -> Result<()> {
        let chain = Rc::new(Chain {
            handlers: self.handlers.clone(),
            terminal,
            event,
            reached: Cell::new(None),
        });
        Chain::dispatch(chain, 0).await
    }

    /// Use the whole pipeline as one step of an enclosing pipeline; its
    /// terminal continues the outer chain.
    pub fn into_handler(self) -> MiddlewareHandler {
        handler(move |event, next: Next| {
            let pipeline = self.clone();
            async move {
                let outer = terminal(move |_event| {
                    let next = next.clone();
                    async move { next.run().await }
                });
                pipeline.run(event, outer).await
            }
        })
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

struct Chain {
    handlers: Rc<Vec<MiddlewareHandler>>,
    terminal: Terminal,
    event: Rc<Event>,
    // Highest index entered so far.
    reached: Cell<Option<usize>>,
}

impl Chain {
    fn dispatch(chain: Rc<Chain>, index: usize) -> LocalBoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if let Some(reached) = chain.reached.get() {
                if index <= reached {
                    return Err(Error::DoubleNext);
                }
            }
            chain.reached.set(Some(index));

            let event = chain.event.clone();
            match chain.handlers.get(index).cloned() {
                Some(step) => {
                    let next = Next {
                        chain: chain.clone(),
                        index: index + 1,
                    };
                    step(event, next).await
                }
                None => (chain.terminal)(event).await,
            }
        })
    }
}

/// Continuation handed to each middleware step.
#[derive(Clone)]
pub struct Next {
    chain: Rc<Chain>,
    index: usize,
}

impl Next {
    /// Invoke the rest of the pipeline.
    pub async fn run(&self) -> Result<()> {
        Chain::dispatch(self.chain.clone(), self.index).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("index", &self.index).finish()
    }
}
