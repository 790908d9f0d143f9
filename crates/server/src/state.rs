//! Shared handler state.

use std::sync::Arc;

use relay_queue::{
    DeadLetterSink, Dispatcher, DispatcherOptions, MemoryDeadLetterQueue, QueueRegistry,
    TaskHandler,
};

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// The task dispatcher.
    pub dispatcher: Dispatcher,
    /// Terminal failures, newest last.
    pub dead_letters: Arc<MemoryDeadLetterQueue>,
}

impl AppState {
    /// Build a dispatcher over `registry` whose dead letters stay inspectable.
    pub fn new(
        registry: Arc<QueueRegistry>,
        handler: Arc<dyn TaskHandler>,
        options: DispatcherOptions,
    ) -> Self {
        let dead_letters = Arc::new(MemoryDeadLetterQueue::new(options.dead_letter_capacity));
        let dispatcher = Dispatcher::builder(registry, handler)
            .dead_letters(Arc::clone(&dead_letters) as Arc<dyn DeadLetterSink>)
            .options(options)
            .build();

        Self {
            dispatcher,
            dead_letters,
        }
    }
}
