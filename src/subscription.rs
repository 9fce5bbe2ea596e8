//! Push-based progressive value delivery.
//!
//! A [`Publisher`] owns the write side of a [`Subscription`]. Every value passed
//! to [`Publisher::update`] is handed synchronously to each registered callback,
//! and [`Publisher::finish`] delivers a single terminal [`Event::Finished`] before
//! releasing the callbacks. Late subscribers only see the most recent value.
//!
//! The state is behind a lock so handles can move between tokio tasks, but the
//! lock is never held while a callback runs: callbacks may call back into the
//! same subscription.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use parking_lot::Mutex;

/// What a callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    Update(T),
    Finished,
}

impl<T> Event<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Event::Update(value) => Some(value),
            Event::Finished => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Event::Finished)
    }
}

type Callback<T> = Box<dyn FnMut(Event<T>) + Send>;

struct State<T> {
    value: Option<T>,
    finished: bool,
    callbacks: Vec<Callback<T>>,
    // set while `update` runs callbacks; nested updates queue here
    delivering: bool,
    pending: VecDeque<T>,
}

/// Read-side handle. Cloning yields another handle to the same subscription.
pub struct Subscription<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Subscription<T> {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                value: None,
                finished: false,
                callbacks: Vec::new(),
                delivering: false,
                pending: VecDeque::new(),
            })),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Whether both handles refer to the same subscription.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// The most recently published value, if any.
    pub fn value(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Register a callback.
    ///
    /// If a value has already been published the callback is invoked with it
    /// immediately. If the subscription already finished, the callback also
    /// receives [`Event::Finished`] right away and is not retained.
    pub fn then<F>(&self, callback: F) -> &Self
    where
        F: FnMut(Event<T>) + Send + 'static,
    {
        let mut callback: Callback<T> = Box::new(callback);

        let (current, finished) = {
            let mut state = self.state.lock();
            if state.value.is_none() && !state.finished {
                state.callbacks.push(callback);
                return self;
            }
            (state.value.clone(), state.finished)
        };

        if let Some(value) = current {
            callback(Event::Update(value));
        }
        if finished {
            callback(Event::Finished);
            return self;
        }

        let mut state = self.state.lock();
        if state.finished {
            drop(state);
            callback(Event::Finished);
        } else {
            state.callbacks.push(callback);
        }
        self
    }

    /// Resolves with the last published value once the subscription finishes.
    pub fn last(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let mut latest = None;

        self.then(move |event| match event {
            Event::Update(value) => latest = Some(value),
            Event::Finished => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(latest.take());
                }
            }
        });

        async move { rx.await.ok().flatten() }
    }

    /// A stream of every value delivered from now on, ending when the
    /// subscription finishes. The current value, if any, is yielded first.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded();
        self.then(move |event| match event {
            Event::Update(value) => {
                let _ = tx.unbounded_send(value);
            }
            Event::Finished => tx.close_channel(),
        });
        rx
    }
}

impl<T: fmt::Debug> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Subscription")
            .field("value", &state.value)
            .field("finished", &state.finished)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

/// Write-side owner of a [`Subscription`].
pub struct Publisher<T> {
    subscription: Subscription<T>,
}

impl<T: Clone + Send + 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Publisher<T> {
    pub fn new() -> Self {
        Self {
            subscription: Subscription::new(),
        }
    }

    pub fn subscription(&self) -> Subscription<T> {
        self.subscription.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.subscription.is_finished()
    }

    /// Publish a new value. Ignored once finished.
    ///
    /// A value published from inside a callback is queued and delivered to
    /// every callback once the current value has reached all of them.
    pub fn update(&self, value: T) {
        let mut callbacks = {
            let mut state = self.subscription.state.lock();
            if state.finished {
                return;
            }
            state.value = Some(value.clone());
            if state.delivering {
                state.pending.push_back(value);
                return;
            }
            state.delivering = true;
            mem::take(&mut state.callbacks)
        };

        let mut next = Some(value);
        while let Some(value) = next {
            for callback in callbacks.iter_mut() {
                callback(Event::Update(value.clone()));
            }
            next = self.subscription.state.lock().pending.pop_front();
        }

        let mut state = self.subscription.state.lock();
        state.delivering = false;
        if state.finished {
            // finished from inside a callback: these missed the terminal signal
            drop(state);
            for callback in callbacks.iter_mut() {
                callback(Event::Finished);
            }
            return;
        }
        // registered mid-delivery; `then` already replayed the latest value
        callbacks.append(&mut state.callbacks);
        state.callbacks = callbacks;
    }

    /// Deliver the terminal signal and release every callback.
    pub fn finish(&self) {
        let callbacks = {
            let mut state = self.subscription.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            mem::take(&mut state.callbacks)
        };

        for mut callback in callbacks {
            callback(Event::Finished);
        }
    }
}
