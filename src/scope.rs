//! Request-scoped context and its propagation across threads.
//!
//! A [`ScopedContext`] belongs to exactly one request. It holds capabilities
//! bound when the request starts (the budget, the request diagnostics, the
//! executor) and scoped singletons constructed lazily on first use.
//!
//! Work belonging to a request hops between worker threads and async
//! continuations many times. [`ExecutionScope`] keeps a per-thread stack of
//! active contexts; every hop captures the top frame on the submitting side
//! and re-enters it on the executing side, so code deep inside a step can
//! always find the context of the request it runs for.

use std::any::{TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use crate::core::Dynamic;
use crate::error::ScopeError;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScopeKey {
    type_id: TypeId,
    name: &'static str,
}

impl ScopeKey {
    fn of<T: 'static>(name: &'static str) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name,
        }
    }
}

fn downcast<T: Send + Sync + 'static>(value: &Dynamic) -> Arc<T> {
    value
        .clone()
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("Scoped value is not a {}", type_name::<T>()))
}

/// Per-request table from capability keys to instances.
pub struct ScopedContext {
    id: u64,
    parent: Option<Arc<ScopedContext>>,
    bound: HashMap<ScopeKey, Dynamic>,
    singletons: Mutex<HashMap<ScopeKey, Arc<OnceLock<Dynamic>>>>,
    constructed: AtomicUsize,
}

impl ScopedContext {
    /// An empty root context.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ScopeBuilder {
        ScopeBuilder {
            parent: None,
            bound: HashMap::new(),
        }
    }

    /// Starts a context layered over this one. Bindings of this context stay
    /// visible; singletons are memoized separately in the new layer.
    pub fn child(self: &Arc<Self>) -> ScopeBuilder {
        ScopeBuilder {
            parent: Some(self.clone()),
            bound: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<ScopedContext>> {
        self.parent.as_ref()
    }

    fn lookup(&self, key: &ScopeKey) -> Option<&Dynamic> {
        match self.bound.get(key) {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|parent| parent.lookup(key)),
        }
    }

    /// Returns a bound capability or an already constructed singleton.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.get_named::<T>("")
    }

    pub fn get_named<T: Send + Sync + 'static>(&self, name: &'static str) -> Option<Arc<T>> {
        let key = ScopeKey::of::<T>(name);

        if let Some(value) = self.lookup(&key) {
            return Some(downcast(value));
        }

        let singletons = self.singletons.lock().unwrap();
        singletons
            .get(&key)
            .and_then(|cell| cell.get())
            .map(downcast)
    }

    /// Returns the instance for `T`, constructing it with `init` the first
    /// time it is requested in this context. Concurrent callers on different
    /// threads all observe the same instance and `init` runs at most once.
    pub fn get_or_init<T, F>(&self, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.get_or_init_named("", init)
    }

    pub fn get_or_init_named<T, F>(&self, name: &'static str, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = ScopeKey::of::<T>(name);

        if let Some(value) = self.lookup(&key) {
            return downcast(value);
        }

        // The map lock is released before running `init`, which may itself
        // ask this context for other singletons.
        let cell = {
            let mut singletons = self.singletons.lock().unwrap();
            singletons.entry(key).or_default().clone()
        };

        let value = cell.get_or_init(|| {
            self.constructed.fetch_add(1, Ordering::Relaxed);
            Arc::new(init()) as Dynamic
        });

        downcast(value)
    }

    /// Number of singletons constructed in this context so far.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ScopedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedContext")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|parent| parent.id))
            .field("bound", &self.bound.len())
            .field("constructed", &self.constructed())
            .finish()
    }
}

pub struct ScopeBuilder {
    parent: Option<Arc<ScopedContext>>,
    bound: HashMap<ScopeKey, Dynamic>,
}

impl ScopeBuilder {
    pub fn bind<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.bind_named("", value)
    }

    pub fn bind_named<T: Send + Sync + 'static>(mut self, name: &'static str, value: T) -> Self {
        self.bound.insert(ScopeKey::of::<T>(name), Arc::new(value));
        self
    }

    /// Binds an instance that is also held outside the context.
    pub fn bind_shared<T: Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        self.bound.insert(ScopeKey::of::<T>(""), value);
        self
    }

    pub fn build(self) -> Arc<ScopedContext> {
        Arc::new(ScopedContext {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: self.parent,
            bound: self.bound,
            singletons: Mutex::new(HashMap::new()),
            constructed: AtomicUsize::new(0),
        })
    }
}

thread_local! {
    static STACK: RefCell<Vec<Arc<ScopedContext>>> = const { RefCell::new(Vec::new()) };
}

/// The per-thread stack of active [`ScopedContext`] frames.
pub struct ExecutionScope;

impl ExecutionScope {
    /// Pushes `context` on this thread's stack until the guard is dropped.
    pub fn enter(context: Arc<ScopedContext>) -> ScopeGuard {
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(context);
            stack.len()
        });

        ScopeGuard {
            depth,
            _local: PhantomData,
        }
    }

    /// The innermost frame active on this thread.
    pub fn current() -> Option<Arc<ScopedContext>> {
        STACK.with(|stack| stack.borrow().last().cloned())
    }

    pub fn require() -> Result<Arc<ScopedContext>, ScopeError> {
        Self::current().ok_or(ScopeError::OutOfScope)
    }

    pub fn depth() -> usize {
        STACK.with(|stack| stack.borrow().len())
    }

    /// Wraps `work` so that it runs inside `context` on whichever thread
    /// eventually calls it.
    pub fn start_scope<F, R>(context: Arc<ScopedContext>, work: F) -> impl FnOnce() -> R + Send
    where
        F: FnOnce() -> R + Send,
    {
        move || {
            let _guard = ExecutionScope::enter(context);
            work()
        }
    }

    /// Captures the calling thread's current frame and wraps `work` to run
    /// inside it later, possibly on another thread.
    pub fn continue_scope<F, R>(work: F) -> Result<impl FnOnce() -> R + Send, ScopeError>
    where
        F: FnOnce() -> R + Send,
    {
        let context = Self::require()?;
        Ok(Self::start_scope(context, work))
    }

    /// Enters `context` around every poll of `future`.
    pub fn scope_future<F: Future>(context: Arc<ScopedContext>, future: F) -> Scoped<F> {
        Scoped {
            context,
            future: Box::pin(future),
        }
    }
}

/// Pops its frame when dropped, including during unwinding.
#[must_use = "the scope is exited as soon as the guard is dropped"]
pub struct ScopeGuard {
    depth: usize,
    // Frames belong to the thread that pushed them.
    _local: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "scope guards dropped out of order");
            stack.pop();
        });
    }
}

/// Future returned by [`ExecutionScope::scope_future`].
pub struct Scoped<F> {
    context: Arc<ScopedContext>,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = ExecutionScope::enter(self.context.clone());
        self.future.as_mut().poll(cx)
    }
}
