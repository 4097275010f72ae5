//! Synchronous pub/sub with re-entrancy guarantees.
//!
//! An [`Emitter`] maps event names to ordered subscription lists and
//! dispatches synchronously, in insertion order, over a snapshot of those
//! lists - a handler that subscribes or unsubscribes mid-dispatch can never
//! skip or double-invoke the pass already in flight. The special `"all"`
//! channel observes every event together with its name.
//!
//! Emitters also carry the delegated-subscription bookkeeping
//! ([`Emitter::listen_to`] / [`Emitter::stop_listening`]) that lets an object
//! detach from everything it has subscribed to in one call. The bookkeeping
//! holds only weak references; dropping a source never leaks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::entity::Entity;
use crate::ident::next_emitter_id;
use crate::set::EntitySet;
use crate::transport::Method;
use crate::EmitterId;

/// A subscription callback. Identity is `Rc` pointer identity: keep a clone
/// of the handler you registered to remove it selectively later.
pub type Handler = Rc<dyn Fn(&str, &Payload)>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&str, &Payload) + 'static,
{
    Rc::new(f)
}

/// Event payloads carried alongside the event name.
///
/// Entity and set events use the structured variants; user-defined events can
/// carry arbitrary data through [`Payload::Custom`].
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    /// An entity finished an outermost mutation with at least one change.
    Change { entity: Entity },
    /// A single attribute changed value; `value` is the new value, `None`
    /// when the attribute was unset.
    ChangeAttr {
        entity: Entity,
        attr: String,
        value: Option<Value>,
    },
    /// A validation hook rejected a mutation.
    Invalid { error: Value },
    /// An entity joined a set. `index` is the resolved insertion index when
    /// an explicit index was requested.
    Add {
        entity: Entity,
        set: EntitySet,
        index: Option<usize>,
    },
    /// An entity left a set; `index` is the position it was removed from.
    Remove {
        entity: Entity,
        set: EntitySet,
        index: usize,
    },
    /// A set was bulk-replaced; `previous` is the discarded member list.
    Reset {
        set: EntitySet,
        previous: Vec<Entity>,
    },
    /// A set re-sorted its members.
    Sort { set: EntitySet },
    /// An entity was destroyed; `set` is the owner it is leaving, if any.
    Destroy {
        entity: Entity,
        set: Option<EntitySet>,
    },
    /// A transport request is about to be issued.
    Request { method: Method },
    /// The transport resolved successfully with the server representation.
    Sync { response: Value },
    /// The transport reported a failure.
    TransportError { error: Value },
    /// Arbitrary payload for user-defined events.
    Custom(Value),
}

#[derive(Clone)]
struct Subscription {
    callback: Handler,
    /// Owner token for `off`-by-context and `stop_listening` filtering.
    context: Option<EmitterId>,
    /// Spent guard for `once` registrations, shared with any dispatch
    /// snapshots so the callback fires at most once.
    once: Option<Rc<Cell<bool>>>,
}

struct EmitterState {
    id: EmitterId,
    subscriptions: HashMap<String, Vec<Subscription>>,
    /// Reverse edges for delegated unsubscription. Non-owning: removing an
    /// entry never destroys the source.
    listening_to: HashMap<EmitterId, Weak<RefCell<EmitterState>>>,
}

/// A synchronous event emitter. Cloning yields another handle to the same
/// subscription table.
#[derive(Clone)]
pub struct Emitter {
    inner: Rc<RefCell<EmitterState>>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(EmitterState {
                id: next_emitter_id(),
                subscriptions: HashMap::new(),
                listening_to: HashMap::new(),
            })),
        }
    }

    /// The process-local listen id of this emitter, used as an owner token.
    pub fn id(&self) -> EmitterId {
        self.inner.borrow().id
    }

    /// Whether any subscriptions remain, own or foreign.
    pub fn has_subscriptions(&self) -> bool {
        !self.inner.borrow().subscriptions.is_empty()
    }

    /// Register `callback` for each whitespace-separated token in `names`.
    /// `context` tags the subscription with an owner for selective removal.
    pub fn on(&self, names: &str, callback: Handler, context: Option<EmitterId>) {
        self.register(names, callback, context, false);
    }

    /// Like [`Emitter::on`] but the subscription removes itself after its
    /// first invocation. The original handler is stored directly, so `off`
    /// by handler identity matches the pending registration.
    pub fn once(&self, names: &str, callback: Handler, context: Option<EmitterId>) {
        self.register(names, callback, context, true);
    }

    /// Expand a name-to-callback mapping into individual registrations.
    /// Each name may itself hold several whitespace-separated tokens.
    pub fn on_map(&self, entries: &[(&str, Handler)], context: Option<EmitterId>) {
        for (names, callback) in entries {
            self.on(names, callback.clone(), context);
        }
    }

    fn register(&self, names: &str, callback: Handler, context: Option<EmitterId>, once: bool) {
        let mut state = self.inner.borrow_mut();
        for name in names.split_whitespace() {
            state
                .subscriptions
                .entry(name.to_string())
                .or_default()
                .push(Subscription {
                    callback: callback.clone(),
                    context,
                    once: once.then(|| Rc::new(Cell::new(false))),
                });
        }
    }

    /// Selective removal. Filter levels, most specific wins:
    /// no filters clears everything; a name alone clears that name; a
    /// callback and/or context removes only subscriptions matching all
    /// given filters.
    pub fn off(&self, name: Option<&str>, callback: Option<&Handler>, context: Option<EmitterId>) {
        let mut state = self.inner.borrow_mut();
        if name.is_none() && callback.is_none() && context.is_none() {
            state.subscriptions.clear();
            return;
        }

        let names: Vec<String> = match name {
            Some(names) => names.split_whitespace().map(str::to_string).collect(),
            None => state.subscriptions.keys().cloned().collect(),
        };

        for name in names {
            if callback.is_none() && context.is_none() {
                state.subscriptions.remove(&name);
                continue;
            }
            if let Some(subs) = state.subscriptions.get_mut(&name) {
                subs.retain(|sub| {
                    let callback_mismatch =
                        callback.is_some_and(|cb| !Rc::ptr_eq(cb, &sub.callback));
                    let context_mismatch = context.is_some_and(|ctx| sub.context != Some(ctx));
                    callback_mismatch || context_mismatch
                });
                if subs.is_empty() {
                    state.subscriptions.remove(&name);
                }
            }
        }
    }

    /// Dispatch `payload` to every subscription registered for each token in
    /// `names`, then to the `"all"` channel with the event name attached.
    /// Dispatch runs over a snapshot taken before the first invocation.
    pub fn trigger(&self, names: &str, payload: &Payload) {
        for name in names.split_whitespace() {
            self.dispatch(name, payload);
        }
    }

    fn dispatch(&self, name: &str, payload: &Payload) {
        let (named, all) = {
            let state = self.inner.borrow();
            tracing::trace!(event = name, "dispatch");
            (
                state.subscriptions.get(name).cloned().unwrap_or_default(),
                if name == "all" {
                    Vec::new()
                } else {
                    state.subscriptions.get("all").cloned().unwrap_or_default()
                },
            )
        };
        self.run(name, &named, name, payload);
        self.run("all", &all, name, payload);
    }

    fn run(&self, channel: &str, subs: &[Subscription], event: &str, payload: &Payload) {
        for sub in subs {
            if let Some(guard) = &sub.once {
                if guard.replace(true) {
                    continue;
                }
                self.remove_spent(channel, guard);
            }
            (sub.callback)(event, payload);
        }
    }

    /// Drop the live registration behind a spent once-guard.
    fn remove_spent(&self, channel: &str, guard: &Rc<Cell<bool>>) {
        let mut state = self.inner.borrow_mut();
        if let Some(subs) = state.subscriptions.get_mut(channel) {
            subs.retain(|sub| !sub.once.as_ref().is_some_and(|g| Rc::ptr_eq(g, guard)));
            if subs.is_empty() {
                state.subscriptions.remove(channel);
            }
        }
    }

    /// Subscribe to `source` while recording the edge, so that
    /// [`Emitter::stop_listening`] with no arguments can detach this object
    /// from every source it ever listened to.
    pub fn listen_to(&self, source: &Emitter, names: &str, callback: Handler) {
        let own = self.id();
        let source_id = source.id();
        self.inner
            .borrow_mut()
            .listening_to
            .insert(source_id, Rc::downgrade(&source.inner));
        source.on(names, callback, Some(own));
    }

    /// [`Emitter::listen_to`] with a self-removing subscription.
    pub fn listen_to_once(&self, source: &Emitter, names: &str, callback: Handler) {
        let own = self.id();
        let source_id = source.id();
        self.inner
            .borrow_mut()
            .listening_to
            .insert(source_id, Rc::downgrade(&source.inner));
        source.once(names, callback, Some(own));
    }

    /// Detach from `source`, or from every recorded source when `source` is
    /// absent. Bookkeeping entries are dropped when the call is unconditional
    /// (no name, no callback) or when the source ends up with no
    /// subscriptions at all.
    pub fn stop_listening(
        &self,
        source: Option<&Emitter>,
        name: Option<&str>,
        callback: Option<&Handler>,
    ) {
        let own = self.id();
        let unconditional = name.is_none() && callback.is_none();

        let targets: Vec<(EmitterId, Weak<RefCell<EmitterState>>)> = {
            let state = self.inner.borrow();
            match source {
                Some(source) => vec![(source.id(), Rc::downgrade(&source.inner))],
                None => state
                    .listening_to
                    .iter()
                    .map(|(id, weak)| (*id, weak.clone()))
                    .collect(),
            }
        };

        for (source_id, weak) in targets {
            let mut drained = unconditional;
            if let Some(inner) = weak.upgrade() {
                let source = Emitter { inner };
                source.off(name, callback, Some(own));
                if !source.has_subscriptions() {
                    drained = true;
                }
            } else {
                drained = true;
            }
            if drained {
                self.inner.borrow_mut().listening_to.remove(&source_id);
            }
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(state) => f
                .debug_struct("Emitter")
                .field("id", &state.id)
                .field("channels", &state.subscriptions.len())
                .finish(),
            Err(_) => f.debug_struct("Emitter").finish_non_exhaustive(),
        }
    }
}

/// The seam through which entities and sets expose the full emitter surface.
pub trait Observable {
    fn emitter(&self) -> Emitter;

    fn on(&self, names: &str, callback: Handler, context: Option<EmitterId>) {
        self.emitter().on(names, callback, context);
    }

    fn once(&self, names: &str, callback: Handler, context: Option<EmitterId>) {
        self.emitter().once(names, callback, context);
    }

    fn on_map(&self, entries: &[(&str, Handler)], context: Option<EmitterId>) {
        self.emitter().on_map(entries, context);
    }

    fn off(&self, name: Option<&str>, callback: Option<&Handler>, context: Option<EmitterId>) {
        self.emitter().off(name, callback, context);
    }

    fn trigger(&self, names: &str, payload: &Payload) {
        self.emitter().trigger(names, payload);
    }

    fn listen_to(&self, source: &dyn Observable, names: &str, callback: Handler) {
        self.emitter().listen_to(&source.emitter(), names, callback);
    }

    fn listen_to_once(&self, source: &dyn Observable, names: &str, callback: Handler) {
        self.emitter()
            .listen_to_once(&source.emitter(), names, callback);
    }

    fn stop_listening(
        &self,
        source: Option<&dyn Observable>,
        name: Option<&str>,
        callback: Option<&Handler>,
    ) {
        let source = source.map(|s| s.emitter());
        self.emitter().stop_listening(source.as_ref(), name, callback);
    }
}

impl Observable for Emitter {
    fn emitter(&self) -> Emitter {
        self.clone()
    }
}
